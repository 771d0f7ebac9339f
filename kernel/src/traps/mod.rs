//! Interrupt and trap handling.
//!
//! | vector | entry                    | stack        |
//! |--------|--------------------------|--------------|
//! | 0      | divide error             | interrupted  |
//! | 6      | invalid opcode           | interrupted  |
//! | 8      | double fault             | IST1         |
//! | 13     | general protection       | interrupted  |
//! | 14     | page fault               | interrupted  |
//! | 32     | APIC timer (scheduling)  | IST2         |
//! | 0x81   | process exit             | IST2         |
//! | 0xFF   | APIC spurious            | interrupted  |

mod entry;
mod handlers;

use spin::Once;

use crate::arch::idt::{EntryOptions, Idt};
use crate::arch::tss::{DOUBLE_FAULT_IST, TRAP_IST};

/// Software interrupt a process raises to terminate itself.
pub const EXIT_VECTOR: u8 = 0x81;

/// Shared by every core.
static IDT: Once<Idt> = Once::new();

fn build() -> Idt {
    let mut idt = Idt::new();
    let gate = EntryOptions::interrupt_gate();

    idt.set_handler(0, entry::divide_error_entry as usize, gate);
    idt.set_handler(6, entry::invalid_opcode_entry as usize, gate);
    idt.set_handler(
        8,
        entry::double_fault_entry as usize,
        gate.set_stack_index(DOUBLE_FAULT_IST),
    );
    idt.set_handler(13, entry::general_protection_entry as usize, gate);
    idt.set_handler(14, entry::page_fault_entry as usize, gate);

    idt.set_handler(
        khal::apic::TIMER_VECTOR,
        entry::timer_entry as usize,
        gate.set_stack_index(TRAP_IST),
    );
    idt.set_handler(
        EXIT_VECTOR,
        entry::exit_entry as usize,
        gate.set_stack_index(TRAP_IST),
    );
    idt.set_handler(khal::apic::SPURIOUS_VECTOR, entry::spurious_entry as usize, gate);
    idt
}

/// Loads the IDT on the executing core, building it on first use.
pub fn load_idt() {
    IDT.call_once(build).load();
}
