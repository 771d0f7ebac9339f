//! Interrupt Descriptor Table (IDT) for x86_64.
//!
//! One table is built by the boot CPU and loaded by every core. Entries
//! point at the assembly stubs in `traps::entry`.

use core::arch::asm;
use core::mem::size_of;

use kcore::arch::KERNEL_CODE_SELECTOR;

/// x86_64 supports 256 interrupt vectors (0-255).
const IDT_ENTRIES: usize = 256;

/// Gate type for IDT entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(dead_code)]
pub enum GateType {
    /// Interrupt gate - disables interrupts on entry.
    Interrupt = 0b1110,
    /// Trap gate - does not disable interrupts on entry.
    Trap = 0b1111,
}

/// Options for an IDT entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct EntryOptions(u16);

impl EntryOptions {
    /// Not present, DPL 0, interrupt gate, no IST.
    #[inline]
    pub const fn new() -> Self {
        Self(0b0000_1110_0000_0000)
    }

    #[inline]
    pub const fn set_present(mut self, present: bool) -> Self {
        if present {
            self.0 |= 1 << 15;
        } else {
            self.0 &= !(1 << 15);
        }
        self
    }

    #[inline]
    pub const fn set_gate_type(mut self, gate_type: GateType) -> Self {
        self.0 = (self.0 & 0xF0FF) | ((gate_type as u16) << 8);
        self
    }

    /// Switch to IST stack `ist_index` (1-7) on entry; 0 keeps the
    /// interrupted stack.
    #[inline]
    pub const fn set_stack_index(mut self, ist_index: u8) -> Self {
        self.0 = (self.0 & 0xFFF8) | (ist_index as u16 & 0x7);
        self
    }

    /// Present interrupt gate, the only kind the kernel installs.
    pub const fn interrupt_gate() -> Self {
        Self::new().set_present(true).set_gate_type(GateType::Interrupt)
    }
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// An entry in the Interrupt Descriptor Table (16 bytes).
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    options: EntryOptions,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    #[inline]
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            options: EntryOptions::new(),
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    #[inline]
    pub const fn new(handler: usize, selector: u16, options: EntryOptions) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            options,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; IDT_ENTRIES],
}

impl Idt {
    /// All 256 vectors not present: an unexpected vector raises #GP, which
    /// is itself reported.
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::missing(); IDT_ENTRIES],
        }
    }

    /// Points `vector` at `handler` in the kernel code segment.
    pub fn set_handler(&mut self, vector: u8, handler: usize, options: EntryOptions) {
        self.entries[vector as usize] =
            IdtEntry::new(handler, KERNEL_CODE_SELECTOR as u16, options);
    }

    /// Load this IDT into the executing CPU using the `lidt` instruction.
    pub fn load(&'static self) {
        let ptr = IdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const _ as u64,
        };

        unsafe {
            asm!(
                "lidt [{}]",
                in(reg) &ptr,
                options(readonly, nostack, preserves_flags)
            );
        }
    }
}

/// Pointer structure for the `lidt` instruction.
#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}
