//! Legacy 8259 PIC (Programmable Interrupt Controller) driver.
//!
//! The kernel takes every interrupt through the Local APIC. The 8259 pair
//! still has to be remapped away from the exception vectors and masked, or a
//! stray legacy IRQ would be delivered as a CPU exception.

use crate::port::{io_wait, outb};

/// I/O port addresses for the master PIC.
const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;

/// I/O port addresses for the slave PIC.
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// ICW1: begin initialization, ICW4 follows.
const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
/// ICW4: 8086/88 mode.
const ICW4_8086: u8 = 0x01;

/// Legacy IRQs land on 0xE0..0xEF: above the timer and exit vectors and
/// below the APIC spurious vector, so a spurious 8259 IRQ is recognisable.
pub const PIC1_OFFSET: u8 = 0xE0;
pub const PIC2_OFFSET: u8 = 0xE8;

/// Remap the 8259 PIC pair and then mask every IRQ line.
///
/// Must run before the Local APIC is enabled.
pub fn disable() {
    unsafe {
        // ICW1: begin initialization (cascade mode, ICW4 needed)
        outb(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        outb(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();

        // ICW2: vector offsets
        outb(PIC1_DATA, PIC1_OFFSET);
        io_wait();
        outb(PIC2_DATA, PIC2_OFFSET);
        io_wait();

        // ICW3: slave on IRQ2
        outb(PIC1_DATA, 4);
        io_wait();
        outb(PIC2_DATA, 2);
        io_wait();

        // ICW4: 8086 mode
        outb(PIC1_DATA, ICW4_8086);
        io_wait();
        outb(PIC2_DATA, ICW4_8086);
        io_wait();

        // Mask everything.
        outb(PIC1_DATA, 0xFF);
        outb(PIC2_DATA, 0xFF);
    }
}
