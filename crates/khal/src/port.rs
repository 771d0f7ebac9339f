//! x86 port I/O primitives.
//!
//! Thin byte-wide wrappers over `x86_64::instructions::port::Port`, for the
//! legacy devices that are driven one register write at a time.

use x86_64::instructions::port::Port;

/// Write a byte to an x86 I/O port.
///
/// # Safety
///
/// Writing to an arbitrary I/O port can have side effects on hardware.
/// The caller must ensure the port and value are valid.
#[inline]
pub unsafe fn outb(port: u16, value: u8) {
    unsafe { Port::<u8>::new(port).write(value) }
}

/// Read a byte from an x86 I/O port.
///
/// # Safety
///
/// Reading from an arbitrary I/O port can have side effects on hardware.
/// The caller must ensure the port is valid.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    unsafe { Port::<u8>::new(port).read() }
}

/// Short delay for devices that need time between commands: a write to
/// the unused POST port.
#[inline]
pub fn io_wait() {
    // SAFETY: port 0x80 is the POST diagnostic port; writes are harmless.
    unsafe { outb(0x80, 0) }
}
