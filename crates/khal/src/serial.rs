//! Serial port (COM1 UART 16550) driver.
//!
//! Output only, polled. Normal output goes through a lock so records from
//! different CPUs come out whole; the panic path has an unlocked writer,
//! since the panicking CPU may itself be holding that lock.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::port::{inb, outb};

/// COM1 base port address
const COM1_PORT: u16 = 0x3F8;

/// Set once the UART has been programmed.
static READY: AtomicBool = AtomicBool::new(false);

/// Serial port driver for COM1
pub struct Serial {
    _private: (),
}

impl Serial {
    const fn new() -> Self {
        Self { _private: () }
    }

    /// Initialize the serial port (115200 baud, 8N1). Returns whether the
    /// loopback self-test passed.
    fn init(&mut self) -> bool {
        let loopback_ok;
        unsafe {
            // Disable all interrupts
            outb(COM1_PORT + 1, 0x00);

            // Enable DLAB (set baud rate divisor)
            outb(COM1_PORT + 3, 0x80);

            // Set divisor to 1 (115200 baud)
            outb(COM1_PORT, 0x01);
            outb(COM1_PORT + 1, 0x00);

            // 8 bits, no parity, one stop bit (clear DLAB)
            outb(COM1_PORT + 3, 0x03);

            // Enable FIFO, clear them, with 14-byte threshold
            outb(COM1_PORT + 2, 0xC7);

            // Loopback self-test
            outb(COM1_PORT + 4, 0x1E);
            outb(COM1_PORT, 0xAE);
            loopback_ok = inb(COM1_PORT) == 0xAE;

            // Normal operation (OUT1, OUT2, RTS, DTR), interrupts stay off:
            // we poll. A failed self-test is not fatal, emulators often
            // fake the loopback.
            outb(COM1_PORT + 4, 0x0F);
            outb(COM1_PORT + 1, 0x00);
        }
        READY.store(true, Ordering::Release);
        loopback_ok
    }

    /// Check if transmit buffer is empty
    fn is_transmit_empty() -> bool {
        unsafe { inb(COM1_PORT + 5) & 0x20 != 0 }
    }

    /// Write a byte to the serial port
    pub fn write_byte(&self, byte: u8) {
        if !READY.load(Ordering::Acquire) {
            return;
        }

        while !Self::is_transmit_empty() {
            core::hint::spin_loop();
        }

        unsafe {
            outb(COM1_PORT, byte);
        }
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// Global serial port instance (COM1)
static SERIAL: Mutex<Serial> = Mutex::new(Serial::new());

/// Initialize the global serial port
pub fn init() -> bool {
    SERIAL.lock().init()
}

/// Write formatted arguments to the serial port.
///
/// Callers that can be interrupted by code that also logs must disable
/// interrupts around this (the lock is not interrupt-safe on its own).
pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    // The UART never reports an error.
    let _ = SERIAL.lock().write_fmt(args);
}

/// Write formatted arguments without taking the serial lock.
///
/// Only for the panic path: output may interleave with another CPU's.
pub fn write_fmt_unlocked(args: fmt::Arguments) {
    use fmt::Write;
    let _ = Serial::new().write_fmt(args);
}
