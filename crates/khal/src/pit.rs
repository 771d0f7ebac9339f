//! 8254 PIT (Programmable Interval Timer), channel 2 only.
//!
//! Channel 2 can be gated and polled through port 0x61 without raising an
//! interrupt, which makes it a usable fixed-frequency reference while the
//! Local APIC timer is being calibrated.

use crate::port::{inb, outb};

/// PIT input clock in Hz.
pub const PIT_HZ: u32 = 1_193_182;

const CHANNEL2_DATA: u16 = 0x42;
const COMMAND: u16 = 0x43;
/// Keyboard controller port B: bit 0 gates channel 2, bit 1 drives the
/// speaker, bit 5 mirrors the channel 2 output.
const PORT_B: u16 = 0x61;

const GATE: u8 = 1 << 0;
const SPEAKER: u8 = 1 << 1;
const OUT2: u8 = 1 << 5;

/// Longest wait the 16-bit counter can express.
pub const MAX_WAIT_MS: u32 = 54;

/// Busy-waits for `ms` milliseconds (clamped to [`MAX_WAIT_MS`]).
pub fn wait_ms(ms: u32) {
    let ms = ms.clamp(1, MAX_WAIT_MS);
    let count = PIT_HZ / 1000 * ms;

    unsafe {
        // Gate on, speaker off.
        let ctl = inb(PORT_B);
        outb(PORT_B, (ctl & !SPEAKER) | GATE);

        // Channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count).
        outb(COMMAND, 0b1011_0000);
        outb(CHANNEL2_DATA, count as u8);
        outb(CHANNEL2_DATA, (count >> 8) as u8);

        // Re-trigger the gate so counting starts now.
        let ctl = inb(PORT_B);
        outb(PORT_B, ctl & !GATE);
        outb(PORT_B, ctl | GATE);

        while inb(PORT_B) & OUT2 == 0 {
            core::hint::spin_loop();
        }
    }
}
