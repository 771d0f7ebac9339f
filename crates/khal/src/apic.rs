//! Local APIC (Advanced Programmable Interrupt Controller) driver.
//!
//! Each CPU core has its own Local APIC. The kernel uses it for:
//! - the CPU's hardware id
//! - the periodic timer that drives scheduling
//! - end-of-interrupt signalling
//!
//! The APIC registers are memory-mapped starting at the base address
//! stored in the IA32_APIC_BASE MSR (0x1B). Every core sees its own APIC at
//! the same physical address, so one mapping serves all of them.

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::registers::model_specific::Msr;

use crate::pit;

/// IA32_APIC_BASE Model Specific Register.
const IA32_APIC_BASE_MSR: u32 = 0x1B;

/// Bit 11 of IA32_APIC_BASE MSR: Global APIC enable/disable.
const APIC_BASE_ENABLE: u64 = 1 << 11;

// --- APIC Register Offsets (from APIC base address) ---

/// Local APIC ID Register.
const APIC_REG_ID: u32 = 0x020;
/// Task Priority Register.
const APIC_REG_TPR: u32 = 0x080;
/// End of Interrupt Register.
const APIC_REG_EOI: u32 = 0x0B0;
/// Spurious Interrupt Vector Register.
const APIC_REG_SVR: u32 = 0x0F0;
/// LVT Timer Register.
const APIC_REG_LVT_TIMER: u32 = 0x320;
/// Timer Initial Count Register.
const APIC_REG_TIMER_INIT: u32 = 0x380;
/// Timer Current Count Register.
const APIC_REG_TIMER_CURRENT: u32 = 0x390;
/// Timer Divide Configuration Register.
const APIC_REG_TIMER_DIV: u32 = 0x3E0;

/// SVR bit 8: APIC Software Enable.
const SVR_APIC_ENABLE: u32 = 1 << 8;

/// Spurious interrupt vector number.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Timer interrupt vector number.
pub const TIMER_VECTOR: u8 = 32;

/// LVT bit 17: periodic mode.
const TIMER_PERIODIC: u32 = 1 << 17;
/// LVT bit 16: masked.
const LVT_MASKED: u32 = 1 << 16;

/// Timer divider values for APIC_REG_TIMER_DIV.
#[allow(dead_code)]
#[derive(Clone, Copy)]
#[repr(u32)]
pub enum TimerDivide {
    By1   = 0b1011,
    By2   = 0b0000,
    By4   = 0b0001,
    By8   = 0b0010,
    By16  = 0b0011,
    By32  = 0b1000,
    By64  = 0b1001,
    By128 = 0b1010,
}

/// Virtual address of the APIC register page (HHDM + physical base).
static APIC_BASE: AtomicU64 = AtomicU64::new(0);

/// Read a 32-bit APIC register.
#[inline]
unsafe fn read_reg(offset: u32) -> u32 {
    let addr = APIC_BASE.load(Ordering::Relaxed) + offset as u64;
    unsafe { ptr::read_volatile(addr as *const u32) }
}

/// Write a 32-bit APIC register.
#[inline]
unsafe fn write_reg(offset: u32, value: u32) {
    let addr = APIC_BASE.load(Ordering::Relaxed) + offset as u64;
    unsafe { ptr::write_volatile(addr as *mut u32, value) }
}

/// Physical address of the APIC register page, from IA32_APIC_BASE.
///
/// The page is device memory: it has to be mapped (uncached) at
/// `hhdm_offset + physical_base()` before [`init`].
pub fn physical_base() -> u64 {
    let msr = Msr::new(IA32_APIC_BASE_MSR);
    unsafe { msr.read() & 0x000F_FFFF_FFFF_F000 }
}

/// Whether [`init`] has run on some CPU.
pub fn is_initialized() -> bool {
    APIC_BASE.load(Ordering::Relaxed) != 0
}

/// Initialize and enable the Local APIC of the calling CPU.
///
/// 1. Reads the APIC base address from the IA32_APIC_BASE MSR
/// 2. Converts it to a virtual address using the HHDM offset
/// 3. Ensures the global APIC enable bit is set
/// 4. Software-enables the APIC through the Spurious Interrupt Vector
/// 5. Sets the Task Priority Register to 0 (accept all interrupts)
///
/// Every CPU must call this once. Returns the APIC id of the caller.
pub fn init(hhdm_offset: u64) -> u32 {
    let mut msr = Msr::new(IA32_APIC_BASE_MSR);
    unsafe {
        let msr_value = msr.read();
        let phys_base = msr_value & 0x000F_FFFF_FFFF_F000;
        APIC_BASE.store(hhdm_offset + phys_base, Ordering::Relaxed);

        if msr_value & APIC_BASE_ENABLE == 0 {
            msr.write(msr_value | APIC_BASE_ENABLE);
        }

        write_reg(APIC_REG_SVR, SVR_APIC_ENABLE | SPURIOUS_VECTOR as u32);
        write_reg(APIC_REG_TPR, 0);
    }
    id()
}

/// APIC id of the calling CPU.
pub fn id() -> u32 {
    unsafe { read_reg(APIC_REG_ID) >> 24 }
}

/// Send an End of Interrupt (EOI) signal to the Local APIC.
///
/// Must be called at the end of every APIC-sourced interrupt handler.
#[inline]
pub fn eoi() {
    unsafe {
        write_reg(APIC_REG_EOI, 0);
    }
}

/// Measures the timer's count rate at `divider`, in counts per millisecond,
/// against PIT channel 2.
///
/// All cores share the bus clock, so the boot CPU measures once and every
/// CPU reuses the result.
pub fn calibrate_timer(divider: TimerDivide) -> u32 {
    const SAMPLE_MS: u32 = 10;
    unsafe {
        write_reg(APIC_REG_TIMER_DIV, divider as u32);
        write_reg(APIC_REG_LVT_TIMER, LVT_MASKED | TIMER_VECTOR as u32);
        write_reg(APIC_REG_TIMER_INIT, u32::MAX);

        pit::wait_ms(SAMPLE_MS);

        let remaining = read_reg(APIC_REG_TIMER_CURRENT);
        write_reg(APIC_REG_TIMER_INIT, 0);
        (u32::MAX - remaining) / SAMPLE_MS
    }
}

/// Enable the Local APIC Timer in periodic mode.
///
/// * `vector` - Interrupt vector number for timer interrupts
/// * `initial_count` - Timer initial count value
/// * `divider` - Timer frequency divider
pub fn enable_timer(vector: u8, initial_count: u32, divider: TimerDivide) {
    unsafe {
        write_reg(APIC_REG_TIMER_DIV, divider as u32);
        write_reg(APIC_REG_LVT_TIMER, TIMER_PERIODIC | vector as u32);
        write_reg(APIC_REG_TIMER_INIT, initial_count);
    }
}

/// Mask the Local APIC Timer. Does nothing before [`init`].
pub fn disable_timer() {
    if !is_initialized() {
        return;
    }
    unsafe {
        let lvt = read_reg(APIC_REG_LVT_TIMER);
        write_reg(APIC_REG_LVT_TIMER, lvt | LVT_MASKED);
    }
}
