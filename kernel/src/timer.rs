//! Scheduling tick: the Local APIC timer in periodic mode.
//!
//! The boot CPU measures the APIC timer rate once against the PIT; every
//! core then programs its own timer with the same initial count.

use core::sync::atomic::{AtomicU32, Ordering};

use khal::apic::{self, TimerDivide};

const DIVIDE: TimerDivide = TimerDivide::By16;

/// Initial count for one tick, 0 until calibrated.
static TICK_COUNT: AtomicU32 = AtomicU32::new(0);

/// Measures the timer and derives the count for `tick_hz` ticks a second.
pub fn calibrate(tick_hz: u32) {
    let per_ms = apic::calibrate_timer(DIVIDE);
    let count = (u64::from(per_ms) * 1000 / u64::from(tick_hz.max(1))).clamp(1, u64::from(u32::MAX));
    TICK_COUNT.store(count as u32, Ordering::Relaxed);
    log::info!("timer: {} counts/ms, {} Hz tick = {} counts", per_ms, tick_hz, count);
}

/// Starts the periodic tick on the executing CPU.
pub fn start() {
    match TICK_COUNT.load(Ordering::Relaxed) {
        0 => log::warn!("timer: not calibrated, {} runs without preemption", kcore::cpu_id()),
        count => apic::enable_timer(apic::TIMER_VECTOR, count, DIVIDE),
    }
}
