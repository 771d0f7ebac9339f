//! Hosted backend: simulated CPUs on host threads.
//!
//! A thread becomes a CPU by calling [`boot_cpu`]. From then on it has its
//! own interrupt flag, hardware id and CPU-local base register, all kept in
//! thread-local storage. Interrupts are never actually delivered; the flag
//! is bookkeeping that the locking protocol must keep correct.

use core::cell::Cell;
use core::fmt;

use crate::percpu;

/// Simulated hardware id (plays the role of the local APIC id).
pub type HardwareId = u32;

struct SimCpu {
    hardware_id: Cell<Option<HardwareId>>,
    interrupts: Cell<bool>,
    local_base: Cell<usize>,
    id_queries: Cell<u64>,
}

std::thread_local! {
    static CPU: SimCpu = const {
        SimCpu {
            hardware_id: Cell::new(None),
            interrupts: Cell::new(false),
            local_base: Cell::new(0),
            id_queries: Cell::new(0),
        }
    };
}

/// Turns the calling thread into simulated CPU `hardware_id`.
///
/// Interrupts start enabled, as on a CPU that is already running kernel
/// code, and the CPU-local base points at the boot placeholder until the
/// thread attaches to a [`PerCpuRegistry`](crate::PerCpuRegistry).
pub fn boot_cpu(hardware_id: HardwareId) {
    CPU.with(|cpu| {
        cpu.hardware_id.set(Some(hardware_id));
        cpu.interrupts.set(true);
    });
    percpu::early_init();
}

/// Hardware id the calling thread was booted as, if any.
pub fn bound_cpu() -> Option<HardwareId> {
    CPU.with(|cpu| cpu.hardware_id.get())
}

pub fn interrupts_enabled() -> bool {
    CPU.with(|cpu| cpu.interrupts.get())
}

pub fn disable_interrupts() {
    CPU.with(|cpu| cpu.interrupts.set(false));
}

pub fn enable_interrupts() {
    CPU.with(|cpu| cpu.interrupts.set(true));
}

pub fn relax() {
    std::thread::yield_now();
}

/// How many times the calling thread has run the slow hardware query.
pub fn hardware_id_queries() -> u64 {
    CPU.with(|cpu| cpu.id_queries.get())
}

pub fn hardware_id() -> HardwareId {
    CPU.with(|cpu| cpu.id_queries.set(cpu.id_queries.get() + 1));
    bound_cpu().unwrap_or_else(|| panic!("thread is not bound to a simulated cpu"))
}

pub fn local_base() -> usize {
    CPU.with(|cpu| cpu.local_base.get())
}

/// # Safety
/// `base` must stay valid while this thread reads CPU-local words.
pub unsafe fn set_local_base(base: usize) {
    CPU.with(|cpu| cpu.local_base.set(base));
}

pub fn read_local_word(offset: usize) -> usize {
    let base = local_base();
    if base == 0 {
        panic!("thread is not bound to a simulated cpu");
    }
    // SAFETY: `set_local_base` callers guarantee the area is live and
    // large enough for the header words read through this path.
    unsafe { ((base + offset) as *const usize).read() }
}

/// Halting a simulated CPU unwinds its thread.
pub fn halt_cpu(reason: fmt::Arguments<'_>) -> ! {
    disable_interrupts();
    match bound_cpu() {
        Some(id) => panic!("cpu {id} halted: {reason}"),
        None => panic!("cpu halted: {reason}"),
    }
}

pub fn wait_for_interrupt() {
    enable_interrupts();
    std::thread::yield_now();
}
