// =============================================================================
// Trellis — Architecture Seam
// =============================================================================
//
// The core never touches hardware directly. Everything it needs from the CPU
// is in this module:
//
//   interrupts_enabled / disable_interrupts / enable_interrupts
//   relax              PAUSE inside spin loops
//   hardware_id        the slow "who am I" query (CPUID / APIC id)
//   local_base         current value of the CPU-local base register
//   set_local_base     point the CPU-local base register at a per-CPU area
//   read_local_word    load a word relative to the CPU-local base
//   halt_cpu           stop this CPU for good
//   wait_for_interrupt idle until the next interrupt
//
// On the bare-metal target the backend is `x86`. Under `cargo test` or with
// the `hosted` feature it is `hosted`, where each host thread simulates one
// CPU with its own interrupt flag and base register.
// =============================================================================

#[cfg(not(any(test, feature = "hosted")))]
mod x86;
#[cfg(not(any(test, feature = "hosted")))]
pub use self::x86::*;

#[cfg(any(test, feature = "hosted"))]
pub mod hosted;
#[cfg(any(test, feature = "hosted"))]
pub use self::hosted::{
    HardwareId, disable_interrupts, enable_interrupts, halt_cpu, hardware_id,
    interrupts_enabled, local_base, read_local_word, relax, set_local_base, wait_for_interrupt,
};

/// GDT selector of the kernel code segment (the kernel's GDT puts it at 0x08).
pub const KERNEL_CODE_SELECTOR: u64 = 0x08;

/// GDT selector of the kernel data/stack segment.
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;

/// RFLAGS for a freshly created process: IF set, plus the always-one bit 1.
pub const INITIAL_RFLAGS: u64 = (1 << 9) | (1 << 1);

/// Runs `f` with interrupts disabled on this CPU, restoring the previous
/// interrupt state afterwards.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = interrupts_enabled();
    if was_enabled {
        disable_interrupts();
    }
    let result = f();
    if was_enabled {
        enable_interrupts();
    }
    result
}
