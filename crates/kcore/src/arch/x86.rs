//! x86_64 backend.
//!
//! The CPU-local base is the `GS` segment base (`IA32_GS_BASE`). Each
//! per-CPU area stores its own address in its first word, so
//! `mov reg, gs:[0]` yields the linear base without an MSR read.

use core::arch::asm;
use core::fmt;

use x86_64::instructions::interrupts;
use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::VirtAddr;

/// Initial local APIC id, as reported by CPUID.
pub type HardwareId = u32;

#[inline(always)]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

#[inline(always)]
pub fn disable_interrupts() {
    interrupts::disable();
}

#[inline(always)]
pub fn enable_interrupts() {
    interrupts::enable();
}

/// PAUSE: tells the core we are spinning, easing bus contention.
#[inline(always)]
pub fn relax() {
    core::hint::spin_loop();
}

/// Slow CPU identification: CPUID leaf 1, EBX[31:24].
///
/// CPUID is serializing and can cost hundreds of cycles, which is why it is
/// only used before this CPU has a per-CPU area.
pub fn hardware_id() -> HardwareId {
    #[allow(unused_unsafe)]
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.ebx >> 24
}

/// Current GS base.
pub fn local_base() -> usize {
    GsBase::read().as_u64() as usize
}

/// Loads `base` into the GS base (and the swapgs shadow).
///
/// # Safety
/// `base` must point at memory that stays valid for as long as this CPU
/// issues GS-relative loads, with a self-pointer at offset 0 and the CPU
/// index word at offset 8.
pub unsafe fn set_local_base(base: usize) {
    let base = VirtAddr::new(base as u64);
    #[allow(unused_unsafe)]
    unsafe {
        GsBase::write(base);
        KernelGsBase::write(base);
    }
}

/// Reads the machine word at `offset` from this CPU's local base.
#[inline(always)]
pub fn read_local_word(offset: usize) -> usize {
    let value: usize;
    // SAFETY: every CPU points GS at the boot placeholder before running any
    // kernel code, and later at its own area; both cover the header words.
    unsafe {
        asm!(
            "mov {value}, qword ptr gs:[{offset}]",
            value = out(reg) value,
            offset = in(reg) offset,
            options(nostack, preserves_flags, readonly)
        );
    }
    value
}

/// Stops this CPU permanently. The reason has already been logged.
pub fn halt_cpu(_reason: fmt::Arguments<'_>) -> ! {
    loop {
        // SAFETY: with IF clear nothing but an NMI wakes us, and we loop
        // straight back into HLT.
        unsafe {
            asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

/// Enables interrupts and halts until one arrives (`sti; hlt` is atomic).
#[inline]
pub fn wait_for_interrupt() {
    interrupts::enable_and_hlt();
}
