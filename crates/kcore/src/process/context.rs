//! Saved execution state of a suspended process.

use crate::arch::{INITIAL_RFLAGS, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};

/// Full register set of an interrupted process, laid out exactly as the
/// kernel's trap entry leaves it on the stack.
///
/// The stub pushes `rax` first and `r15` last, so `r15` sits at the lowest
/// address; the CPU's own interrupt frame (`rip`, `cs`, `rflags`, `rsp`,
/// `ss`) follows above the general-purpose registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegisterSet {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // ── pushed by the CPU ──
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl RegisterSet {
    /// Size in bytes; the trap stub relies on this.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Registers of a process that has never run: everything zero except
    /// the entry point, the stack pointer and what `iretq` needs to accept
    /// the frame (kernel selectors, interrupts enabled).
    pub const fn initial(entry: u64, stack_top: u64) -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: entry,
            cs: KERNEL_CODE_SELECTOR,
            rflags: INITIAL_RFLAGS,
            rsp: stack_top,
            ss: KERNEL_DATA_SELECTOR,
        }
    }
}

const _: () = assert!(RegisterSet::SIZE == 20 * 8);

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn gprs_precede_the_cpu_frame() {
        assert_eq!(offset_of!(RegisterSet, r15), 0);
        assert_eq!(offset_of!(RegisterSet, rax), 14 * 8);
        assert_eq!(offset_of!(RegisterSet, rip), 15 * 8);
        assert_eq!(offset_of!(RegisterSet, ss), 19 * 8);
    }

    #[test]
    fn initial_state_is_zero_but_entry_and_stack() {
        let regs = RegisterSet::initial(0x4000, 0x9000);
        assert_eq!(regs.rip, 0x4000);
        assert_eq!(regs.rsp, 0x9000);
        assert_eq!(regs.rflags & (1 << 9), 1 << 9);
        let gprs = RegisterSet {
            rip: 0,
            rsp: 0,
            cs: 0,
            ss: 0,
            rflags: 0,
            ..regs
        };
        assert_eq!(gprs, RegisterSet::default());
    }
}
