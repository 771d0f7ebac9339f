//! Task State Segment (TSS) for x86_64.
//!
//! In long mode the TSS does not store register state for task switching.
//! The kernel never changes privilege level, so only the Interrupt Stack
//! Table matters: it gives the double fault handler and the trap entries a
//! known-good stack of their own.

/// IST slot of the double fault handler.
pub const DOUBLE_FAULT_IST: u8 = 1;

/// IST slot shared by the timer and exit entries. Both run with interrupts
/// off, so they never nest on it.
pub const TRAP_IST: u8 = 2;

/// Size of each IST stack in bytes (16 KiB).
pub const IST_STACK_SIZE: usize = 4096 * 4;

/// The 64-bit Task State Segment.
#[repr(C, packed)]
pub struct Tss {
    reserved0: u32,
    /// Stack pointers for privilege level transitions (unused: everything
    /// runs in Ring 0).
    rsp: [u64; 3],
    reserved1: u64,
    /// IST1..IST7; IST index `n` is stored at `ist[n - 1]`.
    ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    /// Offset to the I/O permission bitmap from the TSS base.
    iomap_base: u16,
}

impl Tss {
    pub const fn new() -> Self {
        Self {
            reserved0: 0,
            rsp: [0; 3],
            reserved1: 0,
            ist: [0; 7],
            reserved2: 0,
            reserved3: 0,
            // No bitmap: the base points past the segment limit.
            iomap_base: core::mem::size_of::<Self>() as u16,
        }
    }

    /// Installs `stack_top` (stacks grow down) as IST stack `index`.
    pub fn set_interrupt_stack(&mut self, index: u8, stack_top: u64) {
        debug_assert!((1..=7).contains(&index));
        let mut ist = self.ist;
        ist[usize::from(index) - 1] = stack_top;
        self.ist = ist;
    }
}
