//! Physical and virtual memory management.
//!
//! Bottom-up: the frame allocator tracks physical RAM, the heap is carved
//! out of it, page tables are built from single frames, and address spaces
//! combine the two for each process.

pub mod heap;
pub mod paging;
pub mod pmm;
pub mod space;

use core::sync::atomic::{AtomicU64, Ordering};

/// Size of a physical frame and of a page.
pub const FRAME_SIZE: u64 = 4096;

/// Offset of Limine's direct map of physical memory.
static HHDM: AtomicU64 = AtomicU64::new(0);

/// Records the direct-map offset. Must precede every other memory call.
pub fn init_hhdm(offset: u64) {
    HHDM.store(offset, Ordering::Relaxed);
}

pub fn hhdm_offset() -> u64 {
    HHDM.load(Ordering::Relaxed)
}

/// Kernel-visible address of physical address `phys`.
#[inline]
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    (hhdm_offset() + phys) as *mut u8
}
