//! Kernel heap: a linked-list allocator over a contiguous run of frames.
//!
//! **Foundation:** `linked_list_allocator::Heap` recycles freed memory, which
//! matters here: every spawned process allocates its descriptor and every
//! exit frees it again.
//!
//! The heap lives in the direct map, so no page tables have to be built for
//! it. It is guarded by a `kcore::SpinLock`: the timer path allocates (the
//! runqueue may grow while a process is put back), so an allocation that a
//! timer interrupt could cut into would otherwise deadlock its own CPU.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use kcore::{KernelError, SpinLock};
use linked_list_allocator::Heap;

use super::{FRAME_SIZE, phys_to_virt, pmm};

/// Heap size: 4 MiB.
const HEAP_FRAMES: usize = 1024;

struct KernelHeap {
	inner: SpinLock<Heap>,
}

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: KernelHeap = KernelHeap {
	inner: SpinLock::new(Heap::empty()),
};

unsafe impl GlobalAlloc for KernelHeap {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		self.inner
			.lock()
			.allocate_first_fit(layout)
			.map_or(ptr::null_mut(), NonNull::as_ptr)
	}

	unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
		if let Some(ptr) = NonNull::new(ptr) {
			unsafe { self.inner.lock().deallocate(ptr, layout) };
		}
	}
}

/// Initialise the kernel heap. Must be called after the PMM.
pub fn init() -> Result<(), KernelError> {
	let phys = pmm::alloc_contiguous(HEAP_FRAMES)?;
	let start = phys_to_virt(phys);
	let size = HEAP_FRAMES * FRAME_SIZE as usize;

	// SAFETY: the frames were just taken from the PMM and are reached through
	// the direct map, so the region is unused, mapped and ours for good.
	unsafe { ALLOCATOR.inner.lock().init(start, size) };

	log::info!("heap: {} KiB at {:p}", size / 1024, start);
	Ok(())
}

/// Bytes currently handed out.
pub fn allocated_bytes() -> usize {
	ALLOCATOR.inner.lock().used()
}

pub fn total_bytes() -> usize {
	ALLOCATOR.inner.lock().size()
}
