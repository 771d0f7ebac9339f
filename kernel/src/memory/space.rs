//! Process address spaces.
//!
//! Each process gets its own PML4. The kernel half is shared, the lower half
//! holds nothing but the process's stack, mapped just below
//! [`STACK_REGION_TOP`]. Dropping the space returns the stack frames, the
//! lower-half tables and the root.

use alloc::boxed::Box;
use alloc::vec::Vec;

use kcore::{AddressSpace, AddressSpaceFactory, KernelError, StackBounds};

use super::paging::{self, PageFlags};
use super::{FRAME_SIZE, pmm};

/// Highest stack address; stacks are stacked downwards from here with an
/// unmapped guard page between them.
pub const STACK_REGION_TOP: u64 = 0x0000_7FFF_FFFF_F000;

pub struct PageSpace {
	root: u64,
	frames: Vec<u64>,
	next_stack_top: u64,
}

impl AddressSpace for PageSpace {
	fn activate(&self) {
		// SAFETY: the root lives as long as this space, and a descriptor is
		// only switched to while it owns the space.
		unsafe { paging::activate(self.root) };
	}

	fn map_stack(&mut self, size: usize) -> Result<StackBounds, KernelError> {
		let pages = (size as u64).div_ceil(FRAME_SIZE);
		let top = self.next_stack_top;
		let bottom = top - pages * FRAME_SIZE;

		for page in 0..pages {
			let frame = pmm::alloc_zeroed_frame().map_err(|_| KernelError::StackUnavailable)?;
			self.frames.push(frame);
			let virt = bottom + page * FRAME_SIZE;
			unsafe { paging::map_page(self.root, virt, frame, PageFlags::KERNEL_RW) }
				.map_err(|_| KernelError::StackUnavailable)?;
		}

		self.next_stack_top = bottom - FRAME_SIZE;
		Ok(StackBounds { bottom, top })
	}
}

impl Drop for PageSpace {
	fn drop(&mut self) {
		for &frame in &self.frames {
			pmm::free_frame(frame);
		}
		// SAFETY: the owning descriptor is terminated or was never run; no
		// CPU has this root loaded.
		unsafe { paging::free_root(self.root) };
		log::trace!("space {:#x}: released {} stack frames", self.root, self.frames.len());
	}
}

/// Builds [`PageSpace`]s that share the boot tables' kernel half.
pub struct PageSpaces {
	kernel_root: u64,
}

impl PageSpaces {
	/// Captures the active tables as the kernel address space.
	pub fn new() -> Self {
		Self {
			kernel_root: paging::current_root(),
		}
	}
}

impl AddressSpaceFactory for PageSpaces {
	fn create(&self) -> Result<Box<dyn AddressSpace>, KernelError> {
		let root = paging::new_root(self.kernel_root)
			.map_err(|_| KernelError::AddressSpaceUnavailable)?;
		Ok(Box::new(PageSpace {
			root,
			frames: Vec::new(),
			next_stack_top: STACK_REGION_TOP,
		}))
	}

	fn activate_kernel(&self) {
		// SAFETY: the boot tables are never freed.
		unsafe { paging::activate(self.kernel_root) };
	}
}
