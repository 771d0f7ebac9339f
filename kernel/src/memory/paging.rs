//! Four-level x86-64 page tables.
//!
//! Tables are single PMM frames reached through the HHDM. Every root shares
//! the kernel half (PML4 entries 256..512) with the boot tables, so kernel
//! code, the direct map, the heap and the APIC window look the same in every
//! address space; the lower half is private to its root.

use core::ptr;

use bitflags::bitflags;
use kcore::KernelError;
use x86_64::PhysAddr;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;

use super::{FRAME_SIZE, phys_to_virt, pmm};

bitflags! {
	/// Page-table entry attributes.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PageFlags: u64 {
		const PRESENT = 1 << 0;
		const WRITABLE = 1 << 1;
		const USER = 1 << 2;
		const WRITE_THROUGH = 1 << 3;
		const CACHE_DISABLE = 1 << 4;
		const HUGE = 1 << 7;
		const GLOBAL = 1 << 8;
		const NO_EXECUTE = 1 << 63;

		/// Kernel read-write data.
		const KERNEL_RW = Self::PRESENT.bits() | Self::WRITABLE.bits();
		/// Device registers: read-write, uncached.
		const MMIO = Self::KERNEL_RW.bits() | Self::CACHE_DISABLE.bits() | Self::WRITE_THROUGH.bits();
	}
}

/// Mask to extract the physical address from a page-table entry.
const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// First PML4 slot of the kernel half.
const KERNEL_HALF: usize = 256;

const ENTRIES: usize = 512;

fn entries(table_phys: u64) -> *mut u64 {
	phys_to_virt(table_phys) as *mut u64
}

fn index(virt: u64, level: u32) -> usize {
	((virt >> (12 + 9 * (level - 1))) & 0x1FF) as usize
}

/// Physical address of the active PML4.
pub fn current_root() -> u64 {
	Cr3::read().0.start_address().as_u64()
}

/// Makes `root` the active PML4.
///
/// # Safety
///
/// `root` must be a PML4 built by [`new_root`] (or the boot tables) that
/// stays allocated while it is active.
pub unsafe fn activate(root: u64) {
	let frame = PhysFrame::containing_address(PhysAddr::new(root));
	if current_root() != root {
		unsafe { Cr3::write(frame, Cr3Flags::empty()) };
	}
}

/// A fresh PML4: empty lower half, kernel half copied from `kernel_root`.
pub fn new_root(kernel_root: u64) -> Result<u64, KernelError> {
	let root = pmm::alloc_zeroed_frame()?;
	let src = entries(kernel_root);
	let dst = entries(root);
	for i in KERNEL_HALF..ENTRIES {
		unsafe { ptr::write_volatile(dst.add(i), ptr::read_volatile(src.add(i))) };
	}
	Ok(root)
}

/// Maps the 4 KiB page at `virt` to `phys` in `root`, allocating
/// intermediate tables as needed. A page already covered by a huge mapping
/// is left as it is.
///
/// # Safety
///
/// `root` must be a live PML4; the caller flushes or reloads CR3.
pub unsafe fn map_page(root: u64, virt: u64, phys: u64, flags: PageFlags) -> Result<(), KernelError> {
	debug_assert!(virt % FRAME_SIZE == 0 && phys % FRAME_SIZE == 0);

	let mut table = root;
	for level in (2..=4).rev() {
		let slot = unsafe { entries(table).add(index(virt, level)) };
		let entry = unsafe { ptr::read_volatile(slot) };
		if entry & PageFlags::PRESENT.bits() == 0 {
			let next = pmm::alloc_zeroed_frame()?;
			let link = PageFlags::KERNEL_RW | (flags & PageFlags::USER);
			unsafe { ptr::write_volatile(slot, next | link.bits()) };
			table = next;
		} else if entry & PageFlags::HUGE.bits() != 0 {
			return Ok(());
		} else {
			table = entry & PHYS_ADDR_MASK;
		}
	}

	let leaf = unsafe { entries(table).add(index(virt, 1)) };
	unsafe { ptr::write_volatile(leaf, phys | (flags | PageFlags::PRESENT).bits()) };
	Ok(())
}

/// Maps one page of device registers at its direct-map address in the
/// active (kernel) tables. Must run before the first [`new_root`], so that
/// every address space inherits the mapping.
pub fn map_mmio(phys: u64) -> Result<u64, KernelError> {
	let phys = phys & !(FRAME_SIZE - 1);
	let virt = phys_to_virt(phys) as u64;
	unsafe {
		map_page(current_root(), virt, phys, PageFlags::MMIO)?;
		x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
	}
	Ok(virt)
}

/// Frees every table in the lower half of `root`, then `root` itself.
/// Leaf frames are not touched: their owner returns them.
///
/// # Safety
///
/// `root` must not be active on any CPU.
pub unsafe fn free_root(root: u64) {
	unsafe { free_tables(root, 4, 0..KERNEL_HALF) };
}

unsafe fn free_tables(table: u64, level: u32, range: core::ops::Range<usize>) {
	if level > 1 {
		for i in range {
			let entry = unsafe { ptr::read_volatile(entries(table).add(i)) };
			if entry & PageFlags::PRESENT.bits() != 0 && entry & PageFlags::HUGE.bits() == 0 {
				unsafe { free_tables(entry & PHYS_ADDR_MASK, level - 1, 0..ENTRIES) };
			}
		}
	}
	pmm::free_frame(table);
}
