//! Bitmap-based Physical Memory Manager (PMM).
//!
//! Tracks 4 KiB page frames with a simple bitmap: bit **1** = used, bit **0** = free.
//! The bitmap itself is carved from the first usable region large enough to hold it.
//!
//! The allocator sits behind a `kcore::SpinLock`, which also masks local
//! interrupts: address spaces are torn down from the exit trap, so frames
//! are freed in interrupt context.

use kcore::{KernelError, SpinLock};
use limine::memory_map::{Entry, EntryType};

use super::{FRAME_SIZE, phys_to_virt};

/// Global PMM instance, initialised once at boot.
static PMM: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);

/// A bitmap-based physical frame allocator.
struct BitmapAllocator {
	/// Virtual address of the bitmap (accessed via HHDM).
	bitmap: *mut u8,
	/// Total number of page frames tracked by the bitmap.
	total_frames: usize,
	/// Current number of free (allocatable) frames.
	free_frames: usize,
	/// Byte index where the last successful allocation was found.
	search_hint: usize,
}

// Safety: the bitmap pointer is only accessed under the PMM lock.
unsafe impl Send for BitmapAllocator {}

impl BitmapAllocator {
	fn is_used(&self, frame: usize) -> bool {
		unsafe { *self.bitmap.add(frame / 8) & (1u8 << (frame % 8)) != 0 }
	}

	fn mark_used(&mut self, frame: usize) {
		unsafe { *self.bitmap.add(frame / 8) |= 1u8 << (frame % 8) }
	}

	fn mark_free(&mut self, frame: usize) {
		unsafe { *self.bitmap.add(frame / 8) &= !(1u8 << (frame % 8)) }
	}

	/// Search the bitmap for a free frame, mark it used, return its address.
	fn alloc(&mut self) -> Option<u64> {
		let bitmap_bytes = self.total_frames.div_ceil(8);
		let start = self.search_hint;

		// Scan from hint to end, then wrap around.
		for offset in 0..bitmap_bytes {
			let byte_idx = (start + offset) % bitmap_bytes;
			let byte = unsafe { *self.bitmap.add(byte_idx) };
			if byte == 0xFF {
				continue;
			}
			let frame = byte_idx * 8 + byte.trailing_ones() as usize;
			if frame >= self.total_frames {
				continue;
			}
			self.mark_used(frame);
			self.free_frames -= 1;
			self.search_hint = byte_idx;
			return Some(frame as u64 * FRAME_SIZE);
		}
		None
	}

	/// First run of `count` free frames, marked used.
	fn alloc_contiguous(&mut self, count: usize) -> Option<u64> {
		let mut run_start = 0;
		let mut run_len = 0;

		for frame in 0..self.total_frames {
			if self.is_used(frame) {
				run_start = frame + 1;
				run_len = 0;
				continue;
			}
			run_len += 1;
			if run_len == count {
				for f in run_start..run_start + count {
					self.mark_used(f);
				}
				self.free_frames -= count;
				return Some(run_start as u64 * FRAME_SIZE);
			}
		}
		None
	}

	fn free(&mut self, phys: u64) {
		kcore::kassert!(phys % FRAME_SIZE == 0, "free of unaligned frame {:#x}", phys);
		let frame = (phys / FRAME_SIZE) as usize;
		kcore::kassert!(frame < self.total_frames, "free of untracked frame {:#x}", phys);
		kcore::kassert!(self.is_used(frame), "double free of frame {:#x}", phys);
		self.mark_free(frame);
		self.free_frames += 1;
	}
}

// ── Init ────────────────────────────────────────────────────────

/// Initialise the physical memory manager from the Limine memory map.
///
/// Fails only if no usable region can hold the bitmap.
pub fn init(entries: &[&Entry]) -> Result<(), KernelError> {
	// ── 1. Highest usable physical address ──
	let max_usable_addr = entries
		.iter()
		.filter(|entry| entry.entry_type == EntryType::USABLE)
		.map(|entry| entry.base + entry.length)
		.max()
		.unwrap_or(0);

	let total_frames = (max_usable_addr / FRAME_SIZE) as usize;
	let bitmap_bytes = total_frames.div_ceil(8);
	let bitmap_frames = (bitmap_bytes as u64).div_ceil(FRAME_SIZE) as usize;
	let bitmap_size = bitmap_frames as u64 * FRAME_SIZE;

	// ── 2. A usable region large enough to hold the bitmap ──
	let bitmap_phys = entries
		.iter()
		.filter(|entry| entry.entry_type == EntryType::USABLE)
		.find_map(|entry| {
			// Never place it on the null frame.
			let candidate = entry.base.max(FRAME_SIZE);
			(candidate + bitmap_size <= entry.base + entry.length).then_some(candidate)
		})
		.ok_or(KernelError::OutOfFrames)?;

	let bitmap = phys_to_virt(bitmap_phys);
	let mut alloc = BitmapAllocator {
		bitmap,
		total_frames,
		free_frames: 0,
		search_hint: 0,
	};

	// ── 3. Everything used, then free the usable regions ──
	unsafe { core::ptr::write_bytes(bitmap, 0xFF, bitmap_bytes) };
	for entry in entries.iter().filter(|entry| entry.entry_type == EntryType::USABLE) {
		let first = (entry.base / FRAME_SIZE) as usize;
		let count = (entry.length / FRAME_SIZE) as usize;
		for frame in first..(first + count).min(total_frames) {
			alloc.mark_free(frame);
			alloc.free_frames += 1;
		}
	}

	// ── 4. The bitmap's own frames and the null frame stay used ──
	let bitmap_first = (bitmap_phys / FRAME_SIZE) as usize;
	for frame in bitmap_first..bitmap_first + bitmap_frames {
		alloc.mark_used(frame);
		alloc.free_frames -= 1;
	}
	if total_frames > 0 && !alloc.is_used(0) {
		alloc.mark_used(0);
		alloc.free_frames -= 1;
	}

	log::info!(
		"pmm: {} frames tracked, {} free ({} MiB), bitmap at {:#x} ({} frames)",
		total_frames,
		alloc.free_frames,
		alloc.free_frames as u64 * FRAME_SIZE / (1024 * 1024),
		bitmap_phys,
		bitmap_frames,
	);

	*PMM.lock() = Some(alloc);
	Ok(())
}

// ── Allocation / Free ───────────────────────────────────────────

/// Allocate a single 4 KiB physical frame. Returns its **physical address**.
pub fn alloc_frame() -> Result<u64, KernelError> {
	PMM.lock()
		.as_mut()
		.and_then(BitmapAllocator::alloc)
		.ok_or(KernelError::OutOfFrames)
}

/// Allocate a frame and fill it with zeroes.
pub fn alloc_zeroed_frame() -> Result<u64, KernelError> {
	let phys = alloc_frame()?;
	unsafe { core::ptr::write_bytes(phys_to_virt(phys), 0, FRAME_SIZE as usize) };
	Ok(phys)
}

/// Allocate `count` physically contiguous 4 KiB frames.
pub fn alloc_contiguous(count: usize) -> Result<u64, KernelError> {
	if count == 0 {
		return Err(KernelError::OutOfFrames);
	}
	PMM.lock()
		.as_mut()
		.and_then(|alloc| alloc.alloc_contiguous(count))
		.ok_or(KernelError::OutOfFrames)
}

/// Return a frame. Double frees and foreign addresses are fatal.
pub fn free_frame(phys: u64) {
	let mut pmm = PMM.lock();
	let Some(alloc) = pmm.as_mut() else {
		kcore::kfatal!("free of frame {:#x} before the pmm is up", phys);
	};
	alloc.free(phys);
}

pub fn free_frame_count() -> usize {
	PMM.lock().as_ref().map_or(0, |alloc| alloc.free_frames)
}
