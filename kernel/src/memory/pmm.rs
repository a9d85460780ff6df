//! Bitmap-based physical frame allocator.
//!
//! Tracks 4 KiB page frames with a simple bitmap: bit **1** = used, bit **0** = free.
//! Allocation scans from a rotating search hint, so repeated allocations do
//! not rescan the low part of the bitmap that is usually full.
//!
//! Frame 0 is never handed out (null-page protection).

use alloc::vec;
use alloc::vec::Vec;

use crate::error::MemoryError;
use crate::memory::address::{Frame, PAGE_SIZE};

/// A span of physical memory reported by the boot loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
	pub base: u64,
	pub length: u64,
	pub usable: bool,
}

/// A bitmap-based physical frame allocator.
pub struct FrameAllocator {
	bitmap: Vec<u8>,
	/// Number of page frames tracked by the bitmap.
	total_frames: usize,
	/// Current number of free (allocatable) frames.
	free_frames: usize,
	/// Byte index where the last successful allocation was found.
	search_hint: usize,
}

impl FrameAllocator {
	/// An allocator over `total_frames` frames that are all free except frame 0.
	pub fn new(total_frames: usize) -> Self {
		let mut alloc = Self {
			bitmap: vec![0; total_frames.div_ceil(8)],
			total_frames,
			free_frames: total_frames,
			search_hint: 0,
		};
		alloc.guard_null_frame();
		alloc
	}

	/// Build the allocator from a boot memory map.
	///
	/// Every frame starts used; frames fully inside usable regions are then
	/// released. Frames past the last usable byte are not tracked at all.
	pub fn from_regions(regions: &[MemoryRegion]) -> Self {
		// ── 1. Determine the highest physical address we need to track ──
		let max_usable_addr = regions
			.iter()
			.filter(|r| r.usable)
			.map(|r| r.base + r.length)
			.max()
			.unwrap_or(0);
		let total_frames = (max_usable_addr / PAGE_SIZE) as usize;

		// ── 2. Mark every frame as USED ──
		let mut alloc = Self {
			bitmap: vec![0xFF; total_frames.div_ceil(8)],
			total_frames,
			free_frames: 0,
			search_hint: 0,
		};

		// ── 3. Clear bits for frames inside USABLE regions ──
		for region in regions.iter().filter(|r| r.usable) {
			let start_frame = region.base.div_ceil(PAGE_SIZE);
			let end_frame = (region.base + region.length) / PAGE_SIZE;
			for frame in start_frame..end_frame {
				let frame = frame as usize;
				if frame < total_frames && alloc.bit(frame) {
					alloc.clear_bit(frame);
					alloc.free_frames += 1;
				}
			}
		}

		// ── 4. Guard: keep frame 0 permanently used ──
		alloc.guard_null_frame();

		log::info!(
			"PMM initialised: {} frames tracked, {} free ({} MiB)",
			alloc.total_frames,
			alloc.free_frames,
			(alloc.free_frames * PAGE_SIZE as usize) / (1024 * 1024),
		);
		alloc
	}

	fn guard_null_frame(&mut self) {
		if self.total_frames > 0 && !self.bit(0) {
			self.set_bit(0);
			self.free_frames -= 1;
		}
	}

	/// Allocate a single frame, or `None` when every frame is in use.
	///
	/// Flips exactly one bit on success.
	pub fn alloc(&mut self) -> Option<Frame> {
		let bitmap_bytes = self.bitmap.len();
		if bitmap_bytes == 0 || self.free_frames == 0 {
			return None;
		}
		let start = self.search_hint;

		// Scan from hint to end, then wrap around.
		for offset in 0..bitmap_bytes {
			let byte_idx = (start + offset) % bitmap_bytes;
			let byte = self.bitmap[byte_idx];
			if byte == 0xFF {
				continue;
			}
			let bit_idx = byte.trailing_ones() as usize;
			let frame = byte_idx * 8 + bit_idx;
			if frame >= self.total_frames {
				continue;
			}
			self.set_bit(frame);
			self.free_frames -= 1;
			self.search_hint = byte_idx;
			return Some(Frame::from_number(frame as u64));
		}
		None
	}

	/// Return a frame to the pool.
	///
	/// Freeing a frame twice or one outside the bitmap is reported, not ignored.
	pub fn free(&mut self, frame: Frame) -> Result<(), MemoryError> {
		let index = frame.number() as usize;
		if index >= self.total_frames {
			return Err(MemoryError::FrameOutOfRange(frame));
		}
		if !self.bit(index) {
			return Err(MemoryError::DoubleFree(frame));
		}
		self.clear_bit(index);
		self.free_frames += 1;
		Ok(())
	}

	/// Mark a specific frame used. Returns `false` if it was already used.
	pub fn reserve(&mut self, frame: Frame) -> bool {
		let index = frame.number() as usize;
		if index >= self.total_frames || self.bit(index) {
			return false;
		}
		self.set_bit(index);
		self.free_frames -= 1;
		true
	}

	pub fn is_used(&self, frame: Frame) -> bool {
		let index = frame.number() as usize;
		index >= self.total_frames || self.bit(index)
	}

	pub fn total_frames(&self) -> usize {
		self.total_frames
	}

	pub fn free_frames(&self) -> usize {
		self.free_frames
	}

	pub fn used_frames(&self) -> usize {
		self.total_frames - self.free_frames
	}

	#[inline]
	fn bit(&self, frame: usize) -> bool {
		self.bitmap[frame / 8] & (1u8 << (frame % 8)) != 0
	}

	#[inline]
	fn set_bit(&mut self, frame: usize) {
		self.bitmap[frame / 8] |= 1u8 << (frame % 8);
	}

	#[inline]
	fn clear_bit(&mut self, frame: usize) {
		self.bitmap[frame / 8] &= !(1u8 << (frame % 8));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn frame_zero_is_never_handed_out() {
		let mut pmm = FrameAllocator::new(16);
		assert_eq!(pmm.free_frames(), 15);
		let frames: Vec<_> = core::iter::from_fn(|| pmm.alloc()).collect();
		assert_eq!(frames.len(), 15);
		assert!(frames.iter().all(|f| f.number() != 0));
		assert_eq!(pmm.alloc(), None);
	}

	#[test]
	fn alloc_and_free_move_exactly_one_bit() {
		let mut pmm = FrameAllocator::new(64);
		let before = pmm.used_frames();
		let frame = pmm.alloc().unwrap();
		assert_eq!(pmm.used_frames(), before + 1);
		assert!(pmm.is_used(frame));
		pmm.free(frame).unwrap();
		assert_eq!(pmm.used_frames(), before);
		assert!(!pmm.is_used(frame));
	}

	#[test]
	fn double_free_is_an_error() {
		let mut pmm = FrameAllocator::new(64);
		let frame = pmm.alloc().unwrap();
		pmm.free(frame).unwrap();
		assert_eq!(pmm.free(frame), Err(MemoryError::DoubleFree(frame)));
		let outside = Frame::from_number(64);
		assert_eq!(pmm.free(outside), Err(MemoryError::FrameOutOfRange(outside)));
	}

	#[test]
	fn search_resumes_from_the_last_hit() {
		let mut pmm = FrameAllocator::new(64);
		for _ in 0..20 {
			pmm.alloc().unwrap();
		}
		// Frame 3 is free again, but the hint already moved past its byte.
		pmm.free(Frame::from_number(3)).unwrap();
		assert_eq!(pmm.alloc(), Some(Frame::from_number(21)));
		// Once the tail is exhausted the scan wraps back to the hole.
		for _ in 22..64 {
			pmm.alloc().unwrap();
		}
		assert_eq!(pmm.alloc(), Some(Frame::from_number(3)));
	}

	#[test]
	fn regions_free_only_usable_whole_frames() {
		let regions = [
			MemoryRegion { base: 0, length: 0x4000, usable: true },
			MemoryRegion { base: 0x4000, length: 0x4000, usable: false },
			MemoryRegion { base: 0x8800, length: 0x3800, usable: true },
		];
		let mut pmm = FrameAllocator::from_regions(&regions);
		assert_eq!(pmm.total_frames(), 12);
		// frames 1..4 and 9..12; frame 0 guarded, frame 8 only partially usable
		assert_eq!(pmm.free_frames(), 6);
		assert!(pmm.is_used(Frame::from_number(5)));
		assert!(pmm.is_used(Frame::from_number(8)));
		assert!(pmm.reserve(Frame::from_number(9)));
		assert!(!pmm.reserve(Frame::from_number(9)));
		assert_eq!(pmm.free_frames(), 5);
	}
}
