//! One bit per physical frame, the ground truth for order-0 occupancy.
//!
//! Bit `i` of the managed range lives in word `i / 32`, most significant bit
//! first, so frame `i` is bit `31 - i % 32`. A set bit means the frame is used.

use crate::boot::BootInfo;
use crate::constants::memory::{
    BITMAP_ENTRY_SIZE, FRAME_SHIFT, FRAME_SIZE, FULL_BITMAP_ENTRY, MAX_BLOCK_SIZE, VIDEO_MEMORY,
};
use crate::memory::{MemoryError, PhysAddr, PhysFrame};

/// Highest physical address a 32-bit frame number can describe.
const ADDRESS_LIMIT: u64 = 1 << 32;

/// Mask for bits `[start, end)` of one word, `start < 32`, `end <= 32`.
const fn run_mask(start: usize, end: usize) -> u32 {
    let head = FULL_BITMAP_ENTRY >> start;
    let tail = if end >= BITMAP_ENTRY_SIZE {
        0
    } else {
        FULL_BITMAP_ENTRY >> end
    };
    head & !tail
}

/// Splits a frame range into `(word, mask)` pieces: a partial front word,
/// whole words, then a partial back word.
struct Runs {
    next: usize,
    end: usize,
}

impl Iterator for Runs {
    type Item = (usize, u32);

    fn next(&mut self) -> Option<(usize, u32)> {
        if self.next >= self.end {
            return None;
        }
        let word = self.next / BITMAP_ENTRY_SIZE;
        let word_base = word * BITMAP_ENTRY_SIZE;
        let first = self.next - word_base;
        let last = (self.end - word_base).min(BITMAP_ENTRY_SIZE);
        self.next = word_base + last;
        Some((word, run_mask(first, last)))
    }
}

fn runs(start: usize, count: usize) -> Runs {
    Runs {
        next: start,
        end: start + count,
    }
}

#[derive(Debug)]
pub struct FrameBitmap<'a> {
    words: &'a mut [u32],
    base: u32,
    frames: usize,
    used: usize,
}

impl<'a> FrameBitmap<'a> {
    /// Builds the bitmap for the usable RAM in `boot_info`.
    ///
    /// Everything starts used. Usable regions are then cleared and the kernel
    /// image, the boot stack and the video memory frame are reserved again.
    /// The managed range starts at the lowest usable base rounded down to the
    /// largest block size so buddy alignment matches physical alignment.
    pub fn init(words: &'a mut [u32], boot_info: &BootInfo) -> Result<Self, MemoryError> {
        let mut low = u64::MAX;
        let mut high = 0u64;
        for region in boot_info.usable_regions() {
            if region.base >= ADDRESS_LIMIT {
                continue;
            }
            low = low.min(region.base);
            high = high.max(region.end().min(ADDRESS_LIMIT));
        }
        if low == u64::MAX {
            return Err(MemoryError::NoUsableMemory);
        }

        let base = low & !(MAX_BLOCK_SIZE as u64 - 1);
        let top = high & !(FRAME_SIZE as u64 - 1);
        let frames = ((top - base) >> FRAME_SHIFT) as usize;
        if frames == 0 {
            return Err(MemoryError::NoUsableMemory);
        }
        let capacity = words.len() * BITMAP_ENTRY_SIZE;
        if frames > capacity {
            return Err(MemoryError::BitmapTooSmall {
                needed: frames,
                capacity,
            });
        }

        words.fill(FULL_BITMAP_ENTRY);
        let mut bitmap = FrameBitmap {
            words,
            base: (base >> FRAME_SHIFT) as u32,
            frames,
            used: frames,
        };

        for region in boot_info.usable_regions() {
            let start = (region.base + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1);
            let end = region.end().min(top) & !(FRAME_SIZE as u64 - 1);
            if start < end {
                bitmap.set_range(
                    bitmap.index_at(start),
                    ((end - start) >> FRAME_SHIFT) as usize,
                    false,
                );
            }
        }

        let layout = &boot_info.layout;
        bitmap.reserve(layout.image_start, layout.image_end);
        bitmap.reserve(layout.stack_start, layout.stack_end);
        bitmap.reserve(VIDEO_MEMORY, VIDEO_MEMORY + FRAME_SIZE as u32);

        log::debug!(
            "Frame bitmap: {} frames from {:#x}, {} free",
            bitmap.frames,
            base,
            bitmap.free_frames()
        );
        Ok(bitmap)
    }

    fn index_at(&self, addr: u64) -> usize {
        ((addr >> FRAME_SHIFT) - self.base as u64) as usize
    }

    /// Marks every managed frame overlapping physical `[start, end)` used.
    fn reserve(&mut self, start: u32, end: u32) {
        let first = (start >> FRAME_SHIFT).max(self.base);
        let last = (end.div_ceil(FRAME_SIZE as u32)).min(self.base + self.frames as u32);
        if first < last {
            self.set_range((first - self.base) as usize, (last - first) as usize, true);
        }
    }

    fn set_range(&mut self, start: usize, count: usize, used: bool) {
        assert!(
            start + count <= self.frames,
            "frame range {}+{} outside bitmap of {} frames",
            start,
            count,
            self.frames
        );
        for (word, mask) in runs(start, count) {
            let before = (self.words[word] & mask).count_ones() as usize;
            if used {
                self.words[word] |= mask;
                self.used += mask.count_ones() as usize - before;
            } else {
                self.words[word] &= !mask;
                self.used -= before;
            }
        }
    }

    pub fn mark_used(&mut self, frame: usize, count: usize) {
        self.set_range(frame, count, true);
    }

    pub fn mark_free(&mut self, frame: usize, count: usize) {
        self.set_range(frame, count, false);
    }

    /// Whether the `2^order` frames starting at `frame` are all free.
    /// Frames outside the managed range count as used.
    pub fn is_free(&self, frame: usize, order: usize) -> bool {
        let count = 1 << order;
        frame + count <= self.frames
            && runs(frame, count).all(|(word, mask)| self.words[word] & mask == 0)
    }

    /// Whether every frame of `[frame, frame + count)` is used.
    pub fn is_used(&self, frame: usize, count: usize) -> bool {
        frame + count <= self.frames
            && runs(frame, count).all(|(word, mask)| self.words[word] & mask == mask)
    }

    pub fn is_frame_free(&self, frame: usize) -> bool {
        self.is_free(frame, 0)
    }

    /// Position of `frame` in the managed range.
    pub fn index_of(&self, frame: PhysFrame) -> Option<usize> {
        let index = frame.number().checked_sub(self.base)? as usize;
        (index < self.frames).then_some(index)
    }

    pub fn frame_at(&self, index: usize) -> PhysFrame {
        PhysFrame::from_number(self.base + index as u32)
    }

    pub fn base_address(&self) -> PhysAddr {
        PhysFrame::from_number(self.base).start_address()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn used_frames(&self) -> usize {
        self.used
    }

    pub fn free_frames(&self) -> usize {
        self.frames - self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{KernelLayout, MemoryRegion};
    use crate::constants::memory::BITMAP_WORDS;

    fn bitmap(regions: &[MemoryRegion], layout: KernelLayout) -> FrameBitmap<'static> {
        let words = Box::leak(vec![0u32; BITMAP_WORDS].into_boxed_slice());
        FrameBitmap::init(words, &BootInfo::new(regions, layout)).unwrap()
    }

    fn empty(frames: usize) -> FrameBitmap<'static> {
        let words = Box::leak(vec![0u32; frames.div_ceil(32)].into_boxed_slice());
        FrameBitmap {
            words,
            base: 0,
            frames,
            used: 0,
        }
    }

    #[test]
    fn test_run_mask_edges() {
        assert_eq!(run_mask(0, 32), u32::MAX);
        assert_eq!(run_mask(0, 1), 0x8000_0000);
        assert_eq!(run_mask(31, 32), 1);
        assert_eq!(run_mask(4, 8), 0x0F00_0000);
    }

    #[test]
    fn test_frames_are_msb_first() {
        let mut map = empty(64);
        map.mark_used(0, 1);
        map.mark_used(33, 1);
        assert_eq!(map.words[0], 0x8000_0000);
        assert_eq!(map.words[1], 0x4000_0000);
    }

    #[test]
    fn test_is_free_straddling_words() {
        let mut map = empty(256);

        // Order 6 block at frame 64 covers words 2 and 3 exactly.
        assert!(map.is_free(64, 6));
        map.mark_used(127, 1);
        assert!(!map.is_free(64, 6));
        assert!(map.is_free(64, 5));
        map.mark_free(127, 1);

        // Order 7 block spans four whole words, a used bit in a middle word matters.
        map.mark_used(100, 1);
        assert!(!map.is_free(0, 7));
        assert!(map.is_free(128, 7));
        map.mark_free(100, 1);

        // Sub-word runs at the very front and back of a word.
        map.mark_used(32, 1);
        assert!(map.is_free(34, 1));
        assert!(!map.is_free(32, 1));
        map.mark_used(63, 1);
        assert!(!map.is_free(62, 1));
        assert!(map.is_free(60, 1));
        assert!(map.is_free(0, 5));
    }

    #[test]
    fn test_is_used_range_across_words() {
        let mut map = empty(96);
        map.mark_used(20, 60);
        assert_eq!(map.used_frames(), 60);
        assert!(map.is_used(20, 60));
        assert!(!map.is_used(19, 2));
        assert!(!map.is_used(79, 2));
        map.mark_used(10, 20);
        assert_eq!(map.used_frames(), 70);
    }

    #[test]
    fn test_out_of_range_is_not_free() {
        let map = empty(40);
        assert!(map.is_free(32, 3));
        assert!(!map.is_free(32, 4));
        assert!(!map.is_frame_free(40));
    }

    #[test]
    fn test_init_reserves_kernel_stack_and_video() {
        let map = bitmap(
            &[MemoryRegion::usable(0, 32 << 20)],
            KernelLayout::new(0x10_0000, 0x20_0000),
        );
        assert_eq!(map.frames(), 8192);
        assert!(!map.is_frame_free(0xB8));
        assert!(map.is_frame_free(0xB7));
        assert!(map.is_frame_free(0xB9));
        assert!(!map.is_frame_free(0x100));
        assert!(!map.is_frame_free(0x1FF));
        assert!(map.is_frame_free(0x200));
        assert!(!map.is_frame_free(0x7FC));
        assert!(!map.is_frame_free(0x7FF));
        assert!(map.is_frame_free(0x800));
        assert_eq!(map.used_frames(), 1 + 256 + 4);
    }

    #[test]
    fn test_init_keeps_holes_used_and_rounds_regions() {
        let map = bitmap(
            &[
                MemoryRegion::usable(0, 0x9_FC00),
                MemoryRegion::new(0x9_FC00, 0x400, 2),
                MemoryRegion::usable(0x10_0000, 0x1F0_0800),
            ],
            KernelLayout::new(0x10_0000, 0x18_0000),
        );
        // Top rounds down to a frame: 0x200_0800 -> 0x200_0000.
        assert_eq!(map.frames(), 0x2000);
        // 0x9F000 holds a partial usable frame and stays used.
        assert!(map.is_frame_free(0x9E));
        assert!(!map.is_frame_free(0x9F));
        assert!(!map.is_frame_free(0xC0));
        assert!(map.is_frame_free(0x180));
    }

    #[test]
    fn test_managed_range_starts_on_block_boundary() {
        let map = bitmap(
            &[MemoryRegion::usable(0x60_0000, 0x20_0000)],
            KernelLayout::new(0x60_0000, 0x61_0000),
        );
        assert_eq!(map.base_address(), PhysAddr::new(0x40_0000));
        assert_eq!(map.frames(), 0x400);
        assert_eq!(map.index_of(PhysFrame::from_number(0x600)), Some(0x200));
        assert_eq!(map.index_of(PhysFrame::from_number(0x3FF)), None);
        assert_eq!(map.frame_at(0x200).number(), 0x600);
        // Frames below the region stay used, the boot stack sits at its top.
        assert!(!map.is_frame_free(0));
        assert!(!map.is_frame_free(0x3FF));
        assert_eq!(map.free_frames(), 0x200 - 0x10 - 4);
    }

    #[test]
    fn test_init_errors() {
        let layout = KernelLayout::new(0x10_0000, 0x20_0000);
        let mut words = vec![0u32; 4];

        let none = BootInfo::new(&[MemoryRegion::new(0x10_0000, 0x1000, 2)], layout);
        assert_eq!(
            FrameBitmap::init(&mut words, &none).unwrap_err(),
            MemoryError::NoUsableMemory
        );

        let big = BootInfo::new(&[MemoryRegion::usable(0, 1 << 20)], layout);
        assert_eq!(
            FrameBitmap::init(&mut words, &big).unwrap_err(),
            MemoryError::BitmapTooSmall {
                needed: 256,
                capacity: 128
            }
        );
    }
}
