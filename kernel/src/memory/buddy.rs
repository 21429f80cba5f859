//! Power-of-two frame allocation over the frame bitmap.
//!
//! Free blocks of each order sit on a doubly linked list. The links are kept
//! in a side table indexed by frame number instead of inside the free pages
//! themselves, so nothing ever aliases memory a caller may own.

use crate::constants::memory::MAX_ORDER;
use crate::memory::bitmap::FrameBitmap;
use crate::memory::frame_allocator::{FrameAllocator, FrameDeallocator};
use crate::memory::PhysFrame;

/// End of a free list.
pub const NIL: u32 = u32::MAX;

/// Free-list bookkeeping for one frame. Only meaningful for the first frame of
/// a free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLink {
    next: u32,
    prev: u32,
    order: u8,
    free_head: bool,
}

impl FrameLink {
    pub const EMPTY: FrameLink = FrameLink {
        next: NIL,
        prev: NIL,
        order: 0,
        free_head: false,
    };

    /// All-zero value, suitable for zero-initialized storage.
    pub const ZEROED: FrameLink = FrameLink {
        next: 0,
        prev: 0,
        order: 0,
        free_head: false,
    };
}

pub struct BuddyAllocator<'a> {
    bitmap: FrameBitmap<'a>,
    links: &'a mut [FrameLink],
    free_heads: [u32; MAX_ORDER],
    nr_free: [usize; MAX_ORDER],
}

impl<'a> BuddyAllocator<'a> {
    /// Takes ownership of an initialized bitmap and builds the free lists from it.
    pub fn new(bitmap: FrameBitmap<'a>, links: &'a mut [FrameLink]) -> Self {
        assert!(
            links.len() >= bitmap.frames(),
            "link table holds {} frames, bitmap manages {}",
            links.len(),
            bitmap.frames()
        );
        links.fill(FrameLink::EMPTY);

        let mut allocator = BuddyAllocator {
            bitmap,
            links,
            free_heads: [NIL; MAX_ORDER],
            nr_free: [0; MAX_ORDER],
        };
        allocator.build_free_lists();
        allocator
    }

    /// Single pass over the bitmap. Every free frame not already absorbed
    /// starts a block that grows while it stays aligned and fully free.
    fn build_free_lists(&mut self) {
        let frames = self.bitmap.frames();
        let mut index = 0;
        while index < frames {
            if !self.bitmap.is_frame_free(index) {
                index += 1;
                continue;
            }
            let mut order = 0;
            while order + 1 < MAX_ORDER
                && index % (1 << (order + 1)) == 0
                && self.bitmap.is_free(index, order + 1)
            {
                order += 1;
            }
            self.push(index, order);
            index += 1 << order;
        }
    }

    fn push(&mut self, index: usize, order: usize) {
        let head = self.free_heads[order];
        self.links[index] = FrameLink {
            next: head,
            prev: NIL,
            order: order as u8,
            free_head: true,
        };
        if head != NIL {
            self.links[head as usize].prev = index as u32;
        }
        self.free_heads[order] = index as u32;
        self.nr_free[order] += 1;
    }

    fn unlink(&mut self, index: usize, order: usize) {
        let link = self.links[index];
        assert!(
            link.free_head && link.order as usize == order,
            "free list corrupted: frame {} is not a free block of order {}",
            index,
            order
        );
        if link.prev == NIL {
            self.free_heads[order] = link.next;
        } else {
            self.links[link.prev as usize].next = link.next;
        }
        if link.next != NIL {
            self.links[link.next as usize].prev = link.prev;
        }
        self.links[index] = FrameLink::EMPTY;
        self.nr_free[order] -= 1;
    }

    /// Allocates `2^order` contiguous frames aligned to their size.
    ///
    /// Returns `None` when no free block of this order or larger exists.
    pub fn alloc(&mut self, order: usize) -> Option<PhysFrame> {
        assert!(order < MAX_ORDER, "invalid allocation order {}", order);

        let mut current = (order..MAX_ORDER).find(|&o| self.free_heads[o] != NIL)?;
        let index = self.free_heads[current] as usize;
        self.unlink(index, current);

        while current > order {
            current -= 1;
            self.push(index + (1 << current), current);
        }
        self.bitmap.mark_used(index, 1 << order);

        Some(self.bitmap.frame_at(index))
    }

    /// Returns a block to the free lists, merging it with free buddies.
    ///
    /// # Panics
    ///
    /// On an invalid order, a frame outside the managed range, a block that
    /// is not aligned to its order, or a block that is not fully allocated.
    pub fn free(&mut self, frame: PhysFrame, order: usize) {
        assert!(order < MAX_ORDER, "invalid free order {}", order);
        let Some(mut index) = self.bitmap.index_of(frame) else {
            panic!("freeing frame {:#x} outside managed memory", frame.number());
        };
        assert!(
            index % (1 << order) == 0,
            "freeing frame {:#x} not aligned to order {}",
            frame.number(),
            order
        );
        assert!(
            self.bitmap.is_used(index, 1 << order),
            "double free of frame {:#x} order {}",
            frame.number(),
            order
        );

        self.bitmap.mark_free(index, 1 << order);

        let mut order = order;
        while order + 1 < MAX_ORDER {
            let buddy = index ^ (1 << order);
            if !self.bitmap.is_free(buddy, order) {
                break;
            }
            self.unlink(buddy, order);
            index = index.min(buddy);
            order += 1;
        }
        self.push(index, order);
    }

    /// Free block count per order.
    pub fn statistics(&self) -> [usize; MAX_ORDER] {
        self.nr_free
    }

    /// Frames covered by the free lists.
    pub fn free_list_frames(&self) -> usize {
        self.nr_free
            .iter()
            .enumerate()
            .map(|(order, count)| count << order)
            .sum()
    }

    /// Walks the free list of `order`.
    pub fn free_blocks(&self, order: usize) -> impl Iterator<Item = PhysFrame> + '_ {
        let mut cursor = self.free_heads[order];
        core::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let index = cursor as usize;
            cursor = self.links[index].next;
            Some(self.bitmap.frame_at(index))
        })
    }

    pub fn bitmap(&self) -> &FrameBitmap<'a> {
        &self.bitmap
    }

    pub fn total_frames(&self) -> usize {
        self.bitmap.frames()
    }

    pub fn free_frames(&self) -> usize {
        self.bitmap.free_frames()
    }

    pub fn used_frames(&self) -> usize {
        self.bitmap.used_frames()
    }

    /// Whether `frame` is currently allocated or reserved.
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        self.bitmap
            .index_of(frame)
            .map_or(true, |index| !self.bitmap.is_frame_free(index))
    }
}

unsafe impl FrameAllocator for BuddyAllocator<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc(0)
    }
}

impl FrameDeallocator for BuddyAllocator<'_> {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.free(frame, 0);
    }
}
