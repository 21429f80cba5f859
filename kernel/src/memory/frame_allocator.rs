use core::ptr::addr_of_mut;

use spin::Mutex;

use crate::boot::BootInfo;
use crate::constants::memory::{BITMAP_WORDS, MAX_FRAMES, MAX_ORDER};
use crate::interrupts::InterruptGuard;
use crate::memory::bitmap::FrameBitmap;
use crate::memory::buddy::{BuddyAllocator, FrameLink};
use crate::memory::{MemoryError, PhysFrame};

/// A source of single physical frames.
///
/// # Safety
///
/// Implementations must hand out frames that are unused and not handed out
/// again until they are deallocated.
pub unsafe trait FrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
}

pub trait FrameDeallocator {
    /// # Safety
    ///
    /// The caller must own `frame` and stop using it.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame);
}

/// Global frame allocator that makes it so we just have one actual allocator throughout codebase
pub static FRAME_ALLOCATOR: Mutex<Option<BuddyAllocator<'static>>> = Mutex::new(None);

static mut BITMAP_STORAGE: [u32; BITMAP_WORDS] = [0; BITMAP_WORDS];
static mut LINK_STORAGE: [FrameLink; MAX_FRAMES] = [FrameLink::ZEROED; MAX_FRAMES];

/// Builds the bitmap and the free lists from the boot memory map.
///
/// A second call leaves the existing allocator in place.
pub fn init(boot_info: &BootInfo) -> Result<(), MemoryError> {
    let _guard = InterruptGuard::new();
    let mut slot = FRAME_ALLOCATOR.lock();
    if slot.is_some() {
        log::warn!("Frame allocator already initialized");
        return Ok(());
    }

    boot_info.log_memory_map();

    // SAFETY: the storage is only ever borrowed here, once, under the lock
    // and with `slot` still empty.
    let (words, links) = unsafe {
        (
            &mut *addr_of_mut!(BITMAP_STORAGE),
            &mut *addr_of_mut!(LINK_STORAGE),
        )
    };
    let bitmap = FrameBitmap::init(words, boot_info)?;
    let frames = bitmap.frames();
    *slot = Some(BuddyAllocator::new(bitmap, &mut links[..frames]));
    Ok(())
}

pub fn with_frame_allocator<F, R>(f: F) -> Result<R, MemoryError>
where
    F: FnOnce(&mut BuddyAllocator<'static>) -> R,
{
    let _guard = InterruptGuard::new();
    let mut guard = FRAME_ALLOCATOR.lock();
    match guard.as_mut() {
        Some(allocator) => Ok(f(allocator)),
        None => Err(MemoryError::NotInitialized),
    }
}

/// Allocates `2^order` contiguous frames, `None` when memory is exhausted.
pub fn alloc_pages(order: usize) -> Option<PhysFrame> {
    with_frame_allocator(|allocator| allocator.alloc(order))
        .ok()
        .flatten()
}

/// Returns a block obtained from [`alloc_pages`] with the same order.
pub fn free_pages(frame: PhysFrame, order: usize) {
    if with_frame_allocator(|allocator| allocator.free(frame, order)).is_err() {
        panic!("free_pages before the frame allocator exists");
    }
}

pub fn alloc_page() -> Option<PhysFrame> {
    alloc_pages(0)
}

pub fn free_page(frame: PhysFrame) {
    free_pages(frame, 0)
}

pub fn statistics() -> Result<[usize; MAX_ORDER], MemoryError> {
    with_frame_allocator(|allocator| allocator.statistics())
}

/// Prints the free block count for every order.
pub fn log_statistics() {
    let summary = with_frame_allocator(|allocator| {
        (
            allocator.statistics(),
            allocator.free_frames(),
            allocator.total_frames(),
        )
    });
    let Ok((stats, free, total)) = summary else {
        return;
    };
    log::info!("Free frames: {} of {}", free, total);
    for (order, count) in stats.iter().enumerate() {
        log::info!("  order {:2} ({:5} KiB): {} free", order, 4 << order, count);
    }
}
