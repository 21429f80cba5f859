//! Physical frame management and the kernel's two-level page tables.

pub mod bitmap;
pub mod buddy;
pub mod frame_allocator;
pub mod paging;

use core::fmt;

use spin::Mutex;

use crate::boot::BootInfo;
use crate::constants::memory::{FRAME_SHIFT, FRAME_SIZE};
use crate::interrupts::InterruptGuard;

pub use frame_allocator::{
    alloc_page, alloc_pages, free_page, free_pages, with_frame_allocator, FrameAllocator,
    FrameDeallocator,
};
use paging::{MapError, PageTableFlags, PageTableManager};

/// A 32-bit physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        PhysAddr(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn align_down(self, align: u32) -> Self {
        PhysAddr(self.0 & !(align - 1))
    }

    pub const fn is_aligned(self, align: u32) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A 32-bit linear address, split 10/10/12 by the MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        VirtAddr(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Bits 22..32 select the page directory entry.
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Bits 12..22 select the page table entry.
    pub const fn table_index(self) -> usize {
        ((self.0 >> FRAME_SHIFT) & 0x3FF) as usize
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & (FRAME_SIZE as u32 - 1)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A 4 KiB physical frame, identified by its absolute frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame {
    number: u32,
}

impl PhysFrame {
    pub const fn from_number(number: u32) -> Self {
        PhysFrame { number }
    }

    pub const fn containing_address(addr: PhysAddr) -> Self {
        PhysFrame {
            number: addr.as_u32() >> FRAME_SHIFT,
        }
    }

    pub const fn number(self) -> u32 {
        self.number
    }

    pub const fn start_address(self) -> PhysAddr {
        PhysAddr(self.number << FRAME_SHIFT)
    }
}

/// Where physical memory is visible in the current address space.
///
/// The kernel identity maps everything it touches, so the offset is zero on
/// real hardware. Host tests point it at a page-aligned buffer instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysOffset(usize);

impl PhysOffset {
    pub const IDENTITY: PhysOffset = PhysOffset(0);

    /// Window in which physical address `base` is found at `window`.
    pub fn for_window(window: *mut u8, base: PhysAddr) -> Self {
        PhysOffset((window as usize).wrapping_sub(base.as_u32() as usize))
    }

    pub fn as_mut_ptr<T>(self, addr: PhysAddr) -> *mut T {
        self.0.wrapping_add(addr.as_u32() as usize) as *mut T
    }

    /// Fills the frame with zeroes.
    ///
    /// # Safety
    ///
    /// The frame must be owned by the caller and visible through this window.
    pub unsafe fn zero_frame(self, frame: PhysFrame) {
        core::ptr::write_bytes(
            self.as_mut_ptr::<u8>(frame.start_address()),
            0,
            FRAME_SIZE,
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    NoUsableMemory,
    BitmapTooSmall { needed: usize, capacity: usize },
    OutOfFrames,
    NotInitialized,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryError::NoUsableMemory => write!(f, "No usable memory reported by the bootloader"),
            MemoryError::BitmapTooSmall { needed, capacity } => write!(
                f,
                "Bitmap too small: {} frames reported, capacity is {}",
                needed, capacity
            ),
            MemoryError::OutOfFrames => write!(f, "Out of physical frames"),
            MemoryError::NotInitialized => write!(f, "Memory manager is not initialized"),
        }
    }
}

impl From<MapError> for MemoryError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::FrameAllocationFailed => MemoryError::OutOfFrames,
        }
    }
}

/// Kernel address space, built once by [`init_paging`].
pub static KERNEL_PAGE_TABLE: Mutex<Option<PageTableManager>> = Mutex::new(None);

/// Builds the frame allocator from the boot memory map, then the kernel page
/// tables identity mapping the kernel, its stack, video memory and the rest
/// of managed RAM.
pub fn init_paging(boot_info: &BootInfo) -> Result<(), MemoryError> {
    frame_allocator::init(boot_info)?;

    let _guard = InterruptGuard::new();
    let mut page_table = KERNEL_PAGE_TABLE.lock();
    let manager = with_frame_allocator(|allocator| {
        let mut manager =
            PageTableManager::init(allocator, &boot_info.layout, PhysOffset::IDENTITY)?;
        // Frames handed out once paging is on are reached through the identity window.
        manager.identity_map_managed(allocator)?;
        Ok::<_, MapError>(manager)
    })??;

    log::info!(
        "Kernel page directory at {:#x}",
        manager.directory().start_address()
    );
    frame_allocator::log_statistics();
    *page_table = Some(manager);
    Ok(())
}

/// Maps `linear` onto `physical` with kernel read/write access.
pub fn map(linear: VirtAddr, physical: PhysAddr) -> Result<(), MemoryError> {
    map_with_flags(linear, physical, PageTableFlags::WRITABLE)
}

pub fn map_with_flags(
    linear: VirtAddr,
    physical: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), MemoryError> {
    let _guard = InterruptGuard::new();
    let mut page_table = KERNEL_PAGE_TABLE.lock();
    let manager = page_table.as_mut().ok_or(MemoryError::NotInitialized)?;
    with_frame_allocator(|allocator| {
        manager.map_with_flags(linear, physical, flags | PageTableFlags::PRESENT, allocator)
    })??;
    Ok(())
}

/// Identity maps every frame of `[start, end)`.
pub fn identity_map(start: PhysAddr, end: PhysAddr, flags: PageTableFlags) -> Result<(), MemoryError> {
    for frame in frame_range(start, end) {
        let addr = frame.start_address();
        map_with_flags(VirtAddr::new(addr.as_u32()), addr, flags)?;
    }
    Ok(())
}

/// Frames overlapping `[start, end)`, walked by frame number so a range
/// ending in the last page below 4 GiB does not wrap.
pub fn frame_range(start: PhysAddr, end: PhysAddr) -> impl Iterator<Item = PhysFrame> {
    let first = PhysFrame::containing_address(start).number();
    let last = ((end.as_u32() as u64 + FRAME_SIZE as u64 - 1) >> FRAME_SHIFT) as u32;
    (first..last).map(PhysFrame::from_number)
}

pub fn translate(linear: VirtAddr) -> Option<PhysAddr> {
    let _guard = InterruptGuard::new();
    KERNEL_PAGE_TABLE
        .lock()
        .as_ref()
        .and_then(|manager| manager.translate(linear))
}

/// Loads the kernel directory and turns on translation. Only done once.
pub fn enable_paging() -> Result<(), MemoryError> {
    let _guard = InterruptGuard::new();
    let page_table = KERNEL_PAGE_TABLE.lock();
    let manager = page_table.as_ref().ok_or(MemoryError::NotInitialized)?;
    unsafe { manager.enable() };
    log::info!("Paging enabled");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_addr_split() {
        let addr = VirtAddr::new(0x0050_38FB);
        assert_eq!(addr.directory_index(), 1);
        assert_eq!(addr.table_index(), 0x103);
        assert_eq!(addr.page_offset(), 0x8FB);
    }

    #[test]
    fn test_frame_addresses() {
        let frame = PhysFrame::containing_address(PhysAddr::new(0xB8FFF));
        assert_eq!(frame.number(), 0xB8);
        assert_eq!(frame.start_address(), PhysAddr::new(0xB8000));
        assert!(frame.start_address().is_aligned(FRAME_SIZE as u32));
    }

    #[test]
    fn test_frame_range_covers_partial_frames() {
        let frames: Vec<_> = frame_range(PhysAddr::new(0x1FFF), PhysAddr::new(0x3001))
            .map(PhysFrame::number)
            .collect();
        assert_eq!(frames, vec![1, 2, 3]);
        assert_eq!(frame_range(PhysAddr::new(0x5000), PhysAddr::new(0x5000)).count(), 0);
    }

    #[test]
    fn test_frame_range_reaches_top_of_address_space() {
        let frames: Vec<_> = frame_range(PhysAddr::new(0xFFFF_E000), PhysAddr::new(0xFFFF_FFFF))
            .map(PhysFrame::number)
            .collect();
        assert_eq!(frames, vec![0xF_FFFE, 0xF_FFFF]);
    }

    #[test]
    fn test_phys_offset_window() {
        let mut ram = test_support::SimulatedRam::new(0x40_0000, 2 * FRAME_SIZE);
        let offset = ram.offset();
        unsafe {
            offset
                .as_mut_ptr::<u32>(PhysAddr::new(0x40_1004))
                .write(0xDEAD_BEEF);
        }
        assert_eq!(ram.read_u32(0x40_1004), 0xDEAD_BEEF);
    }
}
