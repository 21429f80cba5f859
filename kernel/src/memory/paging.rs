//! Two-level i386 page tables.

use core::fmt;
use core::ops::{Index, IndexMut};
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use crate::boot::KernelLayout;
use crate::constants::memory::{FRAME_SHIFT, FRAME_SIZE, PAGE_TABLE_ENTRIES, VIDEO_MEMORY};
use crate::memory::buddy::BuddyAllocator;
use crate::memory::frame_allocator::FrameAllocator;
use crate::memory::{PhysAddr, PhysFrame, PhysOffset, VirtAddr};

bitflags! {
    /// Status bits shared by directory and table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// 4 MiB page in a directory entry, needs CR4.PSE.
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

const ADDRESS_MASK: u32 = !(FRAME_SIZE as u32 - 1);

/// Set once translation is on; TLB entries only need flushing afterwards.
static PAGING_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn paging_enabled() -> bool {
    PAGING_ENABLED.load(Ordering::Acquire)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    FrameAllocationFailed,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::FrameAllocationFailed => {
                write!(f, "No frame left for a new page table")
            }
        }
    }
}

/// A 32-bit directory or table entry: frame address in bits 12..32, flags below.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn new() -> Self {
        PageTableEntry(0)
    }

    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    pub const fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDRESS_MASK)
    }

    pub fn frame(&self) -> Option<PhysFrame> {
        self.flags()
            .contains(PageTableFlags::PRESENT)
            .then(|| PhysFrame::containing_address(self.addr()))
    }

    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        self.0 = (addr.as_u32() & ADDRESS_MASK) | flags.bits();
    }

    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.0 = (self.0 & ADDRESS_MASK) | flags.bits();
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("flags", &self.flags())
            .finish()
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::new());
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

/// Drops any cached translation for `addr`.
pub fn flush(addr: VirtAddr) {
    if !paging_enabled() {
        return;
    }
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) addr.as_u32(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "x86"))]
    let _ = addr;
}

/// Owns a page directory and the tables hanging off it.
pub struct PageTableManager {
    directory: PhysFrame,
    offset: PhysOffset,
}

impl PageTableManager {
    /// Allocates and zeroes an empty directory.
    pub fn new(
        allocator: &mut impl FrameAllocator,
        offset: PhysOffset,
    ) -> Result<Self, MapError> {
        let directory = allocator
            .allocate_frame()
            .ok_or(MapError::FrameAllocationFailed)?;
        unsafe { offset.zero_frame(directory) };
        Ok(PageTableManager { directory, offset })
    }

    /// Builds the boot address space.
    ///
    /// Every frame the allocator reports used from the kernel image start
    /// upwards is identity mapped, as are the boot stack and video memory.
    /// The directory and every table are then identity mapped too, repeating
    /// until no further table had to be created.
    pub fn init(
        allocator: &mut BuddyAllocator,
        layout: &KernelLayout,
        offset: PhysOffset,
    ) -> Result<Self, MapError> {
        let mut manager = Self::new(allocator, offset)?;

        let base = allocator.bitmap().frame_at(0).number();
        let first = ((layout.image_start >> FRAME_SHIFT).saturating_sub(base)) as usize;
        for index in first..allocator.total_frames() {
            if allocator.bitmap().is_frame_free(index) {
                continue;
            }
            let addr = allocator.bitmap().frame_at(index).start_address();
            manager.identity_map(addr, allocator)?;
        }

        let mut addr = layout.stack_start & ADDRESS_MASK;
        while addr < layout.stack_end {
            manager.identity_map(PhysAddr::new(addr), allocator)?;
            addr += FRAME_SIZE as u32;
        }
        manager.identity_map(PhysAddr::new(VIDEO_MEMORY), allocator)?;

        loop {
            let tables = manager.table_count();
            manager.identity_map(manager.directory.start_address(), allocator)?;
            for slot in 0..PAGE_TABLE_ENTRIES {
                if let Some(table) = manager.directory_entry(slot).frame() {
                    manager.identity_map(table.start_address(), allocator)?;
                }
            }
            if manager.table_count() == tables {
                break;
            }
        }

        log::debug!(
            "Boot page tables: {} tables, {} frames in use",
            manager.table_count(),
            allocator.used_frames()
        );
        Ok(manager)
    }

    /// Identity maps every frame the allocator manages, so frames allocated
    /// after paging is on stay reachable at their physical address.
    pub fn identity_map_managed(&mut self, allocator: &mut BuddyAllocator) -> Result<(), MapError> {
        for index in 0..allocator.total_frames() {
            let addr = allocator.bitmap().frame_at(index).start_address();
            self.identity_map(addr, allocator)?;
        }
        Ok(())
    }

    fn identity_map(
        &mut self,
        addr: PhysAddr,
        allocator: &mut impl FrameAllocator,
    ) -> Result<(), MapError> {
        self.map(VirtAddr::new(addr.as_u32()), addr, allocator)
    }

    fn table_ptr(&self, frame: PhysFrame) -> *mut PageTable {
        self.offset.as_mut_ptr(frame.start_address())
    }

    pub fn directory(&self) -> PhysFrame {
        self.directory
    }

    pub fn directory_entry(&self, slot: usize) -> PageTableEntry {
        unsafe { (&(*self.table_ptr(self.directory)))[slot] }
    }

    /// Number of directory slots with a table installed.
    pub fn table_count(&self) -> usize {
        unsafe { &*self.table_ptr(self.directory) }
            .iter()
            .filter(|entry| entry.flags().contains(PageTableFlags::PRESENT))
            .count()
    }

    /// Maps `linear` onto `physical`, present and writable for the kernel.
    pub fn map(
        &mut self,
        linear: VirtAddr,
        physical: PhysAddr,
        allocator: &mut impl FrameAllocator,
    ) -> Result<(), MapError> {
        self.map_with_flags(
            linear,
            physical,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            allocator,
        )
    }

    /// Installs a translation, creating the page table on first use of its
    /// directory slot. An existing entry is overwritten.
    pub fn map_with_flags(
        &mut self,
        linear: VirtAddr,
        physical: PhysAddr,
        flags: PageTableFlags,
        allocator: &mut impl FrameAllocator,
    ) -> Result<(), MapError> {
        let directory = unsafe { &mut *self.table_ptr(self.directory) };
        let slot = &mut directory[linear.directory_index()];
        let user = flags & PageTableFlags::USER_ACCESSIBLE;

        let table_frame = match slot.frame() {
            Some(frame) => {
                if !slot.flags().contains(user) {
                    slot.set_flags(slot.flags() | user);
                }
                frame
            }
            None => {
                let frame = allocator
                    .allocate_frame()
                    .ok_or(MapError::FrameAllocationFailed)?;
                unsafe { self.offset.zero_frame(frame) };
                slot.set(
                    frame.start_address(),
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | user,
                );
                frame
            }
        };

        let table = unsafe { &mut *self.table_ptr(table_frame) };
        table[linear.table_index()].set(physical, flags | PageTableFlags::PRESENT);
        flush(linear);
        Ok(())
    }

    /// Walks the directory and table for `linear`.
    pub fn translate(&self, linear: VirtAddr) -> Option<PhysAddr> {
        let table_frame = self.directory_entry(linear.directory_index()).frame()?;
        let table = unsafe { &*self.table_ptr(table_frame) };
        let page = table[linear.table_index()].frame()?;
        Some(PhysAddr::new(
            page.start_address().as_u32() | linear.page_offset(),
        ))
    }

    /// Loads the directory into CR3 and sets CR0.PG.
    ///
    /// # Safety
    ///
    /// Everything the kernel touches afterwards, including the code running
    /// this, must already be mapped.
    pub unsafe fn enable(&self) {
        #[cfg(target_arch = "x86")]
        core::arch::asm!(
            "mov cr3, {dir}",
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            dir = in(reg) self.directory.start_address().as_u32(),
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        );
        PAGING_ENABLED.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::MemoryRegion;
    use crate::memory::test_support::{allocator, compact_layout, SimulatedRam};

    const MIB: u32 = 1 << 20;

    #[test]
    fn test_entry_bits_match_hardware() {
        assert_eq!(PageTableFlags::PRESENT.bits(), 0x1);
        assert_eq!(PageTableFlags::WRITABLE.bits(), 0x2);
        assert_eq!(PageTableFlags::USER_ACCESSIBLE.bits(), 0x4);
        assert_eq!(PageTableFlags::DIRTY.bits(), 0x40);

        let mut entry = PageTableEntry::new();
        assert!(entry.is_unused());
        entry.set(
            PhysAddr::new(0x0123_4FFF),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
        assert_eq!(entry.bits(), 0x0123_4003);
        assert_eq!(entry.frame(), Some(PhysFrame::from_number(0x1234)));
    }

    #[test]
    fn test_startup_identity_maps_image_and_video() {
        let mut ram = SimulatedRam::new(0, 32 * MIB as usize);
        let mut allocator = allocator(
            &[MemoryRegion::usable(0, 32 << 20)],
            compact_layout(0, 2 * MIB),
        );
        assert_eq!(allocator.free_frames(), 7680);

        let layout = compact_layout(0, 2 * MIB);
        let manager = PageTableManager::init(&mut allocator, &layout, ram.offset()).unwrap();

        // Directory and a single table for slot 0, both taken from frame 512 up.
        assert_eq!(manager.directory(), PhysFrame::from_number(512));
        assert_eq!(manager.table_count(), 1);
        assert_eq!(allocator.used_frames(), 514);

        for addr in [0, 0x1000, 0xB8000, 0x1F_F000, 0x20_0000, 0x20_1000] {
            assert_eq!(
                manager.translate(VirtAddr::new(addr)),
                Some(PhysAddr::new(addr)),
                "{:#x}",
                addr
            );
        }
        assert_eq!(manager.translate(VirtAddr::new(0x20_2000)), None);

        let pde = manager.directory_entry(0);
        assert_eq!(pde.addr(), PhysAddr::new(0x20_1000));
        assert_eq!(pde.bits() & 0xFFF, 0x3);
        assert_eq!(ram.read_u32(0x20_1000 + 0xB8 * 4), 0xB8003);
    }

    #[test]
    fn test_managed_range_identity_map() {
        let mut ram = SimulatedRam::new(0, 32 * MIB as usize);
        let layout = compact_layout(0, 2 * MIB);
        let mut allocator = allocator(&[MemoryRegion::usable(0, 32 << 20)], layout);
        let mut manager = PageTableManager::init(&mut allocator, &layout, ram.offset()).unwrap();
        assert_eq!(manager.translate(VirtAddr::new(0x100_0000)), None);

        manager.identity_map_managed(&mut allocator).unwrap();
        // 8192 managed frames span eight directory slots.
        assert_eq!(manager.table_count(), 8);
        assert_eq!(allocator.used_frames(), 514 + 7);
        for slot in 0..8 {
            let table = manager.directory_entry(slot).addr();
            assert_eq!(manager.translate(VirtAddr::new(table.as_u32())), Some(table));
        }
        assert_eq!(
            manager.translate(VirtAddr::new(0x1FF_FFFF)),
            Some(PhysAddr::new(0x1FF_FFFF))
        );
        assert_eq!(manager.translate(VirtAddr::new(0x200_0000)), None);

        // Frames handed out afterwards need no further mapping.
        for order in [0, 1, 4] {
            let frame = allocator.alloc(order).unwrap();
            let addr = frame.start_address();
            assert_eq!(manager.translate(VirtAddr::new(addr.as_u32())), Some(addr));
            let last = PhysAddr::new(addr.as_u32() + ((FRAME_SIZE << order) - 1) as u32);
            assert_eq!(manager.translate(VirtAddr::new(last.as_u32())), Some(last));
        }
        assert_eq!(manager.table_count(), 8);
    }

    #[test]
    fn test_kernel_above_low_memory_leaves_video_neighbours_unmapped() {
        let mut ram = SimulatedRam::new(0, 16 * MIB as usize);
        let layout = compact_layout(MIB, 3 * MIB);
        let mut allocator = allocator(&[MemoryRegion::usable(0, 16 << 20)], layout);
        assert!(allocator.is_frame_used(PhysFrame::from_number(0xB8)));
        assert!(!allocator.is_frame_used(PhysFrame::from_number(0xB7)));
        assert!(!allocator.is_frame_used(PhysFrame::from_number(0xB9)));

        let manager = PageTableManager::init(&mut allocator, &layout, ram.offset()).unwrap();
        assert_eq!(
            manager.translate(VirtAddr::new(0xB8123)),
            Some(PhysAddr::new(0xB8123))
        );
        assert_eq!(manager.translate(VirtAddr::new(0xB7000)), None);
        assert_eq!(
            manager.translate(VirtAddr::new(0x2F_F000)),
            Some(PhysAddr::new(0x2F_F000))
        );
        let directory = manager.directory().start_address();
        assert_eq!(manager.translate(VirtAddr::new(directory.as_u32())), Some(directory));
    }

    #[test]
    fn test_translation_round_trip() {
        let mut ram = SimulatedRam::new(0, 32 * MIB as usize);
        let layout = compact_layout(0, 2 * MIB);
        let mut allocator = allocator(&[MemoryRegion::usable(0, 32 << 20)], layout);
        let mut manager = PageTableManager::init(&mut allocator, &layout, ram.offset()).unwrap();
        let tables = manager.table_count();

        manager
            .map(VirtAddr::new(0x0050_38FB), PhysAddr::new(0x0050_3000), &mut allocator)
            .unwrap();
        assert_eq!(manager.table_count(), tables + 1);
        assert_eq!(
            manager.translate(VirtAddr::new(0x0050_38FB)),
            Some(PhysAddr::new(0x0050_38FB))
        );

        // Non-identity mapping resolves to the chosen frame.
        manager
            .map(VirtAddr::new(0x0040_0000), PhysAddr::new(0x0100_0000), &mut allocator)
            .unwrap();
        assert_eq!(
            manager.translate(VirtAddr::new(0x0040_0ABC)),
            Some(PhysAddr::new(0x0100_0ABC))
        );
        // Same directory slot, no extra table.
        assert_eq!(manager.table_count(), tables + 1);

        // Remapping overwrites.
        manager
            .map(VirtAddr::new(0x0040_0000), PhysAddr::new(0x0100_1000), &mut allocator)
            .unwrap();
        assert_eq!(
            manager.translate(VirtAddr::new(0x0040_0000)),
            Some(PhysAddr::new(0x0100_1000))
        );
    }

    #[test]
    fn test_user_mapping_marks_both_levels() {
        let mut ram = SimulatedRam::new(0, 32 * MIB as usize);
        let layout = compact_layout(0, 2 * MIB);
        let mut allocator = allocator(&[MemoryRegion::usable(0, 32 << 20)], layout);
        let mut manager = PageTableManager::init(&mut allocator, &layout, ram.offset()).unwrap();

        let linear = VirtAddr::new(0x0080_0000);
        manager
            .map_with_flags(
                linear,
                PhysAddr::new(0x0090_0000),
                PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
                &mut allocator,
            )
            .unwrap();
        let pde = manager.directory_entry(linear.directory_index());
        assert!(pde.flags().contains(PageTableFlags::USER_ACCESSIBLE));
        let table = pde.addr().as_u32();
        let pte = ram.read_u32(table + 4 * linear.table_index() as u32);
        assert_eq!(pte, 0x0090_0000 | 0x7);
    }

    #[test]
    fn test_map_reports_exhaustion() {
        let mut ram = SimulatedRam::new(0, 4 * MIB as usize);
        let layout = compact_layout(0, 4 * MIB - 0x1000);
        let mut allocator = allocator(&[MemoryRegion::usable(0, 4 << 20)], layout);
        // A single free frame: the directory takes it.
        let mut manager = PageTableManager::new(&mut allocator, ram.offset()).unwrap();
        assert_eq!(
            manager.map(VirtAddr::new(0), PhysAddr::new(0), &mut allocator),
            Err(MapError::FrameAllocationFailed)
        );
    }
}
