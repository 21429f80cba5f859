//! What the core consumes from the bootloader: the physical memory map and
//! where the kernel image and its boot stack live.

pub mod multiboot;

use core::fmt;

use arrayvec::ArrayVec;

use crate::constants::memory::{BOOT_STACK_BOTTOM, BOOT_STACK_TOP, MAX_MEMORY_REGIONS};

/// Memory map type for RAM the kernel may use.
pub const REGION_USABLE: u32 = 1;

/// One `(base, length, type)` descriptor from the boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
}

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, kind: u32) -> Self {
        MemoryRegion { base, length, kind }
    }

    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, REGION_USABLE)
    }

    /// Usable RAM with a nonzero base or a nonzero length.
    pub fn is_usable(&self) -> bool {
        self.kind == REGION_USABLE && (self.base != 0 || self.length != 0)
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Physical placement of the loaded kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLayout {
    pub image_start: u32,
    pub image_end: u32,
    pub stack_start: u32,
    pub stack_end: u32,
}

impl KernelLayout {
    /// Layout for an image in `[image_start, image_end)` running on the fixed boot stack.
    pub const fn new(image_start: u32, image_end: u32) -> Self {
        KernelLayout {
            image_start,
            image_end,
            stack_start: BOOT_STACK_BOTTOM,
            stack_end: BOOT_STACK_TOP,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootInfo {
    pub regions: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    pub layout: KernelLayout,
}

impl BootInfo {
    /// Builds boot information from an explicit region list, dropping entries past capacity.
    pub fn new(regions: &[MemoryRegion], layout: KernelLayout) -> Self {
        BootInfo {
            regions: regions.iter().copied().take(MAX_MEMORY_REGIONS).collect(),
            layout,
        }
    }

    pub fn usable_regions(&self) -> impl Iterator<Item = &MemoryRegion> + '_ {
        self.regions.iter().filter(|region| region.is_usable())
    }

    pub fn log_memory_map(&self) {
        log::info!("Boot memory map ({} entries):", self.regions.len());
        for region in &self.regions {
            log::info!(
                "  {:#011x} - {:#011x} type {}",
                region.base,
                region.end(),
                region.kind
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    BadMagic(u32),
    NoMemoryMap,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BootError::BadMagic(magic) => {
                write!(f, "Not loaded by a multiboot loader (magic {:#x})", magic)
            }
            BootError::NoMemoryMap => write!(f, "Bootloader did not provide a memory map"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_filter() {
        assert!(MemoryRegion::usable(0x10_0000, 0x100).is_usable());
        assert!(MemoryRegion::usable(0, 0x9_F000).is_usable());
        assert!(!MemoryRegion::usable(0, 0).is_usable());
        assert!(!MemoryRegion::new(0x10_0000, 0x100, 2).is_usable());
    }

    #[test]
    fn test_boot_info_caps_region_count() {
        let regions = [MemoryRegion::usable(0x1000, 0x1000); MAX_MEMORY_REGIONS + 4];
        let info = BootInfo::new(&regions, KernelLayout::new(0x10_0000, 0x20_0000));
        assert_eq!(info.regions.len(), MAX_MEMORY_REGIONS);
        assert_eq!(info.layout.stack_end, BOOT_STACK_TOP);
    }
}
