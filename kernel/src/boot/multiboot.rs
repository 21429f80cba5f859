//! Multiboot (version 1) boot information.

use arrayvec::ArrayVec;

use super::{BootError, BootInfo, KernelLayout, MemoryRegion};
use crate::constants::memory::MAX_MEMORY_REGIONS;

/// Value left in `eax` by a compliant loader.
pub const BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// `mmap_length`/`mmap_addr` are valid.
const FLAG_MEMORY_MAP: u32 = 1 << 6;

/// Size of one memory map record after its own `size` field.
const ENTRY_BODY: usize = 20;

/// Leading part of the multiboot information structure, up to the memory map.
#[repr(C)]
struct MultibootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}

/// Walks the size-prefixed memory map records in `bytes`.
///
/// Each record's `size` counts the bytes after itself, so the next record
/// starts `size + 4` bytes further on. A truncated trailing record is ignored
/// and at most [`MAX_MEMORY_REGIONS`] entries are kept. A `size` that would
/// step past the end of the address space ends the walk.
pub fn parse_memory_map(bytes: &[u8]) -> ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS> {
    let mut regions = ArrayVec::new();
    let mut offset = 0usize;

    while bytes.len().saturating_sub(offset) >= 4 + ENTRY_BODY && !regions.is_full() {
        let size = read_u32(bytes, offset) as usize;
        let body = offset + 4;
        regions.push(MemoryRegion::new(
            read_u64(bytes, body),
            read_u64(bytes, body + 8),
            read_u32(bytes, body + 16),
        ));
        match body.checked_add(size.max(ENTRY_BODY)) {
            Some(next) => offset = next,
            None => break,
        }
    }

    regions
}

/// Reads the boot information the loader left at `info_addr`.
///
/// # Safety
///
/// `info_addr` must point at a multiboot information structure whose memory
/// map is readable at its physical address.
pub unsafe fn from_multiboot(
    magic: u32,
    info_addr: u32,
    layout: KernelLayout,
) -> Result<BootInfo, BootError> {
    if magic != BOOTLOADER_MAGIC {
        return Err(BootError::BadMagic(magic));
    }

    let info = &*(info_addr as usize as *const MultibootInfo);
    if info.flags & FLAG_MEMORY_MAP == 0 || info.mmap_length == 0 {
        return Err(BootError::NoMemoryMap);
    }

    let map = core::slice::from_raw_parts(
        info.mmap_addr as usize as *const u8,
        info.mmap_length as usize,
    );
    let regions = parse_memory_map(map);
    if regions.is_empty() {
        return Err(BootError::NoMemoryMap);
    }

    Ok(BootInfo { regions, layout })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(buf: &mut Vec<u8>, size: u32, base: u64, length: u64, kind: u32) {
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&base.to_le_bytes());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&kind.to_le_bytes());
        buf.resize(buf.len() + (size as usize - ENTRY_BODY), 0);
    }

    #[test]
    fn test_parse_qemu_style_map() {
        let mut buf = Vec::new();
        record(&mut buf, 20, 0, 0x9_FC00, 1);
        record(&mut buf, 20, 0x9_FC00, 0x400, 2);
        record(&mut buf, 20, 0x10_0000, 0x1F0_0000, 1);

        let regions = parse_memory_map(&buf);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0], MemoryRegion::usable(0, 0x9_FC00));
        assert_eq!(regions[1].kind, 2);
        assert_eq!(regions[2].end(), 0x200_0000);
    }

    #[test]
    fn test_parse_honours_record_size() {
        let mut buf = Vec::new();
        record(&mut buf, 24, 0x10_0000, 0x1000, 1);
        record(&mut buf, 20, 0x20_0000, 0x2000, 1);

        let regions = parse_memory_map(&buf);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].base, 0x20_0000);
    }

    #[test]
    fn test_parse_ignores_truncated_tail() {
        let mut buf = Vec::new();
        record(&mut buf, 20, 0x10_0000, 0x1000, 1);
        buf.extend_from_slice(&[20, 0, 0, 0, 1, 2]);

        assert_eq!(parse_memory_map(&buf).len(), 1);
    }

    #[test]
    fn test_parse_stops_on_oversized_record() {
        let mut buf = Vec::new();
        record(&mut buf, 20, 0x10_0000, 0x1000, 1);
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        buf.extend_from_slice(&0x20_0000u64.to_le_bytes());
        buf.extend_from_slice(&0x1000u64.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        record(&mut buf, 20, 0x30_0000, 0x1000, 1);

        let regions = parse_memory_map(&buf);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].base, 0x20_0000);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let layout = KernelLayout::new(0x10_0000, 0x20_0000);
        let err = unsafe { from_multiboot(0x1234, 0, layout) }.unwrap_err();
        assert_eq!(err, BootError::BadMagic(0x1234));
    }
}
