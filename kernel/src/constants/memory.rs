//! Physical memory geometry and fixed physical reservations.

pub const FRAME_SIZE: usize = 4096;
pub const FRAME_SHIFT: u32 = 12;

/// Orders 0..MAX_ORDER, i.e. 4 KiB up to 4 MiB blocks.
pub const MAX_ORDER: usize = 11;
pub const MAX_BLOCK_FRAMES: usize = 1 << (MAX_ORDER - 1);
pub const MAX_BLOCK_SIZE: usize = MAX_BLOCK_FRAMES * FRAME_SIZE;

// Bitmap storage: one u32 word tracks 32 frames, 4096 words cover 512 MiB.
pub const BITMAP_ENTRY_SIZE: usize = 32;
pub const BITMAP_WORDS: usize = 4096;
pub const FULL_BITMAP_ENTRY: u32 = 0xFFFF_FFFF;
pub const MAX_FRAMES: usize = BITMAP_WORDS * BITMAP_ENTRY_SIZE;

/// Text-mode video memory, always reserved and identity mapped.
pub const VIDEO_MEMORY: u32 = 0xB8000;

// Boot stack reservation, the stack grows down from BOOT_STACK_TOP.
pub const BOOT_STACK_BOTTOM: u32 = 0x7F_C000;
pub const BOOT_STACK_TOP: u32 = 0x80_0000;

pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Upper bound on memory map entries kept from the bootloader.
pub const MAX_MEMORY_REGIONS: usize = 32;
