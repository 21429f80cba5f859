//! Global Descriptor Table layout and segment selectors.

pub const KERNEL_CS: u16 = 0x10;
pub const KERNEL_DS: u16 = 0x18;
pub const USER_CS: u16 = 0x23;
pub const USER_DS: u16 = 0x2B;
pub const KERNEL_TSS: u16 = 0x30;

/// Null, unused, kernel code/data, user code/data, TSS.
pub const GDT_ENTRIES: usize = 7;
