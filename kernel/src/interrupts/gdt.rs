//! Global Descriptor Table and the 32-bit task-state segment.
//!
//! The TSS is only used for one thing: when an interrupt arrives in user
//! mode the CPU loads `ss0:esp0` from it. The scheduler points `esp0` at the
//! top of the incoming task's control block on every switch.

use core::mem::size_of;

use lazy_static::lazy_static;
use spin::mutex::SpinMutex as Mutex;

use crate::constants::gdt::{GDT_ENTRIES, KERNEL_DS};
#[cfg(target_arch = "x86")]
use crate::constants::gdt::{KERNEL_CS, KERNEL_TSS};

/// Hardware layout of a 32-bit task-state segment (Intel SDM vol. 3, 7.2.1).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TaskStateSegment {
    pub link: u16,
    _reserved0: u16,
    pub esp0: u32,
    pub ss0: u16,
    _reserved1: u16,
    pub esp1: u32,
    pub ss1: u16,
    _reserved2: u16,
    pub esp2: u32,
    pub ss2: u16,
    _reserved3: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    _reserved4: u16,
    pub cs: u16,
    _reserved5: u16,
    pub ss: u16,
    _reserved6: u16,
    pub ds: u16,
    _reserved7: u16,
    pub fs: u16,
    _reserved8: u16,
    pub gs: u16,
    _reserved9: u16,
    pub ldt_segment_selector: u16,
    _reserved10: u16,
    pub trap: u16,
    pub io_map_base: u16,
}

impl TaskStateSegment {
    pub const fn new() -> Self {
        TaskStateSegment {
            link: 0,
            _reserved0: 0,
            esp0: 0,
            ss0: KERNEL_DS,
            _reserved1: 0,
            esp1: 0,
            ss1: 0,
            _reserved2: 0,
            esp2: 0,
            ss2: 0,
            _reserved3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _reserved4: 0,
            cs: 0,
            _reserved5: 0,
            ss: 0,
            _reserved6: 0,
            ds: 0,
            _reserved7: 0,
            fs: 0,
            _reserved8: 0,
            gs: 0,
            _reserved9: 0,
            ldt_segment_selector: 0,
            _reserved10: 0,
            trap: 0,
            // No I/O permission bitmap: point past the end of the segment.
            io_map_base: size_of::<TaskStateSegment>() as u16,
        }
    }
}

/// The single TSS of the system. The CPU reads it in place, so it must never move.
pub static TSS: Mutex<TaskStateSegment> = Mutex::new(TaskStateSegment::new());

// Access bytes: present, ring, code/data or system type.
const ACCESS_KERNEL_CODE: u8 = 0x9A;
const ACCESS_KERNEL_DATA: u8 = 0x92;
const ACCESS_USER_CODE: u8 = 0xFA;
const ACCESS_USER_DATA: u8 = 0xF2;
/// Present, DPL 0, type 0x9 (available 32-bit TSS).
const ACCESS_TSS: u8 = 0x89;

/// 4 KiB granularity, 32-bit operand size.
const FLAGS_FLAT: u8 = 0xC;

/// Encodes an 8-byte segment descriptor.
pub const fn segment_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let mut descriptor = (limit & 0xFFFF) as u64;
    descriptor |= ((base & 0xFF_FFFF) as u64) << 16;
    descriptor |= (access as u64) << 40;
    descriptor |= (((limit >> 16) & 0xF) as u64) << 48;
    descriptor |= ((flags & 0xF) as u64) << 52;
    descriptor |= (((base >> 24) & 0xFF) as u64) << 56;
    descriptor
}

/// Descriptor for an available TSS at `base`, byte granular.
pub const fn tss_descriptor(base: u32) -> u64 {
    segment_descriptor(
        base,
        (size_of::<TaskStateSegment>() - 1) as u32,
        ACCESS_TSS,
        0,
    )
}

/// Builds the flat-model table around the TSS located at `tss_base`.
pub const fn build_gdt(tss_base: u32) -> [u64; GDT_ENTRIES] {
    [
        0,
        0,
        segment_descriptor(0, 0xF_FFFF, ACCESS_KERNEL_CODE, FLAGS_FLAT),
        segment_descriptor(0, 0xF_FFFF, ACCESS_KERNEL_DATA, FLAGS_FLAT),
        segment_descriptor(0, 0xF_FFFF, ACCESS_USER_CODE, FLAGS_FLAT),
        segment_descriptor(0, 0xF_FFFF, ACCESS_USER_DATA, FLAGS_FLAT),
        tss_descriptor(tss_base),
    ]
}

lazy_static! {
    static ref GDT: [u64; GDT_ENTRIES] = build_gdt(TSS.as_mut_ptr() as usize as u32);
}

/// Points the privilege-transition stack at `esp0`.
pub fn set_kernel_stack(esp0: u32) {
    let mut tss = TSS.lock();
    tss.ss0 = KERNEL_DS;
    tss.esp0 = esp0;
}

/// Current privilege-transition stack pointer.
pub fn kernel_stack() -> u32 {
    TSS.lock().esp0
}

#[cfg(target_arch = "x86")]
#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Loads the GDT, reloads every segment register and the task register.
#[cfg(target_arch = "x86")]
pub fn init() {
    use core::arch::asm;

    let pointer = DescriptorTablePointer {
        limit: (size_of::<[u64; GDT_ENTRIES]>() - 1) as u16,
        base: GDT.as_ptr() as u32,
    };

    unsafe {
        asm!("lgdt [{}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
        asm!(
            "push {sel}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            sel = in(reg) KERNEL_CS as u32,
            tmp = lateout(reg) _,
            options(preserves_flags),
        );
        asm!(
            "mov ds, {0:x}",
            "mov es, {0:x}",
            "mov fs, {0:x}",
            "mov gs, {0:x}",
            "mov ss, {0:x}",
            in(reg) KERNEL_DS as u32,
            options(nostack, preserves_flags),
        );
        asm!("ltr {0:x}", in(reg) KERNEL_TSS as u32, options(nostack, preserves_flags));
    }
    log::debug!("GDT loaded, TSS selector {:#x}", KERNEL_TSS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn test_tss_layout_matches_hardware() {
        assert_eq!(size_of::<TaskStateSegment>(), 104);
        assert_eq!(offset_of!(TaskStateSegment, esp0), 4);
        assert_eq!(offset_of!(TaskStateSegment, ss0), 8);
        assert_eq!(offset_of!(TaskStateSegment, cr3), 28);
        assert_eq!(offset_of!(TaskStateSegment, es), 72);
        assert_eq!(offset_of!(TaskStateSegment, ldt_segment_selector), 96);
        assert_eq!(offset_of!(TaskStateSegment, io_map_base), 102);
    }

    #[test]
    fn test_flat_segments_encode_like_the_manual() {
        let gdt = build_gdt(0);
        assert_eq!(gdt[0], 0);
        assert_eq!(gdt[2], 0x00CF_9A00_0000_FFFF);
        assert_eq!(gdt[3], 0x00CF_9200_0000_FFFF);
        assert_eq!(gdt[4], 0x00CF_FA00_0000_FFFF);
        assert_eq!(gdt[5], 0x00CF_F200_0000_FFFF);
    }

    #[test]
    fn test_tss_descriptor_splits_base_and_limit() {
        let descriptor = tss_descriptor(0x1234_5678);
        assert_eq!(descriptor & 0xFFFF, 103);
        assert_eq!((descriptor >> 16) & 0xFF_FFFF, 0x34_5678);
        assert_eq!((descriptor >> 40) & 0xFF, 0x89);
        assert_eq!((descriptor >> 52) & 0xF, 0);
        assert_eq!(descriptor >> 56, 0x12);
    }

    #[test]
    fn test_new_tss_has_kernel_stack_segment() {
        let tss = TaskStateSegment::new();
        assert_eq!(tss.ss0, KERNEL_DS);
        assert_eq!(tss.io_map_base, 104);
    }
}
