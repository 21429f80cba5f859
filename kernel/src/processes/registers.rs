use core::fmt;

use crate::constants::gdt::{KERNEL_CS, KERNEL_DS, USER_CS, USER_DS};
use crate::constants::processes::DEFAULT_EFLAGS;

/// Saved register state of a task: general registers, segment selectors,
/// the instruction pointer and flags, and both stack pointers.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// User level stack.
    pub esp: u32,
    pub ss: u32,
    /// Kernel level stack.
    pub esp0: u32,
}

impl Registers {
    pub const fn new() -> Self {
        Registers {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            gs: 0,
            fs: 0,
            es: 0,
            ds: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            esp: 0,
            ss: 0,
            esp0: 0,
        }
    }

    /// Ring 3 selectors, interrupts enabled.
    pub fn user(eip: u32, user_stack: u32, kernel_stack: u32) -> Self {
        Self::with_segments(USER_CS, USER_DS, eip, user_stack, kernel_stack)
    }

    /// Ring 0 selectors, interrupts enabled. Runs on its own kernel stack.
    pub fn kernel(eip: u32, kernel_stack: u32) -> Self {
        Self::with_segments(KERNEL_CS, KERNEL_DS, eip, kernel_stack, kernel_stack)
    }

    fn with_segments(code: u16, data: u16, eip: u32, esp: u32, esp0: u32) -> Self {
        let data = data as u32;
        Registers {
            gs: data,
            fs: data,
            es: data,
            ds: data,
            ss: data,
            cs: code as u32,
            eip,
            eflags: DEFAULT_EFLAGS,
            esp,
            esp0,
            ..Self::new()
        }
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ds = f.debug_struct("Registers");

        ds.field("eax", &format_args!("{:#010x}", self.eax))
            .field("ebx", &format_args!("{:#010x}", self.ebx))
            .field("ecx", &format_args!("{:#010x}", self.ecx))
            .field("edx", &format_args!("{:#010x}", self.edx))
            .field("esi", &format_args!("{:#010x}", self.esi))
            .field("edi", &format_args!("{:#010x}", self.edi))
            .field("ebp", &format_args!("{:#010x}", self.ebp))
            .field("gs", &format_args!("{:#x}", self.gs))
            .field("fs", &format_args!("{:#x}", self.fs))
            .field("es", &format_args!("{:#x}", self.es))
            .field("ds", &format_args!("{:#x}", self.ds))
            .field("eip", &format_args!("{:#010x}", self.eip))
            .field("cs", &format_args!("{:#x}", self.cs))
            .field("eflags", &format_args!("{:#010x}", self.eflags))
            .field("esp", &format_args!("{:#010x}", self.esp))
            .field("ss", &format_args!("{:#x}", self.ss))
            .field("esp0", &format_args!("{:#010x}", self.esp0));

        ds.finish()
    }
}
