//! 32-bit Interrupt Descriptor Table.
//!
//! Exceptions go through per-vector stubs into [`kaos_fault`], which panics.
//! IRQ 0 drives the scheduler; the remaining PIC lines are masked and any
//! spurious delivery is dropped.

use core::fmt;
use core::mem::size_of;

use crate::constants::gdt::KERNEL_CS;
use crate::constants::idt::{EXCEPTION_VECTORS, IDT_ENTRIES};
#[cfg(target_arch = "x86")]
use crate::constants::idt::TIMER_VECTOR;

/// Present, DPL 0, 32-bit interrupt gate. Interrupts are masked on entry.
const INTERRUPT_GATE: u8 = 0x8E;

/// Encodes an 8-byte interrupt gate.
pub const fn gate_descriptor(handler: u32, selector: u16, type_attr: u8) -> u64 {
    let mut descriptor = (handler & 0xFFFF) as u64;
    descriptor |= (selector as u64) << 16;
    descriptor |= (type_attr as u64) << 40;
    descriptor |= ((handler >> 16) as u64) << 48;
    descriptor
}

pub fn interrupt_gate(handler: u32) -> u64 {
    gate_descriptor(handler, KERNEL_CS, INTERRUPT_GATE)
}

const EXCEPTION_NAMES: [&str; EXCEPTION_VECTORS] = [
    "Divide Error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point",
    "Virtualization",
    "Control Protection",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection",
    "VMM Communication",
    "Security",
    "Reserved",
];

/// Vectors that push an error code before the return address.
const fn has_error_code(vector: u32) -> bool {
    matches!(vector, 8 | 10..=14 | 17 | 21 | 29 | 30)
}

/// What the CPU left on the stack when an exception hit.
pub struct FaultFrame {
    pub vector: u32,
    pub error_code: Option<u32>,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

impl FaultFrame {
    /// Decodes the words above the vector number pushed by the stub.
    pub fn decode(vector: u32, words: &[u32; 4]) -> Self {
        if has_error_code(vector) {
            FaultFrame {
                vector,
                error_code: Some(words[0]),
                eip: words[1],
                cs: words[2],
                eflags: words[3],
            }
        } else {
            FaultFrame {
                vector,
                error_code: None,
                eip: words[0],
                cs: words[1],
                eflags: words[2],
            }
        }
    }
}

impl fmt::Display for FaultFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = EXCEPTION_NAMES
            .get(self.vector as usize)
            .copied()
            .unwrap_or("Unknown");
        write!(
            f,
            "EXCEPTION: {} (vector {}) at {:#x}:{:#010x}, eflags {:#x}",
            name, self.vector, self.cs, self.eip, self.eflags
        )?;
        if let Some(code) = self.error_code {
            write!(f, ", error code {:#x}", code)?;
        }
        Ok(())
    }
}

/// Called by every exception stub with a pointer to `[vector, ...cpu frame]`.
#[no_mangle]
extern "C" fn kaos_fault(frame: *const u32) -> ! {
    let (vector, words) = unsafe { (*frame, *(frame.add(1) as *const [u32; 4])) };
    let fault = FaultFrame::decode(vector, &words);
    if fault.vector == 14 {
        let cr2: u32;
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86"))]
        {
            cr2 = 0;
        }
        panic!("{}, accessed address {:#010x}", fault, cr2);
    }
    panic!("{}", fault);
}

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    ".section .text",
    ".irp vector, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31",
    "kaos_fault_\\vector:",
    "    push \\vector",
    "    jmp kaos_fault_common",
    ".endr",
    "kaos_fault_common:",
    "    mov ax, {kernel_ds}",
    "    mov ds, ax",
    "    mov es, ax",
    "    push esp",
    "    call kaos_fault",
    ".global kaos_timer_entry",
    "kaos_timer_entry:",
    "    pushad",
    "    push ds",
    "    push es",
    "    push fs",
    "    push gs",
    "    mov ax, {kernel_ds}",
    "    mov ds, ax",
    "    mov es, ax",
    "    mov fs, ax",
    "    mov gs, ax",
    "    cld",
    "    call kaos_timer_interrupt",
    "    pop gs",
    "    pop fs",
    "    pop es",
    "    pop ds",
    "    popad",
    "    iretd",
    ".global kaos_spurious_entry",
    "kaos_spurious_entry:",
    "    iretd",
    ".section .rodata",
    ".balign 4",
    ".global kaos_fault_stubs",
    "kaos_fault_stubs:",
    ".irp vector, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31",
    "    .long kaos_fault_\\vector",
    ".endr",
    ".section .text",
    kernel_ds = const crate::constants::gdt::KERNEL_DS,
);

#[cfg(target_arch = "x86")]
extern "C" {
    static kaos_fault_stubs: [u32; EXCEPTION_VECTORS];
    fn kaos_timer_entry();
    fn kaos_spurious_entry();
}

#[cfg(target_arch = "x86")]
lazy_static::lazy_static! {
    static ref IDT: [u64; IDT_ENTRIES] = {
        let mut idt = [interrupt_gate(kaos_spurious_entry as usize as u32); IDT_ENTRIES];
        for (vector, stub) in unsafe { kaos_fault_stubs }.iter().enumerate() {
            idt[vector] = interrupt_gate(*stub);
        }
        idt[TIMER_VECTOR as usize] = interrupt_gate(kaos_timer_entry as usize as u32);
        idt
    };
}

#[cfg(target_arch = "x86")]
#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Loads the IDT.
#[cfg(target_arch = "x86")]
pub fn init_idt() {
    let pointer = DescriptorTablePointer {
        limit: (size_of::<[u64; IDT_ENTRIES]>() - 1) as u16,
        base: IDT.as_ptr() as u32,
    };
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
    }
    log::debug!("IDT loaded, timer on vector {:#x}", TIMER_VECTOR);
}

const _: () = assert!(size_of::<u64>() * IDT_ENTRIES == 2048);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_encoding() {
        let gate = interrupt_gate(0x0012_3456);
        assert_eq!(gate & 0xFFFF, 0x3456);
        assert_eq!((gate >> 16) & 0xFFFF, KERNEL_CS as u64);
        assert_eq!((gate >> 40) & 0xFF, 0x8E);
        assert_eq!(gate >> 48, 0x0012);
    }

    #[test]
    fn test_fault_frame_with_and_without_error_code() {
        let page_fault = FaultFrame::decode(14, &[0x2, 0x10_1234, 0x10, 0x202]);
        assert_eq!(page_fault.error_code, Some(2));
        assert_eq!(page_fault.eip, 0x10_1234);

        let invalid_opcode = FaultFrame::decode(6, &[0x10_5678, 0x23, 0x202, 0]);
        assert_eq!(invalid_opcode.error_code, None);
        assert_eq!(invalid_opcode.cs, 0x23);
        assert!(invalid_opcode.to_string().starts_with("EXCEPTION: Invalid Opcode"));
    }
}
