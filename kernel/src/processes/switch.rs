//! Kernel stack switching.
//!
//! A suspended task's kernel stack holds, from the top of its saved area
//! down: the return address into `schedule`, the `pushad` frame and the four
//! data segment selectors. Restoring it is `pop` in reverse followed by `ret`.
//!
//! A task that has never run has only two staged words on its stack, its
//! entry point and its user stack pointer. Its first resume jumps to a
//! trampoline that pops them and `iretd`s into the task.

use crate::processes::process::Privilege;

/// How to continue a task picked by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// First run: `kernel_sp` points at the staged entry words.
    Start { kernel_sp: u32, privilege: Privilege },
    /// Continue right after the task's own earlier save.
    Restore { kernel_sp: u32 },
}

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    ".section .text",
    ".global kaos_switch_stacks",
    ".global kaos_switch_to_new",
    ".global kaos_enter_first",
    ".global kaos_restore_tail",
    ".global kaos_enter_user",
    ".global kaos_enter_kernel",
    // (save: *mut u32, next_sp: u32)
    "kaos_switch_stacks:",
    "    mov eax, [esp + 4]",
    "    mov edx, [esp + 8]",
    "    pushad",
    "    push ds",
    "    push es",
    "    push fs",
    "    push gs",
    "    mov [eax], esp",
    "    mov esp, edx",
    "kaos_restore_tail:",
    "    pop gs",
    "    pop fs",
    "    pop es",
    "    pop ds",
    "    popad",
    "    ret",
    // (save: *mut u32, next_sp: u32, trampoline: u32)
    "kaos_switch_to_new:",
    "    mov eax, [esp + 4]",
    "    mov edx, [esp + 8]",
    "    mov ecx, [esp + 12]",
    "    pushad",
    "    push ds",
    "    push es",
    "    push fs",
    "    push gs",
    "    mov [eax], esp",
    "    mov esp, edx",
    "    jmp ecx",
    // (next_sp: u32, target: u32), nothing is saved
    "kaos_enter_first:",
    "    mov edx, [esp + 4]",
    "    mov ecx, [esp + 8]",
    "    mov esp, edx",
    "    jmp ecx",
    // Stack: [entry, user_stack], top of the control block above.
    "kaos_enter_user:",
    "    pop ecx",
    "    pop edx",
    "    mov ax, {user_ds}",
    "    mov ds, ax",
    "    mov es, ax",
    "    mov fs, ax",
    "    mov gs, ax",
    "    push {user_ds}",
    "    push edx",
    "    pushfd",
    "    pop eax",
    "    or eax, {eflags_if}",
    "    push eax",
    "    push {user_cs}",
    "    push ecx",
    "    iretd",
    // Stack: [entry, unused]
    "kaos_enter_kernel:",
    "    pop ecx",
    "    pop edx",
    "    mov ax, {kernel_ds}",
    "    mov ds, ax",
    "    mov es, ax",
    "    mov fs, ax",
    "    mov gs, ax",
    "    pushfd",
    "    pop eax",
    "    or eax, {eflags_if}",
    "    push eax",
    "    push {kernel_cs}",
    "    push ecx",
    "    iretd",
    user_cs = const crate::constants::gdt::USER_CS,
    user_ds = const crate::constants::gdt::USER_DS,
    kernel_cs = const crate::constants::gdt::KERNEL_CS,
    kernel_ds = const crate::constants::gdt::KERNEL_DS,
    eflags_if = const crate::constants::processes::EFLAGS_IF,
);

#[cfg(target_arch = "x86")]
extern "C" {
    fn kaos_switch_stacks(save: *mut u32, next_sp: u32);
    fn kaos_switch_to_new(save: *mut u32, next_sp: u32, trampoline: u32);
    fn kaos_enter_first(next_sp: u32, target: u32) -> !;
    fn kaos_restore_tail();
    fn kaos_enter_user();
    fn kaos_enter_kernel();
}

/// Address a never-run task first resumes at.
pub fn trampoline(privilege: Privilege) -> u32 {
    #[cfg(target_arch = "x86")]
    {
        match privilege {
            Privilege::User => kaos_enter_user as usize as u32,
            Privilege::Kernel => kaos_enter_kernel as usize as u32,
        }
    }
    #[cfg(not(target_arch = "x86"))]
    {
        let _ = privilege;
        0
    }
}

/// Saves the running context's kernel stack pointer into `save` and
/// continues `target`. Returns when the saved context is resumed.
///
/// # Safety
///
/// Interrupts must be masked, `save` must stay valid until the current
/// context is resumed, and `target` must describe a live task stack.
pub unsafe fn resume(save: *mut u32, target: Resume) {
    #[cfg(target_arch = "x86")]
    match target {
        Resume::Start {
            kernel_sp,
            privilege,
        } => kaos_switch_to_new(save, kernel_sp, trampoline(privilege)),
        Resume::Restore { kernel_sp } => kaos_switch_stacks(save, kernel_sp),
    }
    #[cfg(not(target_arch = "x86"))]
    {
        let _ = (save, target);
        unimplemented!("context switching requires an i386 target");
    }
}

/// Continues `target` abandoning the current context.
///
/// # Safety
///
/// Same as [`resume`]; nothing on the current stack is ever used again.
pub unsafe fn enter(target: Resume) -> ! {
    #[cfg(target_arch = "x86")]
    match target {
        Resume::Start {
            kernel_sp,
            privilege,
        } => kaos_enter_first(kernel_sp, trampoline(privilege)),
        Resume::Restore { kernel_sp } => {
            kaos_enter_first(kernel_sp, kaos_restore_tail as usize as u32)
        }
    }
    #[cfg(not(target_arch = "x86"))]
    {
        let _ = target;
        unimplemented!("context switching requires an i386 target");
    }
}
