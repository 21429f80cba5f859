//! Interrupt masking, the only synchronization discipline of the kernel.
//!
//! There is a single CPU, so "interrupts masked" is the critical section.
//! Every mutation of the frame bitmap, the free lists, the page tables or the
//! run queues happens inside an [`InterruptGuard`].

pub mod gdt;
pub mod idt;
pub mod pic;
pub mod timer;

#[cfg(target_arch = "x86")]
use crate::constants::processes::EFLAGS_IF;
use crate::constants::idt::TIMER_HZ;

/// Installs the IDT, remaps the PICs with only the timer line open and
/// starts the timer. Interrupts stay masked until the first task runs.
pub fn init() {
    #[cfg(target_arch = "x86")]
    idt::init_idt();
    unsafe { pic::PICS.lock().initialize([0xFE, 0xFF]) };
    timer::init(TIMER_HZ);
}

/// Enables interrupts on the current CPU.
#[inline]
pub fn enable() {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Disables interrupts on the current CPU.
#[inline]
pub fn disable() {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Checks if interrupts are enabled on the current CPU.
///
/// Hosted builds have no interrupt flag and always report `false`.
#[inline]
pub fn are_enabled() -> bool {
    #[cfg(target_arch = "x86")]
    {
        let eflags: u32;
        unsafe {
            core::arch::asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
        }
        eflags & EFLAGS_IF != 0
    }

    #[cfg(not(target_arch = "x86"))]
    {
        false
    }
}

/// Masks interrupts for its lifetime and restores the previous state on drop,
/// on every exit path including early returns.
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct InterruptGuard {
    were_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let were_enabled = are_enabled();
        disable();
        InterruptGuard { were_enabled }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable();
        }
    }
}

/// Executes a closure with interrupts disabled.
///
/// # Arguments
/// * `f` - The closure to execute
///
/// # Returns
/// Returns the result of the closure
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = InterruptGuard::new();
    f()
}
