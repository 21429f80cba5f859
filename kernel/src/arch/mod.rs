//! Small CPU helpers shared by the rest of the kernel.

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod cpu;
pub mod port;

/// Halts until the next interrupt.
#[inline]
pub fn halt() {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }

    #[cfg(not(target_arch = "x86"))]
    core::hint::spin_loop();
}
