//! Byte-wide x86 port I/O.

/// Typed wrapper for a byte-sized I/O port.
#[derive(Debug, Clone, Copy)]
pub struct Port {
    port: u16,
}

impl Port {
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// # Safety
    /// Port I/O can affect arbitrary hardware state.
    #[inline]
    pub unsafe fn read(&self) -> u8 {
        let value: u8;
        #[cfg(target_arch = "x86")]
        core::arch::asm!(
            "in al, dx",
            out("al") value,
            in("dx") self.port,
            options(nomem, nostack, preserves_flags)
        );
        #[cfg(not(target_arch = "x86"))]
        {
            value = 0;
        }
        value
    }

    /// # Safety
    /// Port I/O can affect arbitrary hardware state.
    #[inline]
    pub unsafe fn write(&self, value: u8) {
        #[cfg(target_arch = "x86")]
        core::arch::asm!(
            "out dx, al",
            in("dx") self.port,
            in("al") value,
            options(nomem, nostack, preserves_flags)
        );
        #[cfg(not(target_arch = "x86"))]
        let _ = value;
    }
}

/// Writes to an unused port to give slow devices time to settle.
#[inline]
pub fn io_wait() {
    unsafe { Port::new(0x80).write(0) };
}
