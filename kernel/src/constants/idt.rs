//! Interrupt vector layout.

/// CPU exceptions occupy vectors 0..32.
pub const EXCEPTION_VECTORS: usize = 32;

/// IRQ 0..8 and 8..16 are remapped right above the exceptions.
pub const PIC_1_OFFSET: u8 = 0x20;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub const TIMER_IRQ: u8 = 0;
pub const TIMER_VECTOR: u8 = PIC_1_OFFSET + TIMER_IRQ;

pub const IDT_ENTRIES: usize = 256;

/// Input clock of the interval timer.
pub const PIT_FREQUENCY: u32 = 1_193_182;
/// Scheduler tick rate.
pub const TIMER_HZ: u32 = 100;
