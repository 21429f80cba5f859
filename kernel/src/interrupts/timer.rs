//! Programmable interval timer, the source of scheduler ticks.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::port::Port;
use crate::constants::idt::{PIT_FREQUENCY, TIMER_VECTOR};
use crate::constants::ports::{PIT_CHANNEL0, PIT_COMMAND};
use crate::interrupts::pic::PICS;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator), binary.
const PIT_RATE_GENERATOR: u8 = 0x34;

pub const fn divisor(hz: u32) -> u16 {
    let hz = if hz == 0 { 1 } else { hz };
    let divisor = PIT_FREQUENCY / hz;
    if divisor > 0xFFFF {
        0xFFFF
    } else {
        divisor as u16
    }
}

/// Programs channel 0 to fire `hz` times per second.
pub fn init(hz: u32) {
    let divisor = divisor(hz);
    unsafe {
        Port::new(PIT_COMMAND).write(PIT_RATE_GENERATOR);
        Port::new(PIT_CHANNEL0).write((divisor & 0xFF) as u8);
        Port::new(PIT_CHANNEL0).write((divisor >> 8) as u8);
    }
    log::info!("Timer running at {} Hz", hz);
}

pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Entered from the IRQ 0 stub with interrupts masked.
#[no_mangle]
extern "C" fn kaos_timer_interrupt() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    unsafe { PICS.lock().notify_end_of_interrupt(TIMER_VECTOR) };
    crate::processes::timer_tick();
}
