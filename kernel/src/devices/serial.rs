//! COM1 console behind the kernel log and the `serial_print!` macros.
//!
//! Every write happens with interrupts masked, so a task switched out by the
//! timer never holds the console lock.

use core::fmt;

use crate::constants::ports::SERIAL_PORT;
use crate::interrupts::without_interrupts;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

/// Where console bytes end up.
pub trait ByteSink {
    fn put(&mut self, byte: u8);
}

impl ByteSink for SerialPort {
    fn put(&mut self, byte: u8) {
        self.send(byte);
    }
}

/// Text writer turning `\n` into the `\r\n` a serial terminal expects.
pub struct Console<S> {
    sink: S,
}

impl<S: ByteSink> Console<S> {
    pub const fn new(sink: S) -> Self {
        Console { sink }
    }
}

impl<S: ByteSink> fmt::Write for Console<S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.sink.put(b'\r');
            }
            self.sink.put(byte);
        }
        Ok(())
    }
}

lazy_static! {
    /// COM1, programmed on first use.
    pub static ref COM1: Mutex<Console<SerialPort>> = {
        let mut port = unsafe { SerialPort::new(SERIAL_PORT) };
        port.init();
        Mutex::new(Console::new(port))
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    without_interrupts(|| {
        // The console itself never fails; errors can only come from a
        // formatting impl and are dropped.
        let _ = COM1.lock().write_fmt(args);
    });
}

/// Prints formatted text to COM1.
///
/// ```ignore
/// serial_print!("tick {}", n);
/// ```
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to COM1, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    impl ByteSink for Vec<u8> {
        fn put(&mut self, byte: u8) {
            self.push(byte);
        }
    }

    #[test]
    fn test_console_expands_newlines() {
        let mut console = Console::new(Vec::new());
        write!(console, "[INFO] kaos: {}\nnext\n", 42).unwrap();
        assert_eq!(console.sink, b"[INFO] kaos: 42\r\nnext\r\n");
    }

    #[test]
    fn test_console_leaves_other_bytes_alone() {
        let mut console = Console::new(Vec::new());
        console.write_str("a\rb\tc").unwrap();
        assert_eq!(console.sink, b"a\rb\tc");
    }
}
