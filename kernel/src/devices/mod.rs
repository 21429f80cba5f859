//! Devices the kernel core talks to directly.
//!
//! Only the debug serial port lives here. Keyboard, mouse and VGA drivers
//! sit outside the kernel core.

pub mod serial;
