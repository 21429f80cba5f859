//! Task and scheduler limits.

use super::memory::FRAME_SIZE;

pub const MAX_TASKS: usize = 64;

/// A task control block is one order-1 block: two frames, self-aligned.
pub const TASK_BLOCK_ORDER: usize = 1;
pub const TASK_BLOCK_SIZE: usize = FRAME_SIZE << TASK_BLOCK_ORDER;

pub const TASK_NAME_LEN: usize = 16;

/// Written at the base of every control block, "KAOS".
pub const TASK_BLOCK_MAGIC: u32 = 0x4B41_4F53;

pub const EFLAGS_RESERVED: u32 = 1 << 1;
pub const EFLAGS_IF: u32 = 1 << 9;
pub const DEFAULT_EFLAGS: u32 = EFLAGS_IF | EFLAGS_RESERVED;
