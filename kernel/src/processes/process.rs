use core::fmt;
use core::mem::size_of;

use crate::constants::memory::FRAME_SIZE;
use crate::constants::processes::{TASK_BLOCK_MAGIC, TASK_BLOCK_SIZE, TASK_NAME_LEN};
use crate::memory::{PhysAddr, PhysFrame, PhysOffset};
use crate::processes::registers::Registers;
use crate::processes::switch::{self, Resume};

/// Task identifier. Doubles as the pid and as the slot in the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u32);

impl TaskId {
    pub const fn new(pid: u32) -> Self {
        TaskId(pid)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskState {
    Running = 0,
    Runnable = 1,
    Interruptible = 2,
    Uninterruptible = 3,
    Zombie = 4,
    Stopped = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Kernel,
}

/// Where a task continues when it is next picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// Never ran; the first resume goes through the entry trampoline.
    NeverRun {
        entry: u32,
        user_stack: u32,
        privilege: Privilege,
    },
    /// Switched out; `kernel_sp` is written by the switch itself.
    Suspended { kernel_sp: u32 },
    /// On the CPU.
    Active,
}

/// Queue membership, see [`super::scheduler::RunQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Runnable,
    Running,
    Waiting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct QueueLink {
    pub(crate) prev: Option<TaskId>,
    pub(crate) next: Option<TaskId>,
    pub(crate) queue: Option<QueueKind>,
}

/// Stamped at the base of every control block so an address on a kernel
/// stack can be traced back to its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlockHeader {
    pub magic: u32,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    OutOfFrames,
    TaskTableFull,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpawnError::OutOfFrames => write!(f, "No frames left for a task control block"),
            SpawnError::TaskTableFull => write!(f, "Task table is full"),
        }
    }
}

/// What to run in a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEntry {
    /// Ring 3 code entered at `entry` with `user_stack` as its stack.
    User { entry: u32, user_stack: u32 },
    /// Ring 0 code running on the control block's own stack.
    Kernel { entry: u32 },
}

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    /// Back-reference only, a parent never owns its children.
    pub parent: Option<TaskId>,
    name: [u8; TASK_NAME_LEN],
    pub cpu_state: Registers,
    block: PhysFrame,
    pub(crate) resume: ResumePoint,
    pub(crate) link: QueueLink,
}

impl Task {
    /// Lays out a fresh control block in `block` and describes the task.
    ///
    /// The block is zeroed, its header stamped, and the entry point and
    /// user stack pointer staged in its two topmost words.
    ///
    /// # Safety
    ///
    /// `block` must be an exclusively owned, self-aligned two-frame block
    /// visible through `offset`.
    pub unsafe fn new(
        id: TaskId,
        block: PhysFrame,
        offset: PhysOffset,
        entry: TaskEntry,
        name: &str,
    ) -> Self {
        let base = block.start_address();
        debug_assert!(base.is_aligned(TASK_BLOCK_SIZE as u32));
        core::ptr::write_bytes(offset.as_mut_ptr::<u8>(base), 0, TASK_BLOCK_SIZE);
        offset.as_mut_ptr::<BlockHeader>(base).write(BlockHeader {
            magic: TASK_BLOCK_MAGIC,
            pid: id.as_u32(),
        });

        let top = base.as_u32() + TASK_BLOCK_SIZE as u32;
        let (entry, user_stack, privilege) = match entry {
            TaskEntry::User { entry, user_stack } => (entry, user_stack, Privilege::User),
            TaskEntry::Kernel { entry } => (entry, 0, Privilege::Kernel),
        };
        offset
            .as_mut_ptr::<u32>(PhysAddr::new(top - 8))
            .write(entry);
        offset
            .as_mut_ptr::<u32>(PhysAddr::new(top - 4))
            .write(user_stack);

        let trampoline = switch::trampoline(privilege);
        let cpu_state = match privilege {
            Privilege::User => Registers::user(trampoline, user_stack, top),
            Privilege::Kernel => Registers::kernel(trampoline, top),
        };

        Task {
            id,
            state: TaskState::Runnable,
            parent: None,
            name: encode_name(name),
            cpu_state,
            block,
            resume: ResumePoint::NeverRun {
                entry,
                user_stack,
                privilege,
            },
            link: QueueLink::default(),
        }
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    pub fn block(&self) -> PhysFrame {
        self.block
    }

    /// Top of the task's kernel stack, one past the end of its block.
    pub fn kernel_stack_top(&self) -> u32 {
        self.block.start_address().as_u32() + TASK_BLOCK_SIZE as u32
    }

    /// Whether `addr` falls inside this task's control block.
    pub fn owns(&self, addr: u32) -> bool {
        let base = self.block.start_address().as_u32();
        (base..self.kernel_stack_top()).contains(&addr)
    }

    pub fn resume_point(&self) -> ResumePoint {
        self.resume
    }

    /// Turns the stored resume point into a switch target, marking the
    /// task active.
    pub(crate) fn take_resume(&mut self) -> Resume {
        let resume = match self.resume {
            ResumePoint::NeverRun { privilege, .. } => Resume::Start {
                kernel_sp: self.kernel_stack_top() - 8,
                privilege,
            },
            ResumePoint::Suspended { kernel_sp } => Resume::Restore { kernel_sp },
            ResumePoint::Active => panic!("task {} resumed while already active", self.id),
        };
        self.resume = ResumePoint::Active;
        resume
    }

    /// Marks the task suspended and returns the slot the switch saves its
    /// kernel stack pointer into.
    pub(crate) fn suspend_slot(&mut self) -> *mut u32 {
        self.resume = ResumePoint::Suspended { kernel_sp: 0 };
        match &mut self.resume {
            ResumePoint::Suspended { kernel_sp } => kernel_sp,
            _ => unreachable!(),
        }
    }
}

/// Copies up to `TASK_NAME_LEN - 1` bytes, leaving the name NUL terminated.
fn encode_name(name: &str) -> [u8; TASK_NAME_LEN] {
    let mut buf = [0u8; TASK_NAME_LEN];
    let mut len = name.len().min(TASK_NAME_LEN - 1);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
    buf
}

/// Reads the header of the control block containing `addr`.
///
/// # Safety
///
/// The block-aligned base below `addr` must be readable through `offset`.
pub unsafe fn block_header(addr: u32, offset: PhysOffset) -> BlockHeader {
    let base = addr & !(TASK_BLOCK_SIZE as u32 - 1);
    offset.as_mut_ptr::<BlockHeader>(PhysAddr::new(base)).read()
}

const _: () = assert!(size_of::<BlockHeader>() < FRAME_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::MemoryRegion;
    use crate::constants::gdt::{KERNEL_CS, KERNEL_DS, USER_CS, USER_DS};
    use crate::constants::processes::TASK_BLOCK_ORDER;
    use crate::memory::test_support::{allocator, compact_layout, SimulatedRam};

    const MIB: u32 = 1 << 20;

    #[test]
    fn test_user_task_block_layout() {
        let mut ram = SimulatedRam::new(0, 8 * MIB as usize);
        let mut frames = allocator(&[MemoryRegion::usable(0, 8 << 20)], compact_layout(0, 2 * MIB));
        let block = frames.alloc(TASK_BLOCK_ORDER).unwrap();
        let base = block.start_address().as_u32();
        assert_eq!(base % TASK_BLOCK_SIZE as u32, 0);

        // Dirty the block so zeroing is observable.
        unsafe {
            ram.offset()
                .as_mut_ptr::<u32>(PhysAddr::new(base + 0x100))
                .write(0xFFFF_FFFF);
        }

        let task = unsafe {
            Task::new(
                TaskId::new(3),
                block,
                ram.offset(),
                TaskEntry::User {
                    entry: 0x40_1000,
                    user_stack: 0x40_8000,
                },
                "user0",
            )
        };
        let top = base + TASK_BLOCK_SIZE as u32;

        assert_eq!(task.state, TaskState::Runnable);
        assert_eq!(task.parent, None);
        assert_eq!(task.name(), "user0");
        assert_eq!(task.kernel_stack_top(), top);
        assert_eq!(task.cpu_state.cs, USER_CS as u32);
        assert_eq!(task.cpu_state.ds, USER_DS as u32);
        assert_eq!(task.cpu_state.es, USER_DS as u32);
        assert_eq!(task.cpu_state.esp, 0x40_8000);
        assert_eq!(task.cpu_state.esp0, top);
        assert_eq!(task.cpu_state.eip, switch::trampoline(Privilege::User));

        assert_eq!(ram.read_u32(base), TASK_BLOCK_MAGIC);
        assert_eq!(ram.read_u32(base + 4), 3);
        assert_eq!(ram.read_u32(base + 0x100), 0);
        assert_eq!(ram.read_u32(top - 8), 0x40_1000);
        assert_eq!(ram.read_u32(top - 4), 0x40_8000);

        assert!(task.owns(base + 0x1FFF));
        assert!(!task.owns(top));
    }

    #[test]
    fn test_kernel_task_runs_on_its_block() {
        let mut ram = SimulatedRam::new(0, 8 * MIB as usize);
        let mut frames = allocator(&[MemoryRegion::usable(0, 8 << 20)], compact_layout(0, 2 * MIB));
        let block = frames.alloc(TASK_BLOCK_ORDER).unwrap();
        let task = unsafe {
            Task::new(
                TaskId::new(0),
                block,
                ram.offset(),
                TaskEntry::Kernel { entry: 0x10_2000 },
                "a-very-long-kernel-thread-name",
            )
        };
        let top = task.kernel_stack_top();
        assert_eq!(task.cpu_state.cs, KERNEL_CS as u32);
        assert_eq!(task.cpu_state.ss, KERNEL_DS as u32);
        assert_eq!(task.cpu_state.esp, top);
        assert_eq!(task.name(), "a-very-long-ker");
        assert_eq!(
            task.resume_point(),
            ResumePoint::NeverRun {
                entry: 0x10_2000,
                user_stack: 0,
                privilege: Privilege::Kernel
            }
        );
        assert_eq!(ram.read_u32(top - 8), 0x10_2000);
    }

    #[test]
    fn test_resume_transitions() {
        let mut ram = SimulatedRam::new(0, 8 * MIB as usize);
        let mut frames = allocator(&[MemoryRegion::usable(0, 8 << 20)], compact_layout(0, 2 * MIB));
        let block = frames.alloc(TASK_BLOCK_ORDER).unwrap();
        let mut task = unsafe {
            Task::new(
                TaskId::new(1),
                block,
                ram.offset(),
                TaskEntry::User {
                    entry: 1,
                    user_stack: 2,
                },
                "t",
            )
        };
        let top = task.kernel_stack_top();
        assert_eq!(
            task.take_resume(),
            Resume::Start {
                kernel_sp: top - 8,
                privilege: Privilege::User
            }
        );
        assert_eq!(task.resume_point(), ResumePoint::Active);

        let slot = task.suspend_slot();
        unsafe { slot.write(top - 0x40) };
        assert_eq!(
            task.resume_point(),
            ResumePoint::Suspended {
                kernel_sp: top - 0x40
            }
        );
        assert_eq!(
            task.take_resume(),
            Resume::Restore {
                kernel_sp: top - 0x40
            }
        );
    }

    #[test]
    fn test_block_header_from_any_stack_address() {
        let mut ram = SimulatedRam::new(0, 8 * MIB as usize);
        let mut frames = allocator(&[MemoryRegion::usable(0, 8 << 20)], compact_layout(0, 2 * MIB));
        let block = frames.alloc(TASK_BLOCK_ORDER).unwrap();
        let task = unsafe {
            Task::new(
                TaskId::new(7),
                block,
                ram.offset(),
                TaskEntry::Kernel { entry: 0 },
                "k",
            )
        };
        let header = unsafe { block_header(task.kernel_stack_top() - 0x123, ram.offset()) };
        assert_eq!(
            header,
            BlockHeader {
                magic: TASK_BLOCK_MAGIC,
                pid: 7
            }
        );
    }
}
