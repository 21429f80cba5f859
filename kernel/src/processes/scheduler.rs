//! Round-robin scheduling over three run queues.
//!
//! Every task sits in exactly one of `runnable`, `running` or `waiting`.
//! The queues are doubly linked through [`QueueLink`]s stored in the task
//! table, so moving a task between them never allocates.

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::constants::processes::{MAX_TASKS, TASK_BLOCK_MAGIC, TASK_BLOCK_ORDER};
use crate::interrupts::{gdt, InterruptGuard};
use crate::memory::buddy::BuddyAllocator;
use crate::memory::frame_allocator::with_frame_allocator;
use crate::memory::{PhysFrame, PhysOffset};
use crate::processes::process::{
    block_header, QueueKind, QueueLink, SpawnError, Task, TaskEntry, TaskId, TaskState,
};
use crate::processes::switch::{self, Resume};

/// FIFO of tasks linked through the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunQueue {
    kind: QueueKind,
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: usize,
}

impl RunQueue {
    pub const fn new(kind: QueueKind) -> Self {
        RunQueue {
            kind,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn front(&self) -> Option<TaskId> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push_back(&mut self, tasks: &mut [Task], id: TaskId) {
        let link = &mut tasks[id.index()].link;
        assert!(
            link.queue.is_none(),
            "task {} queued on {:?} while on {:?}",
            id,
            self.kind,
            link.queue
        );
        *link = QueueLink {
            prev: self.tail,
            next: None,
            queue: Some(self.kind),
        };
        match self.tail {
            Some(tail) => tasks[tail.index()].link.next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    fn remove(&mut self, tasks: &mut [Task], id: TaskId) {
        let link = tasks[id.index()].link;
        assert!(
            link.queue == Some(self.kind),
            "task {} is not on the {:?} queue",
            id,
            self.kind
        );
        match link.prev {
            Some(prev) => tasks[prev.index()].link.next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => tasks[next.index()].link.prev = link.prev,
            None => self.tail = link.prev,
        }
        tasks[id.index()].link = QueueLink::default();
        self.len -= 1;
    }

    /// Walks the queue front to back.
    pub fn iter<'a>(&self, tasks: &'a [Task]) -> impl Iterator<Item = TaskId> + 'a {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let id = cursor?;
            cursor = tasks[id.index()].link.next;
            Some(id)
        })
    }
}

/// A context switch decided by [`Scheduler::pick_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub prev: TaskId,
    pub next: TaskId,
}

/// Everything the low-level switch needs once the scheduler lock is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchFrame {
    pub save: *mut u32,
    pub resume: Resume,
    pub kernel_stack_top: u32,
}

pub struct Scheduler {
    tasks: ArrayVec<Task, MAX_TASKS>,
    runnable: RunQueue,
    running: RunQueue,
    waiting: RunQueue,
    current: Option<TaskId>,
    started: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            tasks: ArrayVec::new_const(),
            runnable: RunQueue::new(QueueKind::Runnable),
            running: RunQueue::new(QueueKind::Running),
            waiting: RunQueue::new(QueueKind::Waiting),
            current: None,
            started: false,
        }
    }

    fn queue(&mut self, kind: QueueKind) -> (&mut RunQueue, &mut [Task]) {
        let queue = match kind {
            QueueKind::Runnable => &mut self.runnable,
            QueueKind::Running => &mut self.running,
            QueueKind::Waiting => &mut self.waiting,
        };
        (queue, self.tasks.as_mut_slice())
    }

    /// Moves `id` to the tail of `to`, updating its state.
    fn move_to(&mut self, id: TaskId, to: QueueKind, state: TaskState) {
        if let Some(from) = self.tasks[id.index()].link.queue {
            let (queue, tasks) = self.queue(from);
            queue.remove(tasks, id);
        }
        let (queue, tasks) = self.queue(to);
        queue.push_back(tasks, id);
        self.tasks[id.index()].state = state;
    }

    /// Next pid to be handed out.
    pub fn next_pid(&self) -> TaskId {
        TaskId::new(self.tasks.len() as u32)
    }

    /// Registers a task whose control block is `block` at the runnable tail.
    ///
    /// # Safety
    ///
    /// `block` must be an exclusively owned order-1 block reachable through `offset`.
    pub unsafe fn spawn(
        &mut self,
        block: PhysFrame,
        offset: PhysOffset,
        entry: TaskEntry,
        name: &str,
    ) -> Result<TaskId, SpawnError> {
        if self.tasks.is_full() {
            return Err(SpawnError::TaskTableFull);
        }
        let id = self.next_pid();
        self.tasks.push(Task::new(id, block, offset, entry, name));
        self.move_to(id, QueueKind::Runnable, TaskState::Runnable);
        Ok(id)
    }

    /// Takes a control block from `frames` and registers a task in it. The
    /// block goes back to `frames` when the task cannot be registered.
    ///
    /// # Safety
    ///
    /// Every frame `frames` hands out must be reachable through `offset`.
    pub unsafe fn spawn_from(
        &mut self,
        frames: &mut BuddyAllocator,
        offset: PhysOffset,
        entry: TaskEntry,
        name: &str,
    ) -> Result<TaskId, SpawnError> {
        let block = frames
            .alloc(TASK_BLOCK_ORDER)
            .ok_or(SpawnError::OutOfFrames)?;
        self.spawn(block, offset, entry, name)
            .inspect_err(|_| frames.free(block, TASK_BLOCK_ORDER))
    }

    /// Picks the first runnable task and makes it current. Scheduling is
    /// off until this has happened once.
    pub fn start(&mut self) -> Option<TaskId> {
        let first = self.runnable.front()?;
        self.move_to(first, QueueKind::Running, TaskState::Running);
        self.current = Some(first);
        self.started = true;
        Some(first)
    }

    /// Round robin step: the runnable head replaces the current task, which
    /// goes to the runnable tail. With nothing runnable the current task is
    /// picked again.
    pub fn pick_next(&mut self) -> Option<Switch> {
        if !self.started {
            return None;
        }
        let prev = self.current?;
        let next = self.runnable.front().unwrap_or(prev);

        self.move_to(prev, QueueKind::Runnable, TaskState::Runnable);
        self.move_to(next, QueueKind::Running, TaskState::Running);
        self.current = Some(next);
        Some(Switch { prev, next })
    }

    /// Resolves a switch into the save slot of `prev` and the target of
    /// `next`. `None` when the same task keeps the CPU.
    pub fn prepare(&mut self, switch: Switch) -> Option<SwitchFrame> {
        if switch.prev == switch.next {
            return None;
        }
        let save = self.tasks[switch.prev.index()].suspend_slot();
        let next = &mut self.tasks[switch.next.index()];
        Some(SwitchFrame {
            save,
            resume: next.take_resume(),
            kernel_stack_top: next.kernel_stack_top(),
        })
    }

    /// Target for the very first task, see [`Scheduler::start`].
    pub fn first_resume(&mut self, id: TaskId) -> (Resume, u32) {
        let task = &mut self.tasks[id.index()];
        (task.take_resume(), task.kernel_stack_top())
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.index())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn runnable(&self) -> &RunQueue {
        &self.runnable
    }

    pub fn running(&self) -> &RunQueue {
        &self.running
    }

    pub fn waiting(&self) -> &RunQueue {
        &self.waiting
    }

    /// Finds the task whose control block contains `addr` by masking down to
    /// the block boundary and checking the header stamped there.
    ///
    /// # Safety
    ///
    /// `addr` must lie in memory readable through `offset`.
    pub unsafe fn owner_of_stack(&self, addr: u32, offset: PhysOffset) -> Option<TaskId> {
        let header = block_header(addr, offset);
        if header.magic != TASK_BLOCK_MAGIC {
            return None;
        }
        let task = self.tasks.get(header.pid as usize)?;
        task.owns(addr).then_some(task.id)
    }
}

pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Resets the run queues. Tasks created before [`start`] are kept.
pub fn init() {
    let _guard = InterruptGuard::new();
    let scheduler = SCHEDULER.lock();
    log::info!(
        "Scheduler ready: {} task slots, {} queued",
        MAX_TASKS,
        scheduler.runnable.len()
    );
}

// Task blocks come from managed RAM, which `init_paging` identity maps.
fn spawn(entry: TaskEntry, name: &str) -> Result<TaskId, SpawnError> {
    let result = {
        let _guard = InterruptGuard::new();
        with_frame_allocator(|frames| unsafe {
            SCHEDULER
                .lock()
                .spawn_from(frames, PhysOffset::IDENTITY, entry, name)
        })
        .unwrap_or(Err(SpawnError::OutOfFrames))
    };
    let id = result?;
    log::info!("Created task {} ({})", id, name);
    Ok(id)
}

/// Creates a ring 3 task entering `entry` with `user_stack`. Both must be
/// mapped user accessible.
pub fn create_task(entry: u32, user_stack: u32, name: &str) -> Result<TaskId, SpawnError> {
    spawn(TaskEntry::User { entry, user_stack }, name)
}

/// Creates a ring 0 thread running `entry` on its control block's stack.
pub fn create_kernel_task(entry: extern "C" fn() -> !, name: &str) -> Result<TaskId, SpawnError> {
    spawn(
        TaskEntry::Kernel {
            entry: entry as usize as u32,
        },
        name,
    )
}

/// Switches to the next runnable task. A no-op before [`start`].
///
/// The scheduler lock is released before the stack switch; interrupts stay
/// masked until the resumed context drops its own guard or `iretd`s.
pub fn schedule() {
    let _guard = InterruptGuard::new();
    let frame = {
        let mut scheduler = SCHEDULER.lock();
        let Some(switch) = scheduler.pick_next() else {
            return;
        };
        log::trace!("switch {} -> {}", switch.prev, switch.next);
        scheduler.prepare(switch)
    };
    let Some(frame) = frame else {
        return;
    };

    gdt::set_kernel_stack(frame.kernel_stack_top);
    unsafe { switch::resume(frame.save, frame.resume) };
}

/// Enters the first runnable task. The calling context is abandoned.
pub fn start() -> ! {
    let _guard = InterruptGuard::new();
    let (resume, top) = {
        let mut scheduler = SCHEDULER.lock();
        let Some(first) = scheduler.start() else {
            panic!("no task to start");
        };
        log::info!("Starting task {}", first);
        scheduler.first_resume(first)
    };
    gdt::set_kernel_stack(top);
    unsafe { switch::enter(resume) }
}

pub fn current() -> Option<TaskId> {
    let _guard = InterruptGuard::new();
    SCHEDULER.lock().current()
}

/// Task owning the kernel stack `addr` belongs to.
pub fn owner_of_stack(addr: u32) -> Option<TaskId> {
    let _guard = InterruptGuard::new();
    unsafe { SCHEDULER.lock().owner_of_stack(addr, PhysOffset::IDENTITY) }
}

/// Called from the timer interrupt after end-of-interrupt.
pub fn timer_tick() {
    schedule();
}
