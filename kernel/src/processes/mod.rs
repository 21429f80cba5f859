pub mod process;
pub mod registers;
pub mod scheduler;
pub mod switch;

pub use process::{SpawnError, TaskId, TaskState};
pub use scheduler::{
    create_kernel_task, create_task, current, owner_of_stack, schedule, start, timer_tick,
};

pub fn init() {
    scheduler::init();
}
