//! Tasks, processes and the scheduler.

pub mod ambient;
mod lifecycle;
pub mod process;
mod scheduler;
pub mod table;
pub mod tcb;
pub mod wait;

pub use ambient::{AmbientContext, ConsoleId, FontId, FsNode};
pub use process::{Process, ProcessHandle, ProcessTable};
pub use table::TaskTable;
pub use tcb::{StackRegion, Suspension, Task, TaskEntry, TaskHandle, TaskId, WaitObject};
