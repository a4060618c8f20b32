//! Task Scheduler: async single-prompt jobs, optionally extended with more
//! turns, run against a Session the scheduler creates and tears down on the
//! caller's behalf.

mod scheduler;

pub use scheduler::{CreateTaskRequest, TaskScheduler, TaskStats};
