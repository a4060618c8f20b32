//! Batch Scheduler: templated fan-out of N prompts over one Agent, run by a
//! bounded worker pool with per-task retry up to `max_retries` before a task
//! is marked dead.

mod scheduler;

pub use scheduler::{BatchStats, CreateBatchRequest, BatchScheduler};
