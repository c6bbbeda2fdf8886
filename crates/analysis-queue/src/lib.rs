pub mod queue;
pub mod worker;

pub use queue::{EnqueueRequest, JobQueue, DEFAULT_MAX_RETRIES};
pub use worker::{JobProcessor, QueueWorker, WorkerConfig};
