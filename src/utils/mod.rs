pub mod backoff;
pub mod progress;
pub mod worker_pool;

pub use backoff::{ExponentialBackoff, RetryError, with_retry};
pub use progress::ProgressCounter;
pub use worker_pool::WorkerPool;
