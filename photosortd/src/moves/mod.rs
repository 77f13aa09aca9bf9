mod backoff;
mod queue;

pub use backoff::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE, RetryPolicy};
pub use queue::{DEFAULT_BATCH_SIZE, MoveError, MoveQueue, MoveQueueConfig, PendingMove};
