use tokio::time::Instant;

/// Source of "now" for time-window bookkeeping.
///
/// Waiting itself always goes through `tokio::time`, so tests either pause the
/// runtime or move an injected clock past the window.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Reads tokio's clock, which follows `tokio::time::pause` in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
