//! Sliding-window rate limiting with cooperative FIFO admission.
//!
//! Callers queue up behind each other; each one waits on its own admission
//! gate rather than on the shared lock, and the lock is only held for the
//! short bookkeeping sections. Once admitted, a caller additionally waits
//! until finishing its work cannot push the number of completions inside the
//! trailing window above the configured maximum.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::clock::{Clock, TokioClock};

pub const DEFAULT_MAX_PER_WINDOW: u32 = 1;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_per_window: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window: max_per_window.max(1),
            window,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_WINDOW, DEFAULT_WINDOW)
    }
}

struct WorkItem {
    id: u64,
    gate: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct LimiterState {
    queue: VecDeque<WorkItem>,
    completions: VecDeque<Instant>,
    next_id: u64,
}

struct Inner {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                state: Mutex::new(LimiterState::default()),
            }),
        }
    }

    /// Number of callers currently holding or waiting for a slot.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Runs `work` once every earlier caller has finished and the window has room.
    ///
    /// Whatever `work` resolves to is handed back untouched, so fallible work
    /// keeps its `Result`. The slot is released on every exit path, including
    /// a panic inside `work` or the returned future being dropped while queued.
    pub async fn with_rate_limit<F, Fut, T>(&self, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (slot, gate) = self.enqueue();
        if let Some(gate) = gate {
            // The sender only goes away after being fired by the predecessor.
            let _ = gate.await;
        }
        trace!(item = slot.id, "rate limit slot admitted");

        if let Some(delay) = self.required_delay() {
            debug!(
                item = slot.id,
                delay_ms = delay.as_millis() as u64,
                "rate limit reached, delaying work"
            );
            tokio::time::sleep(delay).await;
        }

        let result = work().await;
        self.record_completion();
        drop(slot);
        result
    }

    fn enqueue(&self) -> (Slot, Option<oneshot::Receiver<()>>) {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        let gate = if state.queue.is_empty() {
            state.queue.push_back(WorkItem { id, gate: None });
            None
        } else {
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(WorkItem { id, gate: Some(tx) });
            Some(rx)
        };
        (
            Slot {
                id,
                inner: Arc::clone(&self.inner),
            },
            gate,
        )
    }

    fn required_delay(&self) -> Option<Duration> {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock();
        prune(&mut state.completions, now, self.inner.config.window);
        delay_until_slot(&state.completions, now, self.inner.config)
    }

    fn record_completion(&self) {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock();
        state.completions.push_back(now);
        prune(&mut state.completions, now, self.inner.config.window);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Queue membership of one caller. Dropping it removes the caller and, when
/// it was at the head, admits whoever is next.
struct Slot {
    id: u64,
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        let Some(position) = state.queue.iter().position(|item| item.id == self.id) else {
            return;
        };
        state.queue.remove(position);
        if position == 0
            && let Some(next) = state.queue.front_mut()
            && let Some(gate) = next.gate.take()
        {
            let _ = gate.send(());
        }
    }
}

fn prune(completions: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = completions.front() {
        if now.saturating_duration_since(*oldest) > window {
            completions.pop_front();
        } else {
            break;
        }
    }
}

/// With `completions` ordered oldest first and already pruned, the entry
/// `max_per_window` places from the newest is the one that has to leave the
/// window before one more completion fits.
fn delay_until_slot(
    completions: &VecDeque<Instant>,
    now: Instant,
    config: RateLimitConfig,
) -> Option<Duration> {
    let limit = config.max_per_window as usize;
    if completions.len() < limit {
        return None;
    }
    let pivot = completions[completions.len() - limit];
    let ready_at = pivot + config.window;
    (ready_at > now).then(|| ready_at - now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn limiter(max: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(max, Duration::from_millis(window_ms)))
    }

    #[test]
    fn delay_uses_entry_that_frees_a_slot() {
        let base = Instant::now();
        let config = RateLimitConfig::new(2, Duration::from_secs(1));
        let completions: VecDeque<Instant> = [0u64, 200, 400]
            .into_iter()
            .map(|ms| base + Duration::from_millis(ms))
            .collect();
        let now = base + Duration::from_millis(500);

        // Oldest is 0ms, but two completions (200ms, 400ms) still sit in the window.
        assert_eq!(
            delay_until_slot(&completions, now, config),
            Some(Duration::from_millis(700))
        );
    }

    #[test]
    fn no_delay_below_limit() {
        let base = Instant::now();
        let config = RateLimitConfig::new(3, Duration::from_secs(1));
        let completions: VecDeque<Instant> = [base, base].into_iter().collect();
        assert_eq!(delay_until_slot(&completions, base, config), None);
    }

    #[test]
    fn prune_keeps_entries_exactly_one_window_old() {
        let base = Instant::now();
        let window = Duration::from_secs(1);
        let mut completions: VecDeque<Instant> =
            [base, base + Duration::from_millis(10)].into_iter().collect();

        prune(&mut completions, base + window, window);
        assert_eq!(completions.len(), 2);

        prune(&mut completions, base + Duration::from_millis(1005), window);
        assert_eq!(completions.len(), 1);
    }

    #[test]
    fn zero_limit_is_raised_to_one() {
        assert_eq!(RateLimitConfig::new(0, DEFAULT_WINDOW).max_per_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_first_work_immediately_and_returns_result() {
        let limiter = limiter(1, 1000);
        let start = Instant::now();
        let value = limiter.with_rate_limit(|| async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(Instant::now(), start);
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn propagates_work_errors() {
        let limiter = limiter(1, 1000);
        let result: Result<(), String> = limiter
            .with_rate_limit(|| async { Err("boom".to_string()) })
            .await;
        assert_eq!(result, Err("boom".to_string()));
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_work_runs_in_submission_order() {
        let limiter = limiter(1, 1000);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for n in 1..=3 {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter
                    .with_rate_limit(|| async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        order.lock().unwrap().push(n);
                        n
                    })
                    .await
            }));
            settle().await;
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(results, vec![1, 2, 3]);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_slot_window_spaces_completions_by_a_window() {
        let limiter = limiter(1, 1000);
        let completions = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            let completions = Arc::clone(&completions);
            handles.push(tokio::spawn(async move {
                limiter
                    .with_rate_limit(|| async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        completions.lock().unwrap().push(Instant::now());
                    })
                    .await
            }));
            settle().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 3);
        for pair in completions.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_limit_inside_a_window() {
        let limiter = limiter(2, 1000);
        let completions = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let completions = Arc::clone(&completions);
            handles.push(tokio::spawn(async move {
                limiter
                    .with_rate_limit(|| async move {
                        completions.lock().unwrap().push(Instant::now());
                    })
                    .await
            }));
            settle().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 6);
        // The second completion shares the first window.
        assert_eq!(completions[1], completions[0]);
        for k in 0..completions.len() - 2 {
            assert!(completions[k + 2] - completions[k] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn later_work_runs_after_failed_or_panicking_work() {
        let limiter = limiter(1, 100);

        let failing = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .with_rate_limit(|| async { Err::<(), _>("failed") })
                    .await
            })
        };
        settle().await;
        let panicking = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .with_rate_limit(|| async { panic!("work exploded") })
                    .await
            })
        };
        settle().await;
        let after = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.with_rate_limit(|| async { "ran" }).await })
        };

        assert_eq!(failing.await.unwrap(), Err("failed"));
        assert!(panicking.await.unwrap_err().is_panic());
        assert_eq!(after.await.unwrap(), "ran");
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiters_leave_the_queue() {
        let limiter = limiter(1, 100);

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let head = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .with_rate_limit(|| async move {
                        let _ = release_rx.await;
                        "head"
                    })
                    .await
            })
        };
        settle().await;
        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.with_rate_limit(|| async { "cancelled" }).await })
        };
        settle().await;
        let tail = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.with_rate_limit(|| async { "tail" }).await })
        };
        settle().await;
        assert_eq!(limiter.queued(), 3);

        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert_eq!(limiter.queued(), 2);

        release_tx.send(()).unwrap();
        assert_eq!(head.await.unwrap(), "head");
        assert_eq!(tail.await.unwrap(), "tail");
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_running_head_admits_the_next_caller() {
        let limiter = limiter(1, 100);

        let head = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .with_rate_limit(|| async {
                        std::future::pending::<()>().await;
                    })
                    .await
            })
        };
        settle().await;
        let next = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.with_rate_limit(|| async { "next" }).await })
        };
        settle().await;

        head.abort();
        assert!(head.await.unwrap_err().is_cancelled());
        assert_eq!(next.await.unwrap(), "next");
        assert_eq!(limiter.queued(), 0);
    }

    /// Time that only moves when a test says so.
    struct ManualClock {
        base: Instant,
        offset: StdMutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: StdMutex::new(Duration::ZERO),
            })
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_bookkeeping_follows_the_injected_clock() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(
            RateLimitConfig::new(1, Duration::from_secs(1)),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let start = Instant::now();

        limiter.with_rate_limit(|| async {}).await;
        clock.advance(Duration::from_millis(1001));
        limiter.with_rate_limit(|| async {}).await;

        // Only the injected clock moved, so the second call was not delayed.
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn frozen_clock_keeps_the_window_full() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(
            RateLimitConfig::new(1, Duration::from_secs(1)),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let start = Instant::now();

        limiter.with_rate_limit(|| async {}).await;
        limiter.with_rate_limit(|| async {}).await;

        assert!(Instant::now() - start >= Duration::from_secs(1));
    }
}
