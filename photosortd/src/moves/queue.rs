//! Serialized, rate-limited move requests with retry on throttling.
//!
//! Callers hand requests to a single background worker over an unbounded
//! channel and wait on a per-request completion handle. The worker drains the
//! channel in batches of up to `batch_size`, but never waits for a batch to
//! fill: whatever is already buffered gets processed right away, one request
//! at a time, each behind its own rate-limit slot.
//!
//! A throttled request leaves the drain loop and backs off in its own task, so
//! requests submitted after it may finish first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use photosort_core::{FilesClient, FilesError, MoveResult, Transport, is_absolute_path};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::backoff::RetryPolicy;
use crate::rate_limit::RateLimiter;

pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum MoveError {
    #[error("path must be absolute: {path}")]
    InvalidPath { path: String },
    #[error("move failed: {0}")]
    Failed(#[source] FilesError),
    #[error("move still throttled after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: FilesError,
    },
    #[error("move queue stopped before the request settled")]
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveQueueConfig {
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for MoveQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

type Outcome = Result<MoveResult, MoveError>;

struct MoveRequest {
    id: u64,
    from: String,
    to: String,
    done: oneshot::Sender<Outcome>,
}

impl MoveRequest {
    fn settle(self, outcome: Outcome) {
        match &outcome {
            Ok(_) => debug!(id = self.id, from = %self.from, to = %self.to, "move completed"),
            Err(err) => warn!(
                id = self.id,
                from = %self.from,
                to = %self.to,
                error = %err,
                "move failed"
            ),
        }
        if self.done.send(outcome).is_err() {
            debug!(id = self.id, "caller stopped waiting before the move settled");
        }
    }
}

/// Completion handle of one submitted move.
#[must_use = "a submitted move is only observed by awaiting its handle"]
pub struct PendingMove {
    id: u64,
    outcome: oneshot::Receiver<Outcome>,
}

impl PendingMove {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(self) -> Outcome {
        self.outcome.await.unwrap_or(Err(MoveError::Abandoned))
    }
}

/// Handle to the move worker. Clones share the same worker, which stops once
/// every handle is gone and the requests already queued are settled.
#[derive(Clone)]
pub struct MoveQueue {
    tx: mpsc::UnboundedSender<MoveRequest>,
    next_id: Arc<AtomicU64>,
}

impl MoveQueue {
    /// Spawns the worker on the current tokio runtime.
    pub fn start<T>(client: FilesClient<T>, limiter: RateLimiter, config: MoveQueueConfig) -> Self
    where
        T: Transport + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Worker {
            client,
            limiter,
            retry: config.retry,
            batch_size: config.batch_size.max(1),
        });
        tokio::spawn(worker.run(rx));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Validates and enqueues a move without waiting for it.
    ///
    /// Relative paths are rejected here, before anything is queued or sent.
    pub fn submit(&self, from: &str, to: &str) -> Result<PendingMove, MoveError> {
        for path in [from, to] {
            if !is_absolute_path(path) {
                return Err(MoveError::InvalidPath {
                    path: path.to_string(),
                });
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done, outcome) = oneshot::channel();
        self.tx
            .send(MoveRequest {
                id,
                from: from.to_string(),
                to: to.to_string(),
                done,
            })
            .map_err(|_| MoveError::Abandoned)?;
        trace!(id, from, to, "move queued");
        Ok(PendingMove { id, outcome })
    }

    /// Moves `from` to `to` and returns once this particular request settled.
    pub async fn move_photo(&self, from: &str, to: &str) -> Outcome {
        self.submit(from, to)?.wait().await
    }
}

struct Worker<T> {
    client: FilesClient<T>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    batch_size: usize,
}

impl<T: Transport + 'static> Worker<T> {
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<MoveRequest>) {
        let mut batch = Vec::with_capacity(self.batch_size);
        while let Some(first) = rx.recv().await {
            batch.push(first);
            while batch.len() < self.batch_size {
                match rx.try_recv() {
                    Ok(request) => batch.push(request),
                    Err(_) => break,
                }
            }
            if batch.len() == self.batch_size {
                debug!(size = batch.len(), "processing full move batch");
            }
            for request in batch.drain(..) {
                Arc::clone(&self).process(request).await;
            }
        }
        debug!("move queue closed");
    }

    async fn process(self: Arc<Self>, request: MoveRequest) {
        match self.attempt(&request).await {
            Ok(result) => request.settle(Ok(result)),
            Err(err) if err.is_throttled() => {
                tokio::spawn(self.retry_throttled(request, err));
            }
            Err(err) => request.settle(Err(MoveError::Failed(err))),
        }
    }

    /// Retries a request whose first attempt was throttled. `attempts` counts
    /// remote calls made so far.
    async fn retry_throttled(self: Arc<Self>, request: MoveRequest, mut last: FilesError) {
        let mut attempts = 1;
        while self.retry.allows_retry(attempts) {
            let delay = self.retry.delay(attempts);
            info!(
                id = request.id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "move throttled, backing off"
            );
            tokio::time::sleep(delay).await;
            attempts += 1;
            match self.attempt(&request).await {
                Ok(result) => return request.settle(Ok(result)),
                Err(err) if err.is_throttled() => last = err,
                Err(err) => return request.settle(Err(MoveError::Failed(err))),
            }
        }
        request.settle(Err(MoveError::RetriesExhausted { attempts, last }));
    }

    async fn attempt(&self, request: &MoveRequest) -> Result<MoveResult, FilesError> {
        self.limiter
            .with_rate_limit(|| self.client.move_file(&request.from, &request.to))
            .await
    }
}
