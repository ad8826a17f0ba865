//! Detached delivery of finished profiles with bounded retry.
//!
//! Every rotated profile becomes an [`UploadTask`] running on its own tracked task.
//! A task calls the [`Publisher`], and on a retryable failure waits a jittered,
//! exponentially growing delay before trying again, up to the policy's attempt
//! ceiling. Exhausted and rejected tasks are logged and dropped.

pub mod http;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::store::RotatedProfile;

pub use http::HttpPublisher;

/// Failure reported by a [`Publisher`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Transient failure (network, timeout, server error); worth retrying.
    #[error("retryable publish failure: {0}")]
    Retryable(String),

    /// The collector rejected the profile; retrying will not help.
    #[error("non-retryable publish failure: {0}")]
    NonRetryable(String),
}

/// Delivers a finished profile to its destination.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, profile: &RotatedProfile) -> Result<(), PublishError>;
}

/// Attempt ceiling and backoff shape for publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Upper bound of the wait after the given failed attempt (1-indexed).
    ///
    /// The bound doubles with each attempt (`initial_delay * 2^(attempt-1)`), capped
    /// at `max_delay`.
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Full-jitter wait after the given failed attempt: uniform in `[0, ceiling]`.
    pub fn backoff_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = u64::try_from(self.delay_ceiling(attempt).as_nanos()).unwrap_or(u64::MAX);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rng.gen_range(0..=ceiling))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_UPLOAD_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(crate::config::DEFAULT_UPLOAD_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(crate::config::DEFAULT_UPLOAD_MAX_DELAY_MS),
        }
    }
}

/// One profile on its way to the publisher.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub profile: RotatedProfile,
    /// Attempts made so far.
    pub attempt: u32,
    /// When the next attempt is due, while waiting out a backoff.
    pub next_retry_at: Option<Instant>,
}

impl UploadTask {
    pub fn new(profile: RotatedProfile) -> Self {
        Self {
            profile,
            attempt: 0,
            next_retry_at: None,
        }
    }
}

/// Outcome counters, readable while the uploader runs.
#[derive(Debug, Default)]
pub struct UploadStats {
    delivered: AtomicU64,
    rejected: AtomicU64,
    exhausted: AtomicU64,
    abandoned: AtomicU64,
}

impl UploadStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }
}

/// Runs upload tasks concurrently with ingestion and with each other.
pub struct Uploader {
    publisher: Arc<dyn Publisher>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    stats: Arc<UploadStats>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("policy", &self.policy)
            .field("pending", &self.tracker.len())
            .field("closed", &self.tracker.is_closed())
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Creates an uploader allowing `max_concurrent` publishes in flight.
    pub fn new(publisher: Arc<dyn Publisher>, policy: RetryPolicy, max_concurrent: usize) -> Self {
        Self {
            publisher,
            policy,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            stats: Arc::new(UploadStats::default()),
        }
    }

    /// Queues a profile for delivery and returns immediately.
    ///
    /// Returns `false` if the uploader has been shut down; the profile is dropped.
    pub fn submit(&self, profile: RotatedProfile) -> bool {
        if self.tracker.is_closed() {
            tracing::warn!(
                key = %profile.key,
                epoch = profile.epoch,
                "uploader closed, dropping profile"
            );
            return false;
        }

        let delivery = Delivery {
            publisher: self.publisher.clone(),
            policy: self.policy,
            permits: self.permits.clone(),
            cancel: self.cancel.clone(),
            stats: self.stats.clone(),
        };
        self.tracker.spawn(delivery.run(UploadTask::new(profile)));
        true
    }

    /// Number of tasks not yet finished.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn stats(&self) -> &UploadStats {
        &self.stats
    }

    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Stops accepting tasks and waits up to `timeout` for outstanding ones.
    ///
    /// Tasks still running at the deadline are cancelled. Returns how many were
    /// abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            tracing::info!("all uploads finished");
            return 0;
        }

        let outstanding = self.tracker.len();
        tracing::warn!(
            outstanding,
            timeout_ms = timeout.as_millis(),
            "upload shutdown deadline reached, abandoning remaining uploads"
        );
        self.cancel.cancel();
        self.tracker.wait().await;
        outstanding
    }
}

/// Everything one task needs, detached from the uploader.
struct Delivery {
    publisher: Arc<dyn Publisher>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    stats: Arc<UploadStats>,
}

impl Delivery {
    async fn run(self, mut task: UploadTask) {
        loop {
            // The permit covers one publish call only and is released before any backoff.
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                () = self.cancel.cancelled() => {
                    self.abandon(&task);
                    return;
                }
            };

            task.attempt += 1;
            task.next_retry_at = None;

            let result = tokio::select! {
                result = self.publisher.publish(&task.profile) => result,
                () = self.cancel.cancelled() => {
                    self.abandon(&task);
                    return;
                }
            };
            drop(permit);

            let reason = match result {
                Ok(()) => {
                    tracing::debug!(
                        key = %task.profile.key,
                        epoch = task.profile.epoch,
                        attempts = task.attempt,
                        "profile delivered"
                    );
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(PublishError::NonRetryable(reason)) => {
                    tracing::error!(
                        org_id = task.profile.key.org_id(),
                        dataset_id = task.profile.key.dataset_id(),
                        key = %task.profile.key,
                        window_start = %task.profile.window_start,
                        attempt = task.attempt,
                        error = %reason,
                        "profile rejected by collector, dropping"
                    );
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(PublishError::Retryable(reason)) => reason,
            };

            if task.attempt >= self.policy.max_attempts {
                tracing::error!(
                    org_id = task.profile.key.org_id(),
                    dataset_id = task.profile.key.dataset_id(),
                    key = %task.profile.key,
                    window_start = %task.profile.window_start,
                    attempts = task.attempt,
                    error = %reason,
                    "all publish attempts failed, dropping profile"
                );
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                return;
            }

            let delay = self
                .policy
                .backoff_delay(task.attempt, &mut rand::thread_rng());
            let deadline = Instant::now() + delay;
            task.next_retry_at = Some(deadline);

            tracing::warn!(
                key = %task.profile.key,
                attempt = task.attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis(),
                error = %reason,
                "publish failed, retrying"
            );

            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                () = self.cancel.cancelled() => {
                    self.abandon(&task);
                    return;
                }
            }
        }
    }

    fn abandon(&self, task: &UploadTask) {
        tracing::warn!(
            key = %task.profile.key,
            epoch = task.profile.epoch,
            attempts = task.attempt,
            "upload abandoned at shutdown"
        );
        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
    }
}
