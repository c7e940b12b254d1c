//! Retry utilities.
//!
//! - [`Backoff`]: exponential backoff with jitter for transient failures.
//! - [`update_with_refresh`]: read-modify-write of a versioned object, re-read
//!   before every attempt and retried on version conflicts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Exponential backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    delay: Duration,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            delay: config.initial_delay,
        }
    }

    /// Next delay, jittered to 0.5x..1.5x and capped at `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter)
            .min(self.config.max_delay);

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        jittered
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
    }
}

/// Errors that can signal an optimistic-concurrency conflict.
pub trait Conflict {
    fn is_conflict(&self) -> bool;
}

/// Timeout/interval pair bounding [`update_with_refresh`].
#[derive(Clone, Debug)]
pub struct ConflictRetry {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(200),
        }
    }
}

/// Read-modify-write a versioned object.
///
/// `fetch` re-reads the latest version immediately before each attempt and
/// `update` writes against that version. A conflict restarts the whole cycle
/// after `interval`, until `timeout` has passed; any other error is returned
/// as is.
pub async fn update_with_refresh<T, R, E, Fetch, FetchFut, Update, UpdateFut>(
    policy: &ConflictRetry,
    operation_name: &str,
    mut fetch: Fetch,
    mut update: Update,
) -> Result<R, E>
where
    Fetch: FnMut() -> FetchFut,
    FetchFut: Future<Output = Result<T, E>>,
    Update: FnMut(T) -> UpdateFut,
    UpdateFut: Future<Output = Result<R, E>>,
    E: Conflict + Display,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let latest = fetch().await?;

        match update(latest).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() && Instant::now() + policy.interval < deadline => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Version conflict, re-reading and retrying"
                );
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sleep for `duration` unless cancelled first.
///
/// Returns `false` if the token fired.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
