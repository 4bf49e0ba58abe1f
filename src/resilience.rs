//! Backoff profiles and in-flight limiting.
//!
//! [`RetryConfig`] describes how stubbornly a broker link connect is
//! retried; different call sites want very different stubbornness (a
//! daemon reconnect should never give up, a publish-path reconnect must
//! give up almost immediately so failover can happen). [`Bulkhead`]
//! caps how many RPC round-trips may be outstanding at once, so a slow
//! destination queues callers instead of accumulating unbounded pending
//! requests.
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), telemetry_relay::resilience::BulkheadClosed> {
//! use telemetry_relay::resilience::{Bulkhead, RetryConfig};
//!
//! let retry = RetryConfig::startup();
//! assert!(retry.max_attempts < usize::MAX);
//!
//! let bulkhead = Bulkhead::new(32);
//! let permit = bulkhead.acquire().await?;
//! drop(permit); // slot freed
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// How a connection attempt is retried.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before giving up. `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Ceiling the exponential backoff never exceeds.
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each failure.
    pub backoff_factor: f64,

    /// Per-attempt timeout; an attempt that hangs counts as a failure.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Startup profile: bounded, so a bad broker URL or firewalled host
    /// surfaces as a startup failure within about a minute instead of
    /// looking like a hung process.
    pub fn startup() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Runtime profile: retry forever, backoff capped at five minutes.
    /// An extended broker outage must not require a manual restart once
    /// startup has succeeded.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Publish-path profile: one bounded attempt. A caller holding a
    /// request must learn of a dead link in a few seconds so the
    /// adapter can try the secondary, not sit in a reconnect loop.
    pub fn publish_path() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(3),
        }
    }

    /// Profile for tests: everything shrunk to milliseconds.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Backoff delay before retrying after `attempt` failures
    /// (1-indexed; attempt 1 waits the initial delay).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_factor);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }
}

/// Returned by [`Bulkhead::acquire`] when the limiter has been torn
/// down (engine shutdown).
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed: max {max_concurrent} concurrent operations")]
pub struct BulkheadClosed {
    pub max_concurrent: usize,
}

/// Caps concurrent operations.
///
/// Callers over the cap are parked on the semaphore, not rejected;
/// [`Bulkhead::try_acquire`] is the fail-fast variant. The permit
/// releases its slot on drop.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// The configured cap.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Whether every slot is taken.
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}
