//! Bounded-concurrency fetcher with retry and jittered exponential backoff.

use crate::traits::{FetchError, Transport};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// Retry schedule for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_retries: u32,

    /// Delay before the second attempt, doubled on every further attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Exponential part of the delay that follows attempt `attempt` (1-based).
    pub fn base_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        self.base_delay.mul_f64(2f64.powi(exponent))
    }

    /// Full backoff after attempt `attempt`: the exponential part plus up to
    /// 10 % of it as random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_for(attempt);
        let jitter: f64 = rand::rng().random_range(0.0..1.0);
        base + base.mul_f64(0.1 * jitter)
    }
}

/// Issues requests through a [`Transport`], at most `concurrency` at a time.
///
/// A concurrency slot is held for one attempt only and released before any
/// backoff sleep, so a retrying request never starves the others.
pub struct Fetcher<T> {
    transport: T,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T, concurrency_limit: usize, policy: RetryPolicy) -> Self {
        Self {
            transport,
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            policy,
        }
    }

    /// Fetches `url`, retrying on 429/503, timeouts and connection errors.
    ///
    /// # Errors
    ///
    /// - [`FetchError::NotFound`] on 404, without retrying
    /// - [`FetchError::Status`] on any other non-200 status, without retrying
    /// - [`FetchError::RetriesExhausted`] once every attempt failed transiently
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let attempts = self.policy.max_retries.max(1);

        for attempt in 1..=attempts {
            let reply = {
                // The semaphore is private and never closed.
                let Ok(_permit) = self.semaphore.acquire().await else {
                    return Err(FetchError::RetriesExhausted {
                        attempts: attempt - 1,
                    });
                };
                self.transport.get(url).await
            };

            match reply {
                Ok(reply) if reply.status == 200 => return Ok(reply.body),
                Ok(reply) if reply.status == 404 => return Err(FetchError::NotFound),
                Ok(reply) if reply.status == 429 || reply.status == 503 => {
                    debug!(attempt, status = reply.status, "Transient status, will retry");
                }
                Ok(reply) => return Err(FetchError::Status(reply.status)),
                Err(e) => {
                    debug!(attempt, error = %e, "Transport failure, will retry");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.delay_for(attempt)).await;
            }
        }

        warn!(attempts, "Max retries exceeded");
        Err(FetchError::RetriesExhausted { attempts })
    }
}
