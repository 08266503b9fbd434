//! Transport-level call policy shared by the store and queue clients.
//!
//! Every client call runs under a per-attempt read timeout and a fixed,
//! bounded number of attempts with exponential backoff. The policy is fixed
//! when a client is built; callers never retry on their own.

use std::{future::Future, time::Duration};
use tokio::time::{sleep, timeout};
use tracing::warn;

const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;

    /// Error used when a single attempt exceeds the read timeout.
    fn timed_out(operation: &'static str, after: Duration) -> Self;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportPolicy {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportPolicy {
    pub fn new(max_attempts: u32, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            connect_timeout,
            read_timeout,
        }
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(5);
        (BASE_BACKOFF * factor).min(MAX_BACKOFF)
    }

    /// Run `call` with the read timeout, retrying transient failures.
    pub async fn run<T, E, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            let result = match timeout(self.read_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(operation, self.read_timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        "transport.retry after {:?}: {}",
                        delay,
                        err
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
