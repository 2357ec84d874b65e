//! Bounded retry for operations that fail transiently.
//!
//! Remote commands and Machine creation retry a fixed number of times with a
//! fixed pause in between. There is no unbounded mode: an attempt count of
//! zero still makes exactly one attempt.
//!
//! # Example
//!
//! ```ignore
//! use phoenix_common::retry::{retry, RetryConfig};
//!
//! let out = retry(
//!     &RetryConfig::fixed(10, Duration::from_secs(10)),
//!     "ssh master-0",
//!     || async { run_ssh("master-0", "true").await },
//! ).await?;
//! ```

use std::time::Duration;

use tracing::{error, warn};

/// How an operation that may fail transiently is retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts; values below 1 mean a single attempt
    pub max_attempts: u32,
    /// Pause between attempts
    pub pause: Duration,
}

impl RetryConfig {
    /// Fixed attempt count with a fixed pause between attempts
    pub fn fixed(attempts: u32, pause: Duration) -> Self {
        Self {
            max_attempts: attempts,
            pause,
        }
    }

    /// Attempts actually made before giving up
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Execute an async operation until it succeeds or the attempts run out.
///
/// Returns the first success, or the last error once the attempts are
/// exhausted. Callers decide whether exhaustion is fatal; nothing here wraps
/// the error.
pub async fn retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_while(config, operation_name, |_| true, &mut operation).await
}

/// Like [`retry`], but stops immediately on errors for which `should_retry`
/// returns false.
pub async fn retry_while<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.attempts();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                if attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = config.pause.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(config.pause).await;
            }
        }
    }
}
