//! Readiness polling
//!
//! Every Await-* step of a recovery goes through [`poll_until`]. The check
//! closure returns:
//!
//! - `Ok(true)` when the condition holds (polling stops with success),
//! - `Ok(false)` when it does not hold yet (polling continues),
//! - `Err(_)` for a definitive failure (polling stops with that error).
//!
//! Running out of time yields [`Error::PollTimeout`], which callers can tell
//! apart from a check-reported failure. Checks that want to tolerate API
//! errors must translate them into `Ok(false)` themselves.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::Error;

/// Deadline and interval for one readiness poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSpec {
    /// Maximum time to wait
    pub timeout: Duration,
    /// Time between checks
    pub interval: Duration,
}

impl PollSpec {
    /// Create a poll spec
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Create a poll spec from whole seconds
    pub const fn from_secs(timeout: u64, interval: u64) -> Self {
        Self::new(Duration::from_secs(timeout), Duration::from_secs(interval))
    }
}

/// Poll until a condition is met, the check fails, or the timeout is reached.
///
/// The first check runs immediately and a final check runs at the deadline.
/// A check that is still in flight when the deadline passes is allowed to
/// finish; its result wins over the timeout.
pub async fn poll_until<F, Fut>(
    description: &str,
    spec: PollSpec,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if check_fn().await? {
            trace!(operation = %description, attempts, "Poll condition met");
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= spec.timeout {
            return Err(Error::poll_timeout(description, spec.timeout));
        }

        trace!(operation = %description, attempts, "Poll condition not yet met, retrying");
        tokio::time::sleep(spec.interval.min(spec.timeout - elapsed)).await;
    }
}
