//! Bounded retry-with-timeout for cache visibility.
//!
//! Writes to a cluster reach its cached read path with a delay. Callers that
//! depend on a fresh write being readable poll here instead of sleeping.

use std::future::Future;
use std::time::Instant;

use tagsync_core::error::{Error, Result};

use crate::config::PollConfig;

/// Calls `condition` until it returns `Ok(true)`, an error, or the timeout
/// expires. The first check happens immediately.
///
/// # Errors
///
/// Returns the first error from `condition`, or [`Error::Timeout`] naming
/// `what` once `config.timeout` has elapsed.
pub async fn poll_until<F, Fut>(config: PollConfig, what: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        if condition().await? {
            return Ok(());
        }
        let elapsed = start.elapsed();
        if elapsed >= config.timeout {
            return Err(Error::Timeout {
                message: format!("waiting for {what}"),
                elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            });
        }
        tokio::time::sleep(config.interval.min(config.timeout - elapsed)).await;
    }
}
