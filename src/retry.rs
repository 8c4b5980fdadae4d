//! Bounded fixed-interval retry
//!
//! The controller polls the store through this after a patch until the new
//! resource version is visible.
//!
//! ```ignore
//! use capv::retry::{retry_with_interval, RetryConfig};
//!
//! let verify = RetryConfig::fixed_interval(10, Duration::from_secs(1));
//! let latest = retry_with_interval(&verify, "verify_patch", || async {
//!     store.get_vsphere_machine("default", "worker-0").await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// How often and how long to retry
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Attempts including the first; at least one is always made
    pub max_attempts: u32,
    /// Pause between attempts
    pub interval: Duration,
}

impl RetryConfig {
    /// Poll every `interval`, at most `attempts` times
    pub fn fixed_interval(attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: attempts,
            interval,
        }
    }
}

/// Run `operation` until it succeeds or the attempts run out
///
/// Returns the first success, or the error of the last attempt.
pub async fn retry_with_interval<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut failures = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        failures += 1;

        if failures >= attempts {
            warn!(operation = %operation_name, attempts, error = %err, "giving up");
            return Err(err);
        }

        debug!(
            operation = %operation_name,
            attempt = failures,
            error = %err,
            delay_ms = config.interval.as_millis() as u64,
            "retrying"
        );
        tokio::time::sleep(config.interval).await;
    }
}
