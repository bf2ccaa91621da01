//! Retry policies for flaky operations.
//!
//! Cloud API calls are never retried here; only remote commands and
//! readiness probes go through these helpers.

use std::fmt::Display;
use std::time::Duration;

use tracing::{debug, info};

/// Bounded number of attempts with a fixed delay between them.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryConfig {
    /// Fixed delay between a bounded number of attempts.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Policy for waiting on a server's readiness marker: 15 × 5 s.
    #[must_use]
    pub fn readiness() -> Self {
        Self::fixed(15, Duration::from_secs(5))
    }

    /// Policy for a single remote command: 3 × 5 s.
    #[must_use]
    pub fn remote_command() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

/// Execute a function with retry logic.
///
/// Blocks the calling thread between attempts; use from blocking contexts only.
///
/// # Errors
/// Returns the last error if all attempts fail.
pub fn with_retry<T, E, F>(config: &RetryConfig, operation_name: &str, mut f: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0;
    let delay = config.delay;

    loop {
        attempt += 1;
        match f() {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= config.max_attempts {
                    debug!("{operation_name} failed after {attempt} attempts: {e}");
                    return Err(e);
                }

                info!(
                    "{operation_name} failed (attempt {attempt}/{}): {e}. Retrying in {delay:?}...",
                    config.max_attempts
                );

                std::thread::sleep(delay);
            }
        }
    }
}

/// Execute an async function with retry logic.
///
/// # Errors
/// Returns the last error if all attempts fail.
pub async fn with_retry_async<T, E, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    let delay = config.delay;

    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= config.max_attempts {
                    debug!("{operation_name} failed after {attempt} attempts: {e}");
                    return Err(e);
                }

                info!(
                    "{operation_name} failed (attempt {attempt}/{}): {e}. Retrying in {delay:?}...",
                    config.max_attempts
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
