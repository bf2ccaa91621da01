//! Fan-out/join helpers.
//!
//! Every concurrent stage spawns its tasks into a [`JoinSet`] and the
//! spawning task collects the results; workers never share a buffer.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Run `fut` unless `cancel` fires first.
///
/// # Errors
/// Returns [`Error::Cancelled`] if the token is cancelled before `fut` completes,
/// otherwise whatever `fut` returns.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Wait for every task, then report the first failure if there was one.
///
/// Results are returned in completion order.
///
/// # Errors
/// Returns the first error observed after all tasks have finished.
pub async fn join_all<T: 'static>(mut set: JoinSet<Result<T>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(set.len());
    let mut first_error = None;

    while let Some(joined) = set.join_next().await {
        match joined.map_err(Error::from).and_then(|r| r) {
            Ok(value) => results.push(value),
            Err(e) => {
                debug!(error = %e, "Task failed, draining remaining tasks");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

/// Wait for every task, aborting the rest on the first failure.
///
/// # Errors
/// Returns the first error; remaining tasks are aborted before returning.
pub async fn join_fail_fast<T: 'static>(mut set: JoinSet<Result<T>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(set.len());

    while let Some(joined) = set.join_next().await {
        match joined.map_err(Error::from).and_then(|r| r) {
            Ok(value) => results.push(value),
            Err(e) => {
                debug!(error = %e, remaining = set.len(), "Task failed, aborting stage");
                set.shutdown().await;
                return Err(e);
            }
        }
    }

    Ok(results)
}
