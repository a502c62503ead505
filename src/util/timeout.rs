//! Timeout and cancellation helpers.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::SwarmError;

/// Wrap a future with a timeout.
pub async fn with_timeout<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, SwarmError>>,
) -> Result<T, SwarmError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(SwarmError::Timeout(duration.as_millis() as u64)),
    }
}

/// Race a future against a cancellation token and a timeout.
///
/// The future is dropped on cancellation or timeout, so anything it owns must
/// clean up on drop.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    duration: Duration,
    what: &str,
    future: impl Future<Output = Result<T, SwarmError>>,
) -> Result<T, SwarmError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SwarmError::Cancelled(what.to_string())),
        result = with_timeout(duration, future) => result,
    }
}
