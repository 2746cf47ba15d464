//! Completion tracking for asynchronous provider actions and freshly booted
//! hosts.
//!
//! Neither waiter retries on its own behalf beyond its poll loop, and neither
//! imposes an implicit timeout on operations: callers compose a deadline into
//! the cancellation token when they need one.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::cloud::{CloudError, CloudFuture, OperationStatus, PendingOperation};

/// Default spacing between status queries and reachability dials.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Floor applied to caller-supplied intervals; a zero interval would spin.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on a single reachability dial.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while waiting.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    /// The provider reported the action as failed.
    #[error("operation {operation_id} failed: {message}")]
    OperationFailed {
        /// Provider identifier of the action.
        operation_id: String,
        /// Provider error message.
        message: String,
    },
    /// The caller cancelled the wait.
    #[error("wait cancelled")]
    Cancelled,
    /// The host did not accept a connection within the bound.
    #[error("{address} not reachable after {waited:?}")]
    Timeout {
        /// Address that was dialled.
        address: SocketAddr,
        /// Bound that elapsed.
        waited: Duration,
    },
    /// Querying the action status failed.
    #[error(transparent)]
    Provider(#[from] CloudError),
}

/// Source of operation status, implemented by cloud providers.
pub trait OperationSource: Send + Sync {
    /// Returns the current status of `operation`.
    fn operation_status<'a>(
        &'a self,
        operation: &'a PendingOperation,
    ) -> CloudFuture<'a, OperationStatus>;
}

/// Polls `operation` every `poll_interval` (at least [`MIN_POLL_INTERVAL`])
/// until it reaches a terminal state or `cancel` fires.
///
/// The interval timer is owned by this call and released on every return
/// path.
///
/// # Errors
///
/// Returns [`WaitError::OperationFailed`] when the provider reports failure,
/// [`WaitError::Cancelled`] when `cancel` fires first, and
/// [`WaitError::Provider`] when a status query fails.
#[instrument(skip(source, cancel), fields(operation = %operation.operation_id))]
pub async fn wait_for_completion<S>(
    source: &S,
    operation: &PendingOperation,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), WaitError>
where
    S: OperationSource + ?Sized,
{
    let period = poll_interval.max(MIN_POLL_INTERVAL);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = ticker.tick() => {}
        }

        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(WaitError::Cancelled),
            status = source.operation_status(operation) => status?,
        };

        match status {
            OperationStatus::Running => debug!("operation still running"),
            OperationStatus::Succeeded => return Ok(()),
            OperationStatus::Failed { message } => {
                return Err(WaitError::OperationFailed {
                    operation_id: operation.operation_id.clone(),
                    message,
                });
            }
        }
    }
}

/// Dials `address` every `retry_interval` (at least [`MIN_POLL_INTERVAL`])
/// until a connection succeeds or `bound` elapses.
///
/// # Errors
///
/// Returns [`WaitError::Timeout`] once the bound elapses without a single
/// successful dial, or [`WaitError::Cancelled`] when `cancel` fires first.
#[instrument(skip(cancel))]
pub async fn wait_for_reachability(
    address: SocketAddr,
    bound: Duration,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    let deadline = Instant::now() + bound;
    let period = retry_interval.max(MIN_POLL_INTERVAL);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WaitError::Timeout {
                address,
                waited: bound,
            });
        }

        let dial = timeout(DIAL_TIMEOUT.min(remaining), TcpStream::connect(address));
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(WaitError::Cancelled),
            outcome = dial => match outcome {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(err)) => debug!(error = %err, "host not reachable yet"),
                Err(_) => debug!("dial timed out"),
            },
        }

        let pause = period.min(deadline.saturating_duration_since(Instant::now()));
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(WaitError::Cancelled),
            () = sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests;
