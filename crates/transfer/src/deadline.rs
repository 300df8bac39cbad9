use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::TransferError;

/// Runs `fut` unless `cancel` fires or `deadline` passes first.
pub(crate) async fn bounded<F: Future>(
    fut: F,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<F::Output, TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        res = tokio::time::timeout_at(deadline, fut) => {
            res.map_err(|_| TransferError::DeadlineExceeded)
        }
    }
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<F: Future>(
    fut: F,
    cancel: &CancellationToken,
) -> Result<F::Output, TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        out = fut => Ok(out),
    }
}
