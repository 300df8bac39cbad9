//! Error types for the transport.

use filedepot_protocol::Status;
use filedepot_storage::StorageError;

/// Errors produced by the transport, server and client.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The call finished with a non-OK status.
    #[error("{0}")]
    Status(#[from] Status),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

impl RpcError {
    /// The remote status, if the server answered with one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            RpcError::Status(status) => Some(status),
            _ => None,
        }
    }
}
