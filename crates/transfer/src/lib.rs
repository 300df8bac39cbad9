//! Streaming transfer pipelines.
//!
//! Moves bytes between a network-facing [`Stream`](futures_util::Stream) or
//! [`Sink`](futures_util::Sink) and [`DiskStorage`](filedepot_storage::DiskStorage):
//!
//! - [`receive_upload`]: a receiver task feeds a bounded queue drained by a
//!   writer loop, so network receipt and disk writes run at their own pace.
//! - [`send_download`]: sequential fixed-size reads, each chunk sent before
//!   the next read.
//! - [`list_files`]: storage enumeration rendered for clients.

mod deadline;
mod download;
mod listing;
mod upload;

use std::time::Duration;

use filedepot_protocol::{Code, Status};
use filedepot_storage::StorageError;

pub use download::send_download;
pub use listing::{file_info, list_files};
pub use upload::{UploadMessage, UploadOptions, UploadOutcome, UploadState, receive_upload};

/// Download chunk size: 1 KiB.
pub const DOWNLOAD_CHUNK_SIZE: usize = 1024;

/// Number of chunks buffered between the upload receiver and writer.
pub const UPLOAD_QUEUE_CAPACITY: usize = 100;

/// Deadline for a whole upload call, including the admission wait.
pub const UPLOAD_DEADLINE: Duration = Duration::from_secs(30);

/// Errors produced by the transfer pipelines.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer-facing stream failed (receive or send).
    #[error("stream error: {0}")]
    Stream(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Status code reported to the caller.
    pub fn code(&self) -> Code {
        match self {
            TransferError::AlreadyExists(_) => Code::AlreadyExists,
            TransferError::NotFound(_) => Code::NotFound,
            TransferError::InvalidInput(_) => Code::InvalidArgument,
            TransferError::Io(_) | TransferError::Stream(_) => Code::Internal,
            TransferError::DeadlineExceeded => Code::DeadlineExceeded,
            TransferError::Cancelled => Code::Cancelled,
        }
    }
}

impl From<StorageError> for TransferError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(e) => TransferError::Io(e),
            StorageError::AlreadyExists(name) => TransferError::AlreadyExists(name),
            StorageError::NotFound(name) => TransferError::NotFound(name),
            StorageError::InvalidName(msg) => TransferError::InvalidInput(msg),
        }
    }
}

impl From<TransferError> for Status {
    fn from(e: TransferError) -> Self {
        Status::new(e.code(), e.to_string())
    }
}
