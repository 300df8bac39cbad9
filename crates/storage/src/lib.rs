//! Directory-backed persistence for transferred files.
//!
//! One [`DiskStorage`] owns one storage root and a read/write lock over it.
//! Directory mutations (creating a staging file, publishing it under its
//! final name) take the write side; listing and opening take the read side.
//!
//! Uploads are written to a staging file under [`STAGING_DIR`] and renamed
//! into place when complete, so readers never see a half-written file.

mod disk;
mod record;
mod staged;
mod validation;

pub use disk::DiskStorage;
pub use record::{FileRecord, TimeSource};
pub use staged::StagedFile;
pub use validation::validate_filename;

/// Directory under the storage root holding in-progress uploads.
///
/// Failed uploads leave their staging file here for inspection.
pub const STAGING_DIR: &str = ".staging";

/// Longest accepted filename, in bytes. Leaves room for the staging
/// suffix within common 255-byte name limits.
pub const MAX_FILENAME_LEN: usize = 200;

/// Errors produced by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid filename: {0}")]
    InvalidName(String),
}
