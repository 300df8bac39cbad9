//! Admission control for transfer operations.
//!
//! Each operation class (upload, download, list) has its own capacity and
//! its own count of admitted operations. Callers wait for a free slot
//! without spinning and give up when their cancellation token fires.
//! A slot is held by an [`AdmissionPermit`] and returned when the permit
//! drops, so every exit path of an operation releases it exactly once.

mod controller;
mod gate;

pub use controller::{AdmissionController, AdmissionPermit};

/// Default number of concurrent uploads.
pub const DEFAULT_UPLOAD_CAPACITY: usize = 10;

/// Default number of concurrent downloads.
pub const DEFAULT_DOWNLOAD_CAPACITY: usize = 10;

/// Default number of concurrent list calls.
pub const DEFAULT_LIST_CAPACITY: usize = 100;

/// Operation class with an independent capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Upload,
    Download,
    List,
}

impl OperationClass {
    pub const ALL: [OperationClass; 3] = [
        OperationClass::Upload,
        OperationClass::Download,
        OperationClass::List,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Upload => "upload",
            OperationClass::Download => "download",
            OperationClass::List => "list",
        }
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-class capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub upload: usize,
    pub download: usize,
    pub list: usize,
}

impl AdmissionLimits {
    pub fn capacity(&self, class: OperationClass) -> usize {
        match class {
            OperationClass::Upload => self.upload,
            OperationClass::Download => self.download,
            OperationClass::List => self.list,
        }
    }
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            upload: DEFAULT_UPLOAD_CAPACITY,
            download: DEFAULT_DOWNLOAD_CAPACITY,
            list: DEFAULT_LIST_CAPACITY,
        }
    }
}

/// Errors produced by the admission controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// The class was at capacity and the caller stopped waiting.
    #[error("{0} limit reached")]
    Exhausted(OperationClass),

    /// More releases than acquisitions for the class.
    #[error("release called more times than acquire ({0})")]
    UnbalancedRelease(OperationClass),
}
