use std::fs::Metadata;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};

/// Where a record's `created_at` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    /// True creation (birth) time reported by the filesystem.
    Birth,
    /// The platform does not expose a birth time; modification time is
    /// used instead. This loses precision, it is not an error.
    Modified,
}

/// Snapshot of one stored file, derived from filesystem metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Base name of the file; the primary key within a storage root.
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Full path on disk.
    pub path: PathBuf,
    /// Lowercased extension, if any.
    pub filetype: Option<String>,
    /// Size in bytes at listing time.
    pub size: u64,
    pub created_source: TimeSource,
}

impl FileRecord {
    /// Builds a record from a regular file's metadata.
    pub(crate) fn from_metadata(path: PathBuf, meta: &Metadata) -> std::io::Result<Self> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let filetype = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());

        let modified = meta.modified()?;
        let (created, created_source) = creation_time(meta, modified);

        Ok(Self {
            filename,
            created_at: DateTime::<Utc>::from(created),
            updated_at: DateTime::<Utc>::from(modified),
            path,
            filetype,
            size: meta.len(),
            created_source,
        })
    }

    /// `created_at` as an RFC 3339 string (second precision, UTC).
    pub fn created_at_rfc3339(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// `updated_at` as an RFC 3339 string (second precision, UTC).
    pub fn updated_at_rfc3339(&self) -> String {
        self.updated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Birth time when the platform reports one, modification time otherwise.
fn creation_time(meta: &Metadata, modified: SystemTime) -> (SystemTime, TimeSource) {
    match meta.created() {
        Ok(created) => (created, TimeSource::Birth),
        Err(_) => (modified, TimeSource::Modified),
    }
}
