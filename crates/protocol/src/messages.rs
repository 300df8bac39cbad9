use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Call setup
// ---------------------------------------------------------------------------

/// RPC method selected by the first frame of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    UploadFile,
    DownloadFile,
    ListFiles,
}

impl Method {
    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::UploadFile => "upload_file",
            Method::DownloadFile => "download_file",
            Method::ListFiles => "list_files",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallHeader {
    pub method: Method,
    /// Client deadline in milliseconds, measured from when the server reads
    /// this header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CallHeader {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            timeout_ms: None,
        }
    }

    /// Attaches a client deadline.
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    /// Client deadline, if any.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// UploadFile
// ---------------------------------------------------------------------------

/// First message of an upload: names the target file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadFileInfo {
    /// Bare target filename.
    Filename(String),
    /// Client-side path; only its base name is used.
    ImagePath(String),
}

impl UploadFileInfo {
    /// Returns the name the file is stored under.
    ///
    /// For [`UploadFileInfo::ImagePath`] this is the last path component,
    /// treating both `/` and `\` as separators. Returns `None` when nothing
    /// usable remains.
    pub fn target_name(&self) -> Option<&str> {
        let raw = match self {
            UploadFileInfo::Filename(name) => name.as_str(),
            UploadFileInfo::ImagePath(path) => path
                .trim_end_matches(['/', '\\'])
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or_default(),
        };
        if raw.is_empty() { None } else { Some(raw) }
    }
}

/// Final acknowledgement of an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFileResponse {
    pub message: String,
    /// Total bytes written.
    pub size: u64,
}

impl UploadFileResponse {
    pub fn new(size: u64) -> Self {
        Self {
            message: format!("File uploaded successfully. Size: {size} bytes"),
            size,
        }
    }
}

// ---------------------------------------------------------------------------
// DownloadFile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadFileRequest {
    pub filename: String,
}

// ---------------------------------------------------------------------------
// ListFiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListFilesRequest {}

/// One stored file as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    /// RFC 3339 timestamp.
    pub created_at: String,
    /// RFC 3339 timestamp.
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListFilesResponse {
    #[serde(default)]
    pub files: Vec<FileInfo>,
}
