use tokio_util::sync::CancellationToken;

use filedepot_protocol::FileInfo;
use filedepot_storage::{DiskStorage, FileRecord};

use crate::TransferError;
use crate::deadline::cancellable;

/// Lists stored files in storage enumeration order.
pub async fn list_files(
    storage: &DiskStorage,
    cancel: &CancellationToken,
) -> Result<Vec<FileInfo>, TransferError> {
    let records = cancellable(storage.list(), cancel).await??;
    Ok(records.iter().map(file_info).collect())
}

/// Renders a storage record for clients.
pub fn file_info(record: &FileRecord) -> FileInfo {
    FileInfo {
        filename: record.filename.clone(),
        created_at: record.created_at_rfc3339(),
        updated_at: record.updated_at_rfc3339(),
    }
}
