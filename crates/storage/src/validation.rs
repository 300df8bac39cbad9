use crate::{MAX_FILENAME_LEN, StorageError};

/// Validates that `name` is a bare filename that stays inside the storage
/// root.
///
/// Rejects:
/// - Empty names and names longer than [`MAX_FILENAME_LEN`]
/// - `.` and `..`
/// - Any `/` or `\` separator (no relative paths, no absolute paths)
/// - NUL bytes
/// - Names starting with `.` (reserved for the staging directory)
/// - Windows drive prefixes (`C:`)
pub fn validate_filename(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::InvalidName("empty filename".into()));
    }

    if name.len() > MAX_FILENAME_LEN {
        return Err(StorageError::InvalidName(format!(
            "filename too long: {} bytes (max {MAX_FILENAME_LEN})",
            name.len()
        )));
    }

    if name.contains(['/', '\\']) {
        return Err(StorageError::InvalidName(format!(
            "path separators not allowed: {name}"
        )));
    }

    if name.contains('\0') {
        return Err(StorageError::InvalidName("NUL byte in filename".into()));
    }

    if name.starts_with('.') {
        return Err(StorageError::InvalidName(format!(
            "names starting with '.' are reserved: {name}"
        )));
    }

    if name.len() >= 2 && name.as_bytes()[1] == b':' {
        return Err(StorageError::InvalidName(format!(
            "drive prefix not allowed: {name}"
        )));
    }

    Ok(())
}
