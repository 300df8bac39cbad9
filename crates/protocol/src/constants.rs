//! Protocol-wide defaults shared by the server and the client.

/// Default server port.
pub const DEFAULT_PORT: u16 = 50051;

/// Default listen address of the server.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:50051";

/// Default storage root directory.
pub const DEFAULT_STORAGE_DIR: &str = "./files_storage";

/// File extensions accepted for download (lowercase, without the dot).
pub const SUPPORTED_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp"];

/// Returns `true` if `filename` ends in one of [`SUPPORTED_IMAGE_EXTENSIONS`].
///
/// The comparison is case-insensitive. Names without an extension are
/// rejected.
pub fn is_supported_image(filename: &str) -> bool {
    std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
