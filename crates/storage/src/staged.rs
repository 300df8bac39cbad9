use std::path::{Path, PathBuf};

use tokio::io::{AsyncWriteExt, BufWriter};

/// An upload being written under the staging directory.
///
/// Invisible to listing and download until handed to
/// [`DiskStorage::commit`](crate::DiskStorage::commit). Dropping it without
/// committing leaves the staging file on disk.
pub struct StagedFile {
    pub(crate) filename: String,
    pub(crate) staging_path: PathBuf,
    pub(crate) writer: BufWriter<tokio::fs::File>,
    pub(crate) written: u64,
}

impl StagedFile {
    /// Appends `chunk` to the file.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Target filename the upload will be published under.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Location of the in-progress file.
    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Pushes buffered data to the staging file.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }

    /// Flushes buffered data and syncs the file to disk.
    pub(crate) async fn finish(&mut self) -> std::io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;
        Ok(())
    }
}

impl std::fmt::Debug for StagedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedFile")
            .field("filename", &self.filename)
            .field("staging_path", &self.staging_path)
            .field("written", &self.written)
            .finish()
    }
}
