use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, BufWriter};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::record::FileRecord;
use crate::staged::StagedFile;
use crate::validation::validate_filename;
use crate::{STAGING_DIR, StorageError};

/// Buffer size for staged upload writes.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// File storage rooted at one directory.
///
/// The lock guards the directory tree, not file contents: it is held while
/// entries are created, renamed, enumerated or opened, and released before
/// bulk data moves.
pub struct DiskStorage {
    root: PathBuf,
    lock: RwLock<()>,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding in-progress and abandoned uploads.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Creates the storage root (and its parents) if missing.
    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Maps a bare filename to its path under the root.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, StorageError> {
        validate_filename(filename)?;
        Ok(self.root.join(filename))
    }

    /// Returns `true` if `filename` is currently published.
    pub async fn contains(&self, filename: &str) -> Result<bool, StorageError> {
        let path = self.resolve(filename)?;
        let _guard = self.lock.read().await;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Starts a new upload of `filename`.
    ///
    /// Fails with [`StorageError::AlreadyExists`] if the name is already
    /// published. Creates the root and staging directories as needed.
    pub async fn create(&self, filename: &str) -> Result<StagedFile, StorageError> {
        let target = self.resolve(filename)?;

        let _guard = self.lock.write().await;
        if tokio::fs::try_exists(&target).await? {
            return Err(StorageError::AlreadyExists(filename.to_string()));
        }

        let staging_dir = self.staging_dir();
        tokio::fs::create_dir_all(&staging_dir).await?;

        let staging_path = staging_dir.join(format!(
            "{filename}.{}.part",
            uuid::Uuid::new_v4().simple()
        ));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging_path)
            .await?;

        debug!(
            filename,
            staging = %staging_path.display(),
            "staging file created"
        );

        Ok(StagedFile {
            filename: filename.to_string(),
            staging_path,
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            written: 0,
        })
    }

    /// Publishes a staged upload under its final name.
    ///
    /// Fails with [`StorageError::AlreadyExists`] if another upload published
    /// the same name in the meantime; the staging file is then left behind.
    /// Returns the number of bytes published.
    pub async fn commit(&self, mut staged: StagedFile) -> Result<u64, StorageError> {
        staged.finish().await?;
        let StagedFile {
            filename,
            staging_path,
            writer,
            written,
        } = staged;
        drop(writer);

        let target = self.resolve(&filename)?;

        let _guard = self.lock.write().await;
        if tokio::fs::try_exists(&target).await? {
            return Err(StorageError::AlreadyExists(filename));
        }
        tokio::fs::rename(&staging_path, &target).await?;

        info!(filename, size = written, "file stored");
        Ok(written)
    }

    /// Stores the whole of `reader` under `filename`.
    ///
    /// Data is stream-copied, never buffered in full. Returns the number of
    /// bytes written.
    pub async fn save<R>(&self, filename: &str, reader: &mut R) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut staged = self.create(filename).await?;
        staged.written = tokio::io::copy(reader, &mut staged.writer).await?;
        self.commit(staged).await
    }

    /// Enumerates every published regular file under the root.
    ///
    /// The walk is recursive and visits entries in lexical order per
    /// directory. The staging directory is skipped. A missing root yields
    /// an empty list.
    pub async fn list(&self) -> Result<Vec<FileRecord>, StorageError> {
        let _guard = self.lock.read().await;
        let root = self.root.clone();
        let records = tokio::task::spawn_blocking(move || walk_root(&root))
            .await
            .map_err(std::io::Error::other)??;
        debug!(count = records.len(), "storage listed");
        Ok(records)
    }

    /// Opens a published file for sequential reading.
    pub async fn open(&self, filename: &str) -> Result<tokio::fs::File, StorageError> {
        let path = self.resolve(filename)?;

        let _guard = self.lock.read().await;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(filename.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !file.metadata().await?.is_file() {
            return Err(StorageError::NotFound(filename.to_string()));
        }
        Ok(file)
    }
}

fn walk_root(root: &Path) -> std::io::Result<Vec<FileRecord>> {
    let mut records = Vec::new();
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => walk_dir(root, true, &mut records)?,
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(records)
}

fn walk_dir(dir: &Path, is_root: bool, out: &mut Vec<FileRecord>) -> std::io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        // Entries removed since read_dir are skipped.
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        if meta.is_dir() {
            if is_root && entry.file_name() == STAGING_DIR {
                continue;
            }
            walk_dir(&entry.path(), false, out)?;
        } else if meta.is_file() {
            out.push(FileRecord::from_metadata(entry.path(), &meta)?);
        }
    }
    Ok(())
}
