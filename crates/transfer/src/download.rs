use std::fmt::Display;

use futures_util::{Sink, SinkExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use filedepot_protocol::is_supported_image;
use filedepot_storage::DiskStorage;

use crate::TransferError;
use crate::deadline::cancellable;

/// Streams a stored file into `sink` as chunks of `chunk_size` bytes.
///
/// Only image files (see [`is_supported_image`]) are served. Every chunk
/// except the last is exactly `chunk_size` bytes, and each one is sent
/// before the next read starts. The first read or send error aborts the
/// stream. Returns the number of bytes sent.
pub async fn send_download<S>(
    storage: &DiskStorage,
    filename: &str,
    sink: &mut S,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, TransferError>
where
    S: Sink<Vec<u8>> + Unpin,
    S::Error: Display,
{
    if !is_supported_image(filename) {
        return Err(TransferError::InvalidInput(format!(
            "not an image: {filename}"
        )));
    }

    let mut file = cancellable(storage.open(filename), cancel).await??;
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent: u64 = 0;

    loop {
        let n = cancellable(read_full(&mut file, &mut buf), cancel).await??;
        if n == 0 {
            break;
        }

        cancellable(sink.send(buf[..n].to_vec()), cancel)
            .await?
            .map_err(|e| TransferError::Stream(format!("failed to send chunk: {e}")))?;
        sent += n as u64;
    }

    debug!(filename, size = sent, "download sent");
    Ok(sent)
}

/// Reads until `buf` is full or the reader reaches EOF.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures_util::sink;
    use tokio::sync::mpsc;

    use super::*;
    use crate::DOWNLOAD_CHUNK_SIZE;

    fn storage() -> (tempfile::TempDir, DiskStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path().to_path_buf());
        (dir, storage)
    }

    async fn collect(
        storage: &DiskStorage,
        filename: &str,
        chunk_size: usize,
    ) -> Result<Vec<Vec<u8>>, TransferError> {
        let mut chunks = Vec::new();
        {
            let sink = sink::unfold(&mut chunks, |acc, chunk: Vec<u8>| async move {
                acc.push(chunk);
                Ok::<_, Infallible>(acc)
            });
            let mut sink = std::pin::pin!(sink);
            let cancel = CancellationToken::new();
            send_download(storage, filename, &mut sink, chunk_size, &cancel).await?;
        }
        Ok(chunks)
    }

    #[tokio::test]
    async fn splits_into_fixed_chunks() {
        let (_dir, storage) = storage();
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        storage.save("pic.png", &mut &data[..]).await.unwrap();

        let chunks = collect(&storage, "pic.png", DOWNLOAD_CHUNK_SIZE).await.unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1024, 1024, 452]);
        assert_eq!(chunks.concat(), data);
    }

    #[tokio::test]
    async fn exact_multiple_has_no_empty_tail() {
        let (_dir, storage) = storage();
        storage.save("pic.gif", &mut &[9u8; 2048][..]).await.unwrap();

        let chunks = collect(&storage, "pic.gif", DOWNLOAD_CHUNK_SIZE).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 1024));
    }

    #[tokio::test]
    async fn rejects_unsupported_type() {
        let (_dir, storage) = storage();
        storage.save("notes.txt", &mut &b"text"[..]).await.unwrap();

        let err = collect(&storage, "notes.txt", DOWNLOAD_CHUNK_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_dir, storage) = storage();
        let err = collect(&storage, "ghost.jpg", DOWNLOAD_CHUNK_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_dir, storage) = storage();
        let err = collect(&storage, "../outside.png", DOWNLOAD_CHUNK_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn send_failure_aborts() {
        let (_dir, storage) = storage();
        storage.save("pic.bmp", &mut &[1u8; 4096][..]).await.unwrap();

        let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
        drop(rx);
        let sink = sink::unfold(tx, |tx, chunk: Vec<u8>| async move {
            tx.send(chunk).await.map_err(|_| "receiver gone")?;
            Ok::<_, &'static str>(tx)
        });
        let mut sink = std::pin::pin!(sink);

        let err = send_download(
            &storage,
            "pic.bmp",
            &mut sink,
            DOWNLOAD_CHUNK_SIZE,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Stream(ref m) if m.contains("receiver gone")));
    }

    #[tokio::test]
    async fn cancelled_download_stops() {
        let (_dir, storage) = storage();
        storage.save("pic.jpg", &mut &[1u8; 4096][..]).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = std::pin::pin!(sink::drain::<Vec<u8>>());
        let err = send_download(&storage, "pic.jpg", &mut sink, DOWNLOAD_CHUNK_SIZE, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
