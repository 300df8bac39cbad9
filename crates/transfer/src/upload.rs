use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use filedepot_protocol::UploadFileInfo;
use filedepot_storage::{DiskStorage, StagedFile};

use crate::deadline::bounded;
use crate::{TransferError, UPLOAD_QUEUE_CAPACITY};

/// One inbound upload message, as decoded by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadMessage {
    /// Names the target file. Must be the first message and only the first.
    Info(UploadFileInfo),
    /// Raw file bytes, in file order.
    Chunk(Vec<u8>),
}

/// Lifecycle of one upload call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    AwaitingFirstMessage,
    Receiving,
    Finalizing,
    Completed,
    Failed,
}

/// Tuning for [`receive_upload`].
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Chunks buffered between receiver and writer before the receiver
    /// blocks.
    pub queue_capacity: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            queue_capacity: UPLOAD_QUEUE_CAPACITY,
        }
    }
}

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub filename: String,
    pub bytes_written: u64,
}

/// Per-call state. Created fresh for every upload, never shared.
struct UploadSession {
    state: UploadState,
    filename: Option<String>,
}

impl UploadSession {
    fn new() -> Self {
        Self {
            state: UploadState::AwaitingFirstMessage,
            filename: None,
        }
    }

    fn advance(&mut self, next: UploadState) {
        trace!(from = ?self.state, to = ?next, filename = ?self.filename, "upload state");
        self.state = next;
    }
}

/// Receives an upload from `stream` and stores it.
///
/// The first message must be [`UploadMessage::Info`]; every following one a
/// chunk. The stream's end (`None`) is the only clean termination, and an
/// upload that carried no bytes fails with [`TransferError::InvalidInput`].
/// Stream items that are errors become the call's terminal error.
///
/// The whole call is bounded by `deadline` and by `cancel`. On failure the
/// partially written staging file is left on disk. The receiver task is
/// always joined before this returns.
pub async fn receive_upload<S, E>(
    storage: &DiskStorage,
    stream: S,
    options: &UploadOptions,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<UploadOutcome, TransferError>
where
    S: Stream<Item = Result<UploadMessage, E>> + Send + Unpin + 'static,
    E: Into<TransferError> + Send + 'static,
{
    let mut session = UploadSession::new();
    let result = run_upload(storage, stream, options, deadline, cancel, &mut session).await;

    match &result {
        Ok(outcome) => {
            session.advance(UploadState::Completed);
            info!(
                filename = %outcome.filename,
                size = outcome.bytes_written,
                "upload completed"
            );
        }
        Err(e) => {
            session.advance(UploadState::Failed);
            warn!(filename = ?session.filename, "upload failed: {e}");
        }
    }
    result
}

async fn run_upload<S, E>(
    storage: &DiskStorage,
    mut stream: S,
    options: &UploadOptions,
    deadline: Instant,
    cancel: &CancellationToken,
    session: &mut UploadSession,
) -> Result<UploadOutcome, TransferError>
where
    S: Stream<Item = Result<UploadMessage, E>> + Send + Unpin + 'static,
    E: Into<TransferError> + Send + 'static,
{
    let info = match bounded(stream.next(), cancel, deadline).await? {
        Some(Ok(UploadMessage::Info(info))) => info,
        Some(Ok(UploadMessage::Chunk(_))) => {
            return Err(TransferError::InvalidInput(
                "first message must carry the file name".into(),
            ));
        }
        Some(Err(e)) => return Err(e.into()),
        None => {
            return Err(TransferError::InvalidInput("no file data received".into()));
        }
    };

    let filename = info
        .target_name()
        .ok_or_else(|| TransferError::InvalidInput("empty file name".into()))?
        .to_string();
    session.filename = Some(filename.clone());

    let mut staged = bounded(storage.create(&filename), cancel, deadline).await??;
    session.advance(UploadState::Receiving);

    let receiver_cancel = cancel.child_token();
    let (data_tx, data_rx) = mpsc::channel(options.queue_capacity.max(1));
    let (err_tx, err_rx) = oneshot::channel();
    let receiver = tokio::spawn(receive_chunks(
        stream,
        data_tx,
        err_tx,
        receiver_cancel.clone(),
    ));

    let written = write_chunks(&mut staged, data_rx, err_rx, cancel, deadline).await;

    // Stop the receiver on every path and wait for it.
    receiver_cancel.cancel();
    if let Err(e) = receiver.await {
        warn!("upload receiver task failed: {e}");
    }

    if let Err(e) = written {
        if let Err(flush_err) = staged.flush().await {
            warn!("failed to flush staged upload: {flush_err}");
        }
        return Err(e);
    }

    if staged.bytes_written() == 0 {
        return Err(TransferError::InvalidInput("no file data received".into()));
    }

    session.advance(UploadState::Finalizing);
    let bytes_written = bounded(storage.commit(staged), cancel, deadline).await??;

    Ok(UploadOutcome {
        filename,
        bytes_written,
    })
}

/// Pulls chunks off `stream` onto the queue until the stream ends, fails,
/// or `cancel` fires.
///
/// Stream failures go to `err_tx`, never just a closed queue.
async fn receive_chunks<S, E>(
    mut stream: S,
    data_tx: mpsc::Sender<Vec<u8>>,
    err_tx: oneshot::Sender<TransferError>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<UploadMessage, E>> + Unpin,
    E: Into<TransferError>,
{
    let mut received: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            debug!(received, "upload receiver stopped");
            return;
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(received, "upload receiver stopped");
                return;
            }
            next = stream.next() => next,
        };

        let chunk = match next {
            Some(Ok(UploadMessage::Chunk(chunk))) => chunk,
            Some(Ok(UploadMessage::Info(_))) => {
                let _ = err_tx.send(TransferError::InvalidInput(
                    "file name sent more than once".into(),
                ));
                return;
            }
            Some(Err(e)) => {
                let e = e.into();
                warn!("error receiving upload chunk: {e}");
                let _ = err_tx.send(e);
                return;
            }
            None => {
                debug!(received, "upload stream ended");
                return;
            }
        };

        received += chunk.len() as u64;
        trace!(size = chunk.len(), received, "chunk received");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(received, "upload receiver stopped");
                return;
            }
            sent = data_tx.send(chunk) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Drains the queue into `staged` until it closes.
///
/// The error channel is polled alongside the queue so a receiver failure
/// surfaces even while chunks are still pending.
async fn write_chunks(
    staged: &mut StagedFile,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    mut err_rx: oneshot::Receiver<TransferError>,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<(), TransferError> {
    let mut err_open = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(TransferError::DeadlineExceeded),
            res = &mut err_rx, if err_open => match res {
                Ok(e) => return Err(e),
                Err(_) => err_open = false,
            },
            chunk = data_rx.recv() => match chunk {
                Some(chunk) => {
                    bounded(staged.write_chunk(&chunk), cancel, deadline).await??;
                    trace!(
                        size = chunk.len(),
                        total = staged.bytes_written(),
                        "chunk written"
                    );
                }
                None => {
                    // The receiver reports its error before closing the queue.
                    if err_open {
                        if let Ok(e) = err_rx.try_recv() {
                            return Err(e);
                        }
                    }
                    return Ok(());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;

    use super::*;

    type Item = Result<UploadMessage, TransferError>;

    fn info(name: &str) -> Item {
        Ok(UploadMessage::Info(UploadFileInfo::Filename(name.into())))
    }

    fn chunk(data: &[u8]) -> Item {
        Ok(UploadMessage::Chunk(data.to_vec()))
    }

    fn storage() -> (tempfile::TempDir, DiskStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path().join("store"));
        (dir, storage)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    /// A stream fed by the test through an mpsc channel.
    fn channel_stream(
        rx: mpsc::Receiver<Item>,
    ) -> impl Stream<Item = Item> + Send + Unpin + 'static {
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    async fn upload(storage: &DiskStorage, items: Vec<Item>) -> Result<UploadOutcome, TransferError> {
        receive_upload(
            storage,
            stream::iter(items),
            &UploadOptions::default(),
            far_deadline(),
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn stores_chunks_in_order() {
        let (_dir, storage) = storage();
        let outcome = upload(
            &storage,
            vec![info("a.png"), chunk(b"hello "), chunk(b"world")],
        )
        .await
        .unwrap();

        assert_eq!(outcome.filename, "a.png");
        assert_eq!(outcome.bytes_written, 11);
        let content = std::fs::read(storage.root().join("a.png")).unwrap();
        assert_eq!(content, b"hello world");
    }

    #[tokio::test]
    async fn many_chunks_through_a_small_queue_keep_order() {
        let (_dir, storage) = storage();
        let mut items = vec![info("big.bmp")];
        let mut expected = Vec::new();
        for i in 0..500u32 {
            let data = i.to_be_bytes().repeat(3);
            expected.extend_from_slice(&data);
            items.push(chunk(&data));
        }

        let options = UploadOptions { queue_capacity: 2 };
        let outcome = receive_upload(
            &storage,
            stream::iter(items),
            &options,
            far_deadline(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.bytes_written, expected.len() as u64);
        assert_eq!(std::fs::read(storage.root().join("big.bmp")).unwrap(), expected);
    }

    #[tokio::test]
    async fn image_path_uses_base_name() {
        let (_dir, storage) = storage();
        let items = vec![
            Ok(UploadMessage::Info(UploadFileInfo::ImagePath(
                "./files/ruru.bmp".into(),
            ))),
            chunk(b"BM"),
        ];
        let outcome = upload(&storage, items).await.unwrap();
        assert_eq!(outcome.filename, "ruru.bmp");
        assert!(storage.root().join("ruru.bmp").is_file());
    }

    #[tokio::test]
    async fn zero_bytes_is_invalid() {
        let (_dir, storage) = storage();
        let err = upload(&storage, vec![info("empty.png")]).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(ref m) if m == "no file data received"));
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_chunks_only_is_invalid() {
        let (_dir, storage) = storage();
        let err = upload(&storage, vec![info("empty.png"), chunk(b""), chunk(b"")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(_)));
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_stream_is_invalid() {
        let (_dir, storage) = storage();
        let err = upload(&storage, vec![]).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn first_message_must_name_the_file() {
        let (_dir, storage) = storage();
        let err = upload(&storage, vec![chunk(b"data")]).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn second_info_message_is_invalid() {
        let (_dir, storage) = storage();
        let err = upload(&storage, vec![info("a.png"), chunk(b"x"), info("b.png")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(_)));
        assert!(!storage.root().join("a.png").exists());
    }

    #[tokio::test]
    async fn traversal_name_is_invalid() {
        let (_dir, storage) = storage();
        let err = upload(&storage, vec![info("../evil.png"), chunk(b"x")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn existing_file_is_not_overwritten() {
        let (_dir, storage) = storage();
        storage.save("cat.png", &mut &b"first upload"[..]).await.unwrap();

        let err = upload(&storage, vec![info("cat.png"), chunk(b"new")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::AlreadyExists(ref n) if n == "cat.png"));
        assert_eq!(
            std::fs::read(storage.root().join("cat.png")).unwrap(),
            b"first upload"
        );
    }

    #[tokio::test]
    async fn stream_error_after_chunks_is_reported() {
        let (_dir, storage) = storage();
        let items = vec![
            info("broken.png"),
            chunk(b"part one"),
            chunk(b"part two"),
            Err(TransferError::Stream("connection reset".into())),
        ];
        let options = UploadOptions { queue_capacity: 1 };
        let err = receive_upload(
            &storage,
            stream::iter(items),
            &options,
            far_deadline(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::Stream(ref m) if m == "connection reset"));
        assert!(!storage.root().join("broken.png").exists());
    }

    #[tokio::test]
    async fn deadline_stops_receiver() {
        let (_dir, storage) = storage();
        let (tx, rx) = mpsc::channel(8);
        tx.send(info("slow.png")).await.unwrap();
        tx.send(chunk(b"first")).await.unwrap();

        let started = std::time::Instant::now();
        let err = receive_upload(
            &storage,
            channel_stream(rx),
            &UploadOptions::default(),
            Instant::now() + Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(2));
        // The receiver task dropped the stream before we returned.
        assert!(tx.is_closed());
        // The partial upload stays in staging.
        let staged: Vec<_> = std::fs::read_dir(storage.staging_dir())
            .unwrap()
            .collect();
        assert_eq!(staged.len(), 1);
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deadline_while_waiting_for_first_message() {
        let (_dir, storage) = storage();
        let (tx, rx) = mpsc::channel::<Item>(1);

        let err = receive_upload(
            &storage,
            channel_stream(rx),
            &UploadOptions::default(),
            Instant::now() + Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::DeadlineExceeded));
        drop(tx);
    }

    #[tokio::test]
    async fn external_cancel_unwinds() {
        let (_dir, storage) = storage();
        let (tx, rx) = mpsc::channel(8);
        tx.send(info("cancel.png")).await.unwrap();
        tx.send(chunk(b"data")).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = receive_upload(
            &storage,
            channel_stream(rx),
            &UploadOptions::default(),
            far_deadline(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn full_queue_stops_pulling_from_the_stream() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let pulled = Arc::new(AtomicUsize::new(0));
        let counted = {
            let pulled = Arc::clone(&pulled);
            stream::iter(0..).map(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TransferError>(UploadMessage::Chunk(vec![0; 8]))
            })
        };

        let (data_tx, mut data_rx) = mpsc::channel(1);
        let (err_tx, _err_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let receiver = tokio::spawn(receive_chunks(counted, data_tx, err_tx, cancel.clone()));

        // One chunk queued, one held in the blocked send.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 2);

        assert_eq!(data_rx.recv().await, Some(vec![0; 8]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 3);

        cancel.cancel();
        receiver.await.unwrap();
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
    }
}
