//! TCP call server.
//!
//! Accepts connections, reads one CALL frame per connection and dispatches it
//! to a [`FileService`]. Each call runs on its own task, tracked so that
//! shutdown can wait for in-flight calls.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, Stream, stream};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use filedepot_admission::{AdmissionController, AdmissionLimits};
use filedepot_protocol::{
    CallHeader, DEFAULT_PORT, DEFAULT_STORAGE_DIR, DownloadFileRequest, ListFilesRequest, Method,
    Status, UploadFileInfo,
};
use filedepot_storage::DiskStorage;
use filedepot_transfer::{TransferError, UploadMessage};

use crate::error::RpcError;
use crate::service::{FileService, ServiceOptions};
use crate::wire::{Frame, parse_message, read_frame, write_frame};
use crate::{CALL_HEADER_TIMEOUT, DRAIN_TIMEOUT, IO_BUFFER_SIZE, SHUTDOWN_GRACE};

type CallReader = BufReader<OwnedReadHalf>;
type CallWriter = BufWriter<OwnedWriteHalf>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub storage_dir: PathBuf,
    pub limits: AdmissionLimits,
    pub service: ServiceOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            limits: AdmissionLimits::default(),
            service: ServiceOptions::default(),
        }
    }
}

/// The file server.
pub struct FileServer {
    listen_addr: SocketAddr,
    service: Arc<FileService>,
    /// Stops the accept loop.
    cancel: CancellationToken,
    /// Parent of every call's token; fired when the shutdown grace expires.
    calls: CancellationToken,
    tracker: TaskTracker,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl FileServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let storage = Arc::new(DiskStorage::new(config.storage_dir));
        let admission = AdmissionController::new(config.limits);
        let service = FileService::new(storage, admission, config.service);
        Arc::new(Self {
            listen_addr: config.listen_addr,
            service: Arc::new(service),
            cancel: CancellationToken::new(),
            calls: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn service(&self) -> &Arc<FileService> {
        &self.service
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Stops accepting calls. [`run`](Self::run) returns once in-flight
    /// calls have finished.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), RpcError> {
        self.service.storage().ensure_root().await?;

        let listener = TcpListener::bind(self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!(
            storage = %self.service.storage().root().display(),
            "file server listening on {local_addr}"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            self.tracker.spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
            }
        }

        drop(listener);
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(calls = self.tracker.len(), "waiting for in-flight calls");
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                calls = self.tracker.len(),
                "in-flight calls did not finish in time, cancelling"
            );
            self.calls.cancel();
            self.tracker.wait().await;
        }
        info!("server stopped");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), RpcError> {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, reader);
        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, writer);

        let header = match tokio::time::timeout(CALL_HEADER_TIMEOUT, read_frame(&mut reader)).await
        {
            Ok(Ok(Some(Frame::Call(header)))) => header,
            Ok(Ok(Some(other))) => {
                let status =
                    Status::invalid_argument(format!("expected call frame, got {}", other.kind()));
                write_frame(&mut writer, &Frame::Status(status)).await?;
                writer.flush().await?;
                return Err(RpcError::Protocol("connection did not open with a call".into()));
            }
            Ok(Ok(None)) => {
                debug!(%peer_addr, "connection closed before call");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RpcError::Timeout),
        };

        let method = header.method;
        debug!(%peer_addr, %method, timeout_ms = ?header.timeout_ms, "call started");

        let cancel = self.calls.child_token();
        let status = match method {
            Method::UploadFile => self.serve_upload(reader, &mut writer, &header, &cancel).await?,
            Method::DownloadFile => {
                let call = self.serve_download(&mut reader, &mut writer, &cancel);
                match with_deadline(header.timeout(), call).await {
                    Some(result) => result?,
                    None => deadline_expired(&mut writer).await?,
                }
            }
            Method::ListFiles => {
                let call = self.serve_list(&mut reader, &mut writer, &cancel);
                match with_deadline(header.timeout(), call).await {
                    Some(result) => result?,
                    None => deadline_expired(&mut writer).await?,
                }
            }
        };

        if status.is_ok() {
            info!(%peer_addr, %method, "call completed");
        } else {
            warn!(%peer_addr, %method, code = %status.code, "call failed: {}", status.message);
        }
        Ok(())
    }

    async fn serve_upload(
        &self,
        reader: CallReader,
        writer: &mut CallWriter,
        header: &CallHeader,
        cancel: &CancellationToken,
    ) -> Result<Status, RpcError> {
        let reader = Arc::new(Mutex::new(reader));
        let result = self
            .service
            .upload_file(
                upload_stream(Arc::clone(&reader)),
                header.timeout(),
                cancel,
            )
            .await;

        let status = match result {
            Ok(response) => {
                write_frame(writer, &Frame::message(&response)?).await?;
                Status::ok()
            }
            Err(status) => status,
        };
        finish(writer, &status).await?;

        if !status.is_ok() {
            // Rejected uploads may still have frames in flight. Closing with
            // unread data would reset the connection under the client.
            let mut reader = reader.lock().await;
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain(&mut *reader)).await;
        }
        Ok(status)
    }

    async fn serve_download(
        &self,
        reader: &mut CallReader,
        writer: &mut CallWriter,
        cancel: &CancellationToken,
    ) -> Result<Status, RpcError> {
        let request = match read_request::<DownloadFileRequest>(reader).await {
            Ok(request) => request,
            Err(status) => {
                finish(writer, &status).await?;
                return Ok(status);
            }
        };

        let result = {
            let mut sink = std::pin::pin!(chunk_sink(&mut *writer));
            self.service.download_file(&request, &mut sink, cancel).await
        };

        let status = match result {
            Ok(sent) => {
                debug!(filename = %request.filename, sent, "download sent");
                Status::ok()
            }
            Err(status) => status,
        };
        finish(writer, &status).await?;
        Ok(status)
    }

    async fn serve_list(
        &self,
        reader: &mut CallReader,
        writer: &mut CallWriter,
        cancel: &CancellationToken,
    ) -> Result<Status, RpcError> {
        if let Err(status) = read_request::<ListFilesRequest>(reader).await {
            finish(writer, &status).await?;
            return Ok(status);
        }

        let status = match self.service.list_files(cancel).await {
            Ok(response) => {
                write_frame(writer, &Frame::message(&response)?).await?;
                Status::ok()
            }
            Err(status) => status,
        };
        finish(writer, &status).await?;
        Ok(status)
    }
}

/// Sink writing each item as a flushed CHUNK frame.
///
/// The boxed future keeps the connection task `Send`.
fn chunk_sink(writer: &mut CallWriter) -> impl Sink<Vec<u8>, Error = RpcError> + Send + '_ {
    futures_util::sink::unfold(
        writer,
        |writer: &mut CallWriter,
         chunk: Vec<u8>|
         -> Pin<Box<dyn Future<Output = Result<&mut CallWriter, RpcError>> + Send + '_>> {
            Box::pin(async move {
                write_frame(writer, &Frame::Chunk(chunk)).await?;
                writer.flush().await?;
                Ok(writer)
            })
        },
    )
}

/// Runs `call` under the client deadline. `None` if the deadline expired.
async fn with_deadline<F: Future>(timeout: Option<Duration>, call: F) -> Option<F::Output> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, call).await.ok(),
        None => Some(call.await),
    }
}

/// Answers a call whose handler was dropped at the client deadline.
async fn deadline_expired(writer: &mut CallWriter) -> Result<Status, RpcError> {
    let status = Status::deadline_exceeded("deadline exceeded");
    finish(writer, &status).await?;
    Ok(status)
}

/// Writes the terminal STATUS frame and flushes.
async fn finish(writer: &mut CallWriter, status: &Status) -> Result<(), RpcError> {
    write_frame(writer, &Frame::Status(status.clone())).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a unary request: one MESSAGE frame, then END.
async fn read_request<T: DeserializeOwned>(reader: &mut CallReader) -> Result<T, Status> {
    let request = match read_frame(reader).await {
        Ok(Some(Frame::Message(payload))) => parse_message(&payload)
            .map_err(|e| Status::invalid_argument(format!("malformed request: {e}")))?,
        Ok(Some(other)) => {
            return Err(Status::invalid_argument(format!(
                "expected request message, got {} frame",
                other.kind()
            )));
        }
        Ok(None) => {
            return Err(Status::invalid_argument("connection closed before request"));
        }
        Err(e) => return Err(Status::internal(e.to_string())),
    };

    match read_frame(reader).await {
        // A client that half-closes instead of sending END is accepted.
        Ok(Some(Frame::End)) | Ok(None) => Ok(request),
        Ok(Some(other)) => Err(Status::invalid_argument(format!(
            "expected end of request, got {} frame",
            other.kind()
        ))),
        Err(e) => Err(Status::internal(e.to_string())),
    }
}

/// Decodes upload frames into pipeline messages until END.
///
/// A malformed upload message is the client's fault and maps to
/// `invalid_argument`; every other transport failure is a stream error.
fn upload_stream<R>(
    reader: Arc<Mutex<R>>,
) -> impl Stream<Item = Result<UploadMessage, TransferError>> + Send + Unpin + 'static
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(stream::unfold(Some(reader), |state| async move {
        let reader = state?;
        let frame = {
            let mut guard = reader.lock().await;
            read_frame(&mut *guard).await
        };
        let item = match frame {
            Ok(Some(Frame::Chunk(data))) => Ok(UploadMessage::Chunk(data)),
            Ok(Some(Frame::Message(payload))) => parse_message::<UploadFileInfo>(&payload)
                .map(UploadMessage::Info)
                .map_err(|e| TransferError::InvalidInput(format!("malformed upload message: {e}"))),
            Ok(Some(Frame::End)) => return None,
            Ok(Some(other)) => Err(TransferError::Stream(format!(
                "unexpected {} frame in upload",
                other.kind()
            ))),
            Ok(None) => Err(TransferError::Stream(
                "connection closed before end of upload".into(),
            )),
            Err(e) => Err(TransferError::Stream(e.to_string())),
        };
        let next = if item.is_ok() { Some(reader) } else { None };
        Some((item, next))
    }))
}

/// Discards frames until END, EOF or an error.
async fn drain<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut discarded = 0usize;
    while let Ok(Some(frame)) = read_frame(reader).await {
        if frame == Frame::End {
            break;
        }
        discarded += 1;
    }
    if discarded > 0 {
        debug!(discarded, "drained rejected upload");
    }
}
