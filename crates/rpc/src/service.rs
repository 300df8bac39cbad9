//! Call dispatch: admission, then the transfer pipeline, then a status.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, Stream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use filedepot_admission::{AdmissionController, AdmissionError, AdmissionPermit, OperationClass};
use filedepot_protocol::{DownloadFileRequest, ListFilesResponse, Status, UploadFileResponse};
use filedepot_storage::DiskStorage;
use filedepot_transfer::{
    DOWNLOAD_CHUNK_SIZE, TransferError, UPLOAD_DEADLINE, UPLOAD_QUEUE_CAPACITY, UploadMessage,
    UploadOptions, list_files, receive_upload, send_download,
};

/// Tuning for [`FileService`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Upper bound for a whole upload call, admission wait included.
    pub upload_deadline: Duration,
    pub upload_queue_capacity: usize,
    pub download_chunk_size: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            upload_deadline: UPLOAD_DEADLINE,
            upload_queue_capacity: UPLOAD_QUEUE_CAPACITY,
            download_chunk_size: DOWNLOAD_CHUNK_SIZE,
        }
    }
}

/// The three file operations, independent of the transport.
///
/// Every failure comes back as a [`Status`] with a distinct code.
pub struct FileService {
    storage: Arc<DiskStorage>,
    admission: Arc<AdmissionController>,
    options: ServiceOptions,
}

impl FileService {
    pub fn new(
        storage: Arc<DiskStorage>,
        admission: Arc<AdmissionController>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            storage,
            admission,
            options,
        }
    }

    pub fn storage(&self) -> &Arc<DiskStorage> {
        &self.storage
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Stores the file carried by `stream`.
    ///
    /// The deadline is the smaller of `client_timeout` and the configured
    /// upload deadline, and covers the admission wait as well.
    pub async fn upload_file<S>(
        &self,
        stream: S,
        client_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<UploadFileResponse, Status>
    where
        S: Stream<Item = Result<UploadMessage, TransferError>> + Send + Unpin + 'static,
    {
        let timeout = client_timeout.map_or(self.options.upload_deadline, |t| {
            t.min(self.options.upload_deadline)
        });
        let deadline = Instant::now() + timeout;

        let _permit = self
            .admit(OperationClass::Upload, cancel, Some(deadline))
            .await?;

        let options = UploadOptions {
            queue_capacity: self.options.upload_queue_capacity,
        };
        let outcome = receive_upload(&self.storage, stream, &options, deadline, cancel).await?;
        Ok(UploadFileResponse::new(outcome.bytes_written))
    }

    /// Streams the requested file into `sink`. Returns the bytes sent.
    pub async fn download_file<S>(
        &self,
        request: &DownloadFileRequest,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<u64, Status>
    where
        S: Sink<Vec<u8>> + Unpin,
        S::Error: Display,
    {
        let _permit = self.admit(OperationClass::Download, cancel, None).await?;
        let sent = send_download(
            &self.storage,
            &request.filename,
            sink,
            self.options.download_chunk_size,
            cancel,
        )
        .await?;
        Ok(sent)
    }

    pub async fn list_files(&self, cancel: &CancellationToken) -> Result<ListFilesResponse, Status> {
        let _permit = self.admit(OperationClass::List, cancel, None).await?;
        let files = list_files(&self.storage, cancel).await?;
        Ok(ListFilesResponse { files })
    }

    async fn admit(
        &self,
        class: OperationClass,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<AdmissionPermit, Status> {
        let wait = self.admission.acquire(class, cancel);
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, wait)
                .await
                .unwrap_or(Err(AdmissionError::Exhausted(class))),
            None => wait.await,
        };
        result.map_err(|e| {
            warn!(%class, "admission refused: {e}");
            admission_status(e)
        })
    }
}

fn admission_status(e: AdmissionError) -> Status {
    match e {
        AdmissionError::Exhausted(OperationClass::Upload) => {
            Status::resource_exhausted("uploaders limit reached")
        }
        AdmissionError::Exhausted(_) => Status::resource_exhausted(e.to_string()),
        AdmissionError::UnbalancedRelease(_) => Status::internal(e.to_string()),
    }
}
