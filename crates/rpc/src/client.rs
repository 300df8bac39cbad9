//! TCP call client.
//!
//! Each method opens its own connection, performs exactly one call and
//! returns the decoded response. A non-OK status from the server surfaces as
//! [`RpcError::Status`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

use filedepot_protocol::{
    CallHeader, DownloadFileRequest, ListFilesRequest, ListFilesResponse, Method, UploadFileInfo,
    UploadFileResponse,
};

use crate::error::RpcError;
use crate::wire::{Frame, parse_message, read_frame, write_frame};
use crate::{CLIENT_CHUNK_SIZE, CONNECT_TIMEOUT, IO_BUFFER_SIZE};

type CallReader = BufReader<OwnedReadHalf>;
type CallWriter = BufWriter<OwnedWriteHalf>;

/// Client for a filedepot server.
#[derive(Debug, Clone)]
pub struct FileClient {
    addr: String,
    timeout: Option<Duration>,
}

impl FileClient {
    /// Creates a client for `addr` (`host:port`). No connection is made until
    /// the first call.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: None,
        }
    }

    /// Sets a deadline sent with every call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Uploads a local file. The server stores it under the file's base name.
    pub async fn upload_file(&self, path: impl AsRef<Path>) -> Result<UploadFileResponse, RpcError> {
        let path = path.as_ref();
        let mut file = tokio::fs::File::open(path).await?;
        let info = UploadFileInfo::ImagePath(path.to_string_lossy().into_owned());
        self.upload(info, &mut file).await
    }

    /// Uploads everything `reader` yields, in chunks of [`CLIENT_CHUNK_SIZE`].
    pub async fn upload<R>(
        &self,
        info: UploadFileInfo,
        reader: &mut R,
    ) -> Result<UploadFileResponse, RpcError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (mut call_reader, mut call_writer) = self.open_call(Method::UploadFile).await?;

        match send_upload(&mut call_writer, &info, reader).await {
            Ok(sent) => {
                debug!(sent, "upload sent");
                read_unary(&mut call_reader).await
            }
            Err(SendError::Local(e)) => Err(e.into()),
            Err(SendError::Remote(e)) => {
                // A server that rejects an upload answers early and stops
                // reading. Prefer its status over the write failure.
                match read_unary::<UploadFileResponse>(&mut call_reader).await {
                    Err(RpcError::Status(status)) => Err(RpcError::Status(status)),
                    _ => Err(e),
                }
            }
        }
    }

    /// Starts a download and returns once the request is sent.
    pub async fn open_download(&self, filename: &str) -> Result<Download, RpcError> {
        let (reader, mut writer) = self.open_call(Method::DownloadFile).await?;
        let request = DownloadFileRequest {
            filename: filename.to_string(),
        };
        write_frame(&mut writer, &Frame::message(&request)?).await?;
        write_frame(&mut writer, &Frame::End).await?;
        writer.flush().await?;
        Ok(Download {
            reader,
            finished: false,
            received: 0,
        })
    }

    /// Downloads `filename` into `writer`. Returns the bytes received.
    pub async fn download_to<W>(&self, filename: &str, writer: &mut W) -> Result<u64, RpcError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut download = self.open_download(filename).await?;
        while let Some(chunk) = download.next_chunk().await? {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        Ok(download.received())
    }

    /// Downloads `filename` into `dest_dir`, creating the directory if
    /// needed. Returns the path written.
    ///
    /// The local file is only created once the server starts sending, and is
    /// removed again if the transfer fails.
    pub async fn download_file(
        &self,
        filename: &str,
        dest_dir: impl AsRef<Path>,
    ) -> Result<PathBuf, RpcError> {
        let base = Path::new(filename)
            .file_name()
            .ok_or_else(|| RpcError::Protocol(format!("not a file name: {filename}")))?;
        let dest = dest_dir.as_ref().join(base);

        let mut download = self.open_download(filename).await?;
        let first = download.next_chunk().await?;

        tokio::fs::create_dir_all(dest_dir.as_ref()).await?;
        let mut file = tokio::fs::File::create(&dest).await?;

        let result = async {
            let mut chunk = first;
            while let Some(data) = chunk {
                file.write_all(&data).await?;
                chunk = download.next_chunk().await?;
            }
            file.flush().await?;
            Ok::<_, RpcError>(())
        }
        .await;

        if let Err(e) = result {
            drop(file);
            if let Err(remove_err) = tokio::fs::remove_file(&dest).await {
                warn!(path = %dest.display(), "failed to remove partial download: {remove_err}");
            }
            return Err(e);
        }

        debug!(path = %dest.display(), size = download.received(), "download saved");
        Ok(dest)
    }

    pub async fn list_files(&self) -> Result<ListFilesResponse, RpcError> {
        let (mut reader, mut writer) = self.open_call(Method::ListFiles).await?;
        write_frame(&mut writer, &Frame::message(&ListFilesRequest {})?).await?;
        write_frame(&mut writer, &Frame::End).await?;
        writer.flush().await?;
        read_unary(&mut reader).await
    }

    /// Connects and writes the CALL frame (unflushed).
    async fn open_call(&self, method: Method) -> Result<(CallReader, CallWriter), RpcError> {
        let connect = TcpStream::connect(self.addr.as_str());
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(RpcError::Timeout),
        };
        let _ = stream.set_nodelay(true);
        debug!(addr = %self.addr, %method, "connected");

        let (reader, writer) = stream.into_split();
        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, writer);

        let mut header = CallHeader::new(method);
        if let Some(timeout) = self.timeout {
            header = header.with_timeout(timeout);
        }
        write_frame(&mut writer, &Frame::Call(header)).await?;

        Ok((BufReader::with_capacity(IO_BUFFER_SIZE, reader), writer))
    }
}

/// An in-progress download.
#[derive(Debug)]
pub struct Download {
    reader: CallReader,
    finished: bool,
    received: u64,
}

impl Download {
    /// Returns the next chunk, or `None` once the server reported success.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RpcError> {
        if self.finished {
            return Ok(None);
        }
        match read_frame(&mut self.reader).await? {
            Some(Frame::Chunk(data)) => {
                self.received += data.len() as u64;
                Ok(Some(data))
            }
            Some(Frame::Status(status)) => {
                self.finished = true;
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(status.into())
                }
            }
            Some(other) => Err(RpcError::Protocol(format!(
                "unexpected {} frame in download",
                other.kind()
            ))),
            None => Err(RpcError::Protocol(
                "connection closed before status".into(),
            )),
        }
    }

    /// Bytes received so far.
    pub fn received(&self) -> u64 {
        self.received
    }
}

enum SendError {
    /// Reading the local source failed.
    Local(std::io::Error),
    /// Writing to the server failed.
    Remote(RpcError),
}

async fn send_upload<R>(
    writer: &mut CallWriter,
    info: &UploadFileInfo,
    reader: &mut R,
) -> Result<u64, SendError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let info = Frame::message(info).map_err(SendError::Remote)?;
    write_frame(writer, &info).await.map_err(SendError::Remote)?;

    let mut buf = vec![0u8; CLIENT_CHUNK_SIZE];
    let mut sent: u64 = 0;
    loop {
        let n = reader.read(&mut buf).await.map_err(SendError::Local)?;
        if n == 0 {
            break;
        }
        write_frame(writer, &Frame::Chunk(buf[..n].to_vec()))
            .await
            .map_err(SendError::Remote)?;
        sent += n as u64;
    }

    write_frame(writer, &Frame::End)
        .await
        .map_err(SendError::Remote)?;
    writer
        .flush()
        .await
        .map_err(|e| SendError::Remote(e.into()))?;
    Ok(sent)
}

/// Reads an optional MESSAGE followed by the STATUS frame.
async fn read_unary<T: DeserializeOwned>(reader: &mut CallReader) -> Result<T, RpcError> {
    let mut response = None;
    loop {
        match read_frame(reader).await? {
            Some(Frame::Message(payload)) => response = Some(parse_message(&payload)?),
            Some(Frame::Status(status)) if status.is_ok() => {
                return response
                    .ok_or_else(|| RpcError::Protocol("ok status without a response".into()));
            }
            Some(Frame::Status(status)) => return Err(status.into()),
            Some(other) => {
                return Err(RpcError::Protocol(format!(
                    "unexpected {} frame in response",
                    other.kind()
                )));
            }
            None => {
                return Err(RpcError::Protocol(
                    "connection closed before status".into(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use filedepot_admission::{AdmissionLimits, OperationClass};
    use filedepot_protocol::{Code, Status};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::server::{FileServer, ServerConfig};
    use crate::service::ServiceOptions;

    struct TestServer {
        server: Arc<FileServer>,
        addr: SocketAddr,
        dir: tempfile::TempDir,
        handle: JoinHandle<Result<(), RpcError>>,
    }

    impl TestServer {
        async fn start(limits: AdmissionLimits, service: ServiceOptions) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let server = FileServer::new(ServerConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                storage_dir: dir.path().to_path_buf(),
                limits,
                service,
            });
            let handle = {
                let server = Arc::clone(&server);
                tokio::spawn(async move { server.run().await })
            };
            let addr = loop {
                if let Some(addr) = server.local_addr().await {
                    break addr;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            Self {
                server,
                addr,
                dir,
                handle,
            }
        }

        async fn start_default() -> Self {
            Self::start(AdmissionLimits::default(), ServiceOptions::default()).await
        }

        fn client(&self) -> FileClient {
            FileClient::new(self.addr.to_string())
        }

        fn in_flight(&self, class: OperationClass) -> usize {
            self.server.service().admission().in_flight(class)
        }

        async fn wait_in_flight(&self, class: OperationClass, n: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.in_flight(class) != n {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("in-flight count never reached");
        }
    }

    /// A hand-driven call, for holding a call open mid-stream.
    struct RawCall {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl RawCall {
        async fn open(addr: SocketAddr, method: Method) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            let mut call = Self {
                reader: BufReader::new(reader),
                writer,
            };
            call.send(Frame::Call(CallHeader::new(method))).await;
            call
        }

        async fn start_upload(addr: SocketAddr, name: &str, first_chunk: &[u8]) -> Self {
            let mut call = Self::open(addr, Method::UploadFile).await;
            let info = UploadFileInfo::Filename(name.into());
            call.send(Frame::message(&info).unwrap()).await;
            call.send(Frame::Chunk(first_chunk.to_vec())).await;
            call
        }

        async fn send(&mut self, frame: Frame) {
            write_frame(&mut self.writer, &frame).await.unwrap();
        }

        async fn send_chunks(&mut self, data: &[u8]) {
            for piece in data.chunks(1024) {
                self.send(Frame::Chunk(piece.to_vec())).await;
            }
        }

        async fn status(&mut self) -> Status {
            loop {
                match read_frame(&mut self.reader).await.unwrap() {
                    Some(Frame::Status(status)) => return status,
                    Some(_) => continue,
                    None => panic!("connection closed before status"),
                }
            }
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn status_code(err: &RpcError) -> Code {
        err.status().map(|s| s.code).expect("expected a remote status")
    }

    #[tokio::test]
    async fn upload_download_list_roundtrip() {
        let ts = TestServer::start_default().await;
        let client = ts.client();
        let data = pattern(10 * 1024);

        let resp = client
            .upload(UploadFileInfo::Filename("cat.png".into()), &mut &data[..])
            .await
            .unwrap();
        assert_eq!(resp.size, 10_240);
        assert_eq!(resp.message, "File uploaded successfully. Size: 10240 bytes");

        let mut download = client.open_download("cat.png").await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = download.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.len() == 1024));
        assert_eq!(chunks.concat(), data);

        let listed = client.list_files().await.unwrap();
        assert_eq!(listed.files.len(), 1);
        let file = &listed.files[0];
        assert_eq!(file.filename, "cat.png");
        assert!(file.created_at.ends_with('Z'));
        assert!(file.updated_at.ends_with('Z'));

        for class in OperationClass::ALL {
            assert_eq!(ts.in_flight(class), 0);
        }
    }

    #[tokio::test]
    async fn upload_file_uses_base_name() {
        let ts = TestServer::start_default().await;
        let local = tempfile::tempdir().unwrap();
        let path = local.path().join("ruru.bmp");
        std::fs::write(&path, pattern(3000)).unwrap();

        let resp = ts.client().upload_file(&path).await.unwrap();
        assert_eq!(resp.size, 3000);
        assert_eq!(
            std::fs::read(ts.dir.path().join("ruru.bmp")).unwrap(),
            pattern(3000)
        );
    }

    #[tokio::test]
    async fn second_upload_already_exists() {
        let ts = TestServer::start_default().await;
        let client = ts.client();
        client
            .upload(UploadFileInfo::Filename("cat.png".into()), &mut &b"first"[..])
            .await
            .unwrap();

        let data = pattern(64 * 1024);
        let err = client
            .upload(UploadFileInfo::Filename("cat.png".into()), &mut &data[..])
            .await
            .unwrap_err();
        assert_eq!(status_code(&err), Code::AlreadyExists);
        assert_eq!(std::fs::read(ts.dir.path().join("cat.png")).unwrap(), b"first");
    }

    #[tokio::test]
    async fn empty_upload_is_invalid() {
        let ts = TestServer::start_default().await;
        let err = ts
            .client()
            .upload(UploadFileInfo::Filename("empty.png".into()), &mut &b""[..])
            .await
            .unwrap_err();
        assert_eq!(status_code(&err), Code::InvalidArgument);
        assert!(!ts.dir.path().join("empty.png").exists());
        assert_eq!(ts.in_flight(OperationClass::Upload), 0);
    }

    #[tokio::test]
    async fn download_rejects_unsupported_and_missing() {
        let ts = TestServer::start_default().await;
        std::fs::write(ts.dir.path().join("notes.txt"), b"text").unwrap();
        let client = ts.client();
        let local = tempfile::tempdir().unwrap();

        let err = client.download_file("notes.txt", local.path()).await.unwrap_err();
        assert_eq!(status_code(&err), Code::InvalidArgument);

        let err = client.download_file("missing.png", local.path()).await.unwrap_err();
        assert_eq!(status_code(&err), Code::NotFound);
        assert!(!local.path().join("missing.png").exists());
    }

    #[tokio::test]
    async fn download_file_saves_into_dir() {
        let ts = TestServer::start_default().await;
        std::fs::write(ts.dir.path().join("dog.jpg"), pattern(2500)).unwrap();
        let local = tempfile::tempdir().unwrap();
        let dest_dir = local.path().join("downloads");

        let path = ts.client().download_file("dog.jpg", &dest_dir).await.unwrap();
        assert_eq!(path, dest_dir.join("dog.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), pattern(2500));
    }

    #[tokio::test]
    async fn download_to_writer() {
        let ts = TestServer::start_default().await;
        std::fs::write(ts.dir.path().join("dog.gif"), pattern(1024)).unwrap();

        let mut out = Vec::new();
        let n = ts.client().download_to("dog.gif", &mut out).await.unwrap();
        assert_eq!(n, 1024);
        assert_eq!(out, pattern(1024));
    }

    #[tokio::test]
    async fn list_empty_storage() {
        let ts = TestServer::start_default().await;
        let listed = ts.client().list_files().await.unwrap();
        assert!(listed.files.is_empty());
    }

    #[tokio::test]
    async fn stalled_upload_hits_deadline_and_frees_slot() {
        let ts = TestServer::start(
            AdmissionLimits {
                upload: 1,
                ..AdmissionLimits::default()
            },
            ServiceOptions {
                upload_deadline: Duration::from_millis(200),
                ..ServiceOptions::default()
            },
        )
        .await;

        let mut stalled = RawCall::start_upload(ts.addr, "slow.png", b"partial").await;
        let status = tokio::time::timeout(Duration::from_secs(5), stalled.status())
            .await
            .unwrap();
        assert_eq!(status.code, Code::DeadlineExceeded);
        assert!(!ts.dir.path().join("slow.png").exists());

        ts.wait_in_flight(OperationClass::Upload, 0).await;
        ts.client()
            .upload(UploadFileInfo::Filename("next.png".into()), &mut &b"data"[..])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn third_upload_waits_for_a_free_slot() {
        let ts = TestServer::start(
            AdmissionLimits {
                upload: 2,
                ..AdmissionLimits::default()
            },
            ServiceOptions::default(),
        )
        .await;

        let bodies: Vec<Vec<u8>> = (0..3u8)
            .map(|n| pattern(10 * 1024).into_iter().map(|b| b ^ n).collect())
            .collect();

        let mut a = RawCall::start_upload(ts.addr, "a.png", &bodies[0][..1024]).await;
        let mut b = RawCall::start_upload(ts.addr, "b.png", &bodies[1][..1024]).await;
        ts.wait_in_flight(OperationClass::Upload, 2).await;

        let client = ts.client();
        let c_body = bodies[2].clone();
        let c = tokio::spawn(async move {
            client
                .upload(UploadFileInfo::Filename("c.png".into()), &mut &c_body[..])
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!c.is_finished(), "third upload must wait while two are active");
        assert_eq!(ts.in_flight(OperationClass::Upload), 2);

        a.send_chunks(&bodies[0][1024..]).await;
        a.send(Frame::End).await;
        assert!(a.status().await.is_ok());

        let resp = tokio::time::timeout(Duration::from_secs(5), c)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(resp.size, 10 * 1024);

        b.send_chunks(&bodies[1][1024..]).await;
        b.send(Frame::End).await;
        assert!(b.status().await.is_ok());

        for (name, body) in ["a.png", "b.png", "c.png"].iter().zip(&bodies) {
            assert_eq!(&std::fs::read(ts.dir.path().join(name)).unwrap(), body);
        }
        ts.wait_in_flight(OperationClass::Upload, 0).await;
    }

    #[tokio::test]
    async fn missing_call_header_is_rejected() {
        let ts = TestServer::start_default().await;
        let stream = TcpStream::connect(ts.addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Frame::End).await.unwrap();

        let mut reader = BufReader::new(reader);
        let Some(Frame::Status(status)) = read_frame(&mut reader).await.unwrap() else {
            panic!("expected a status frame");
        };
        assert_eq!(status.code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_calls() {
        let ts = TestServer::start_default().await;
        let mut call = RawCall::start_upload(ts.addr, "late.png", b"late").await;
        ts.wait_in_flight(OperationClass::Upload, 1).await;

        ts.server.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ts.handle.is_finished(), "run must wait for the open call");

        call.send(Frame::End).await;
        assert!(call.status().await.is_ok());

        tokio::time::timeout(Duration::from_secs(5), ts.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(ts.dir.path().join("late.png")).unwrap(), b"late");
    }

    #[tokio::test]
    async fn client_reports_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = FileClient::new(addr.to_string()).list_files().await.unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
    }
}
