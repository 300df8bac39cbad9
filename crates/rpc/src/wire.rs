//! TCP wire format for calls.
//!
//! # Wire format
//!
//! Every frame is a one byte kind, a four byte big-endian payload length and
//! the payload:
//!
//! ```text
//! [1 byte: kind][4 bytes BE: len][len bytes: payload]
//!
//! CALL    0x01  JSON CallHeader          client -> server, first frame
//! MESSAGE 0x02  JSON request / response  both directions
//! CHUNK   0x03  raw file bytes           both directions
//! END     0x04  empty                    client -> server, end of request
//! STATUS  0x05  JSON Status              server -> client, last frame
//! ```
//!
//! A call is one connection:
//!
//! ```text
//! upload_file:   CALL, MESSAGE(UploadFileInfo), CHUNK*, END
//!                -> MESSAGE(UploadFileResponse)?, STATUS
//! download_file: CALL, MESSAGE(DownloadFileRequest), END
//!                -> CHUNK*, STATUS
//! list_files:    CALL, MESSAGE(ListFilesRequest), END
//!                -> MESSAGE(ListFilesResponse)?, STATUS
//! ```

use std::borrow::Cow;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use filedepot_protocol::{CallHeader, Status};

use crate::error::RpcError;

/// Largest accepted frame payload (4 MiB).
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub const KIND_CALL: u8 = 0x01;
pub const KIND_MESSAGE: u8 = 0x02;
pub const KIND_CHUNK: u8 = 0x03;
pub const KIND_END: u8 = 0x04;
pub const KIND_STATUS: u8 = 0x05;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(CallHeader),
    /// Undecoded JSON payload; see [`parse_message`].
    Message(Vec<u8>),
    Chunk(Vec<u8>),
    End,
    Status(Status),
}

impl Frame {
    /// Builds a MESSAGE frame from any serializable value.
    pub fn message<T: Serialize>(value: &T) -> Result<Self, RpcError> {
        Ok(Frame::Message(serde_json::to_vec(value)?))
    }

    /// Short name of the frame kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Call(_) => "call",
            Frame::Message(_) => "message",
            Frame::Chunk(_) => "chunk",
            Frame::End => "end",
            Frame::Status(_) => "status",
        }
    }
}

/// Decodes the payload of a MESSAGE frame.
pub fn parse_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, RpcError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Writes one frame. Does not flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), RpcError> {
    let (kind, payload): (u8, Cow<'_, [u8]>) = match frame {
        Frame::Call(header) => (KIND_CALL, Cow::Owned(serde_json::to_vec(header)?)),
        Frame::Message(payload) => (KIND_MESSAGE, Cow::Borrowed(payload)),
        Frame::Chunk(data) => (KIND_CHUNK, Cow::Borrowed(data)),
        Frame::End => (KIND_END, Cow::Borrowed(&[])),
        Frame::Status(status) => (KIND_STATUS, Cow::Owned(serde_json::to_vec(status)?)),
    };

    if payload.len() > MAX_FRAME_LEN {
        return Err(RpcError::Protocol(format!(
            "{} frame too large: {} bytes (max {MAX_FRAME_LEN})",
            frame.kind(),
            payload.len()
        )));
    }

    // One contiguous write, so a buffered writer never holds half a frame
    // when the write future is dropped.
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(kind);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `None` if the peer closed the connection cleanly between frames.
/// A connection closed inside a frame is an I/O error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, RpcError> {
    let kind = match reader.read_u8().await {
        Ok(kind) => kind,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::Protocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_LEN})"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let frame = match kind {
        KIND_CALL => Frame::Call(serde_json::from_slice(&payload)?),
        KIND_MESSAGE => Frame::Message(payload),
        KIND_CHUNK => Frame::Chunk(payload),
        KIND_END => {
            if !payload.is_empty() {
                return Err(RpcError::Protocol("end frame with payload".into()));
            }
            Frame::End
        }
        KIND_STATUS => Frame::Status(serde_json::from_slice(&payload)?),
        other => {
            return Err(RpcError::Protocol(format!(
                "unknown frame kind 0x{other:02x}"
            )));
        }
    };
    Ok(Some(frame))
}
