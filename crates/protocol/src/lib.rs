//! Wire protocol types for the filedepot transfer service.
//!
//! Every call carries JSON messages (requests, responses, the terminal
//! [`Status`]) and raw byte chunks. The framing itself lives in the rpc
//! crate; this crate only defines what goes inside the frames.

pub mod constants;
pub mod messages;
pub mod status;

pub use constants::*;
pub use messages::{
    CallHeader, DownloadFileRequest, FileInfo, ListFilesRequest, ListFilesResponse, Method,
    UploadFileInfo, UploadFileResponse,
};
pub use status::{Code, Status};
