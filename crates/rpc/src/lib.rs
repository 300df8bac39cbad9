//! Framed TCP transport for the filedepot service.
//!
//! One call per connection. The client opens with a CALL frame naming the
//! method, streams its request frames, and the server answers with its own
//! frames followed by exactly one STATUS frame.
//!
//! # Wire format
//!
//! See [`wire`] for the frame layout.

pub mod client;
pub mod error;
pub mod server;
pub mod service;
pub mod wire;

pub use client::{Download, FileClient};
pub use error::RpcError;
pub use server::{FileServer, ServerConfig};
pub use service::{FileService, ServiceOptions};
pub use wire::Frame;

use std::time::Duration;

/// Socket read/write buffer size (64 KB).
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Time the server waits for the CALL frame of a new connection.
pub const CALL_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the client's TCP connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time the server keeps reading a rejected upload before closing.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Time in-flight calls get to finish after shutdown before they are
/// cancelled.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Chunk size the client uses when streaming an upload.
pub const CLIENT_CHUNK_SIZE: usize = 1024;
