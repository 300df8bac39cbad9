//! Command line definition.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Default server address for the client.
pub const DEFAULT_SERVER: &str = "localhost:50051";

/// Default directory downloads are saved into.
pub const DEFAULT_DOWNLOAD_DIR: &str = "./downloads";

#[derive(Parser, Debug)]
#[command(name = "filedepot-client")]
#[command(about = "Upload, download and list images on a filedepot server")]
pub struct Cli {
    /// Server address (host:port)
    #[arg(long, env = "SERVER_ADDRESS", default_value = DEFAULT_SERVER, global = true)]
    pub server: String,

    /// Deadline for each call, in seconds
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Upload a local image
    Upload {
        /// Path of the image to upload
        path: PathBuf,
    },
    /// Download a stored image
    Download {
        /// Name of the stored file
        filename: String,
        /// Directory to save into
        #[arg(long, default_value = DEFAULT_DOWNLOAD_DIR)]
        dir: PathBuf,
    },
    /// List stored files
    List,
}

impl Cli {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
