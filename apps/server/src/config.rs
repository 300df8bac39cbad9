//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use filedepot_admission::{
    AdmissionLimits, DEFAULT_DOWNLOAD_CAPACITY, DEFAULT_LIST_CAPACITY, DEFAULT_UPLOAD_CAPACITY,
};
use filedepot_protocol::{DEFAULT_LISTEN_ADDR, DEFAULT_STORAGE_DIR};
use filedepot_rpc::{ServerConfig, ServiceOptions};

#[derive(Parser, Debug)]
#[command(name = "filedepot-server")]
#[command(about = "Streams image files to and from a storage directory")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "SERVER_ADDRESS", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// Directory holding the stored files
    #[arg(long, env = "STORAGE_DIR", default_value = DEFAULT_STORAGE_DIR)]
    pub storage_dir: PathBuf,

    /// Maximum concurrent uploads
    #[arg(long, default_value_t = DEFAULT_UPLOAD_CAPACITY)]
    pub max_uploads: usize,

    /// Maximum concurrent downloads
    #[arg(long, default_value_t = DEFAULT_DOWNLOAD_CAPACITY)]
    pub max_downloads: usize,

    /// Maximum concurrent list calls
    #[arg(long, default_value_t = DEFAULT_LIST_CAPACITY)]
    pub max_lists: usize,

    /// Upload deadline in seconds, admission wait included
    #[arg(long, default_value_t = 30)]
    pub upload_deadline_secs: u64,

    /// Chunks buffered per upload between network and disk
    #[arg(long, default_value_t = 100)]
    pub upload_queue: usize,
}

impl Args {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen,
            storage_dir: self.storage_dir.clone(),
            limits: AdmissionLimits {
                upload: self.max_uploads,
                download: self.max_downloads,
                list: self.max_lists,
            },
            service: ServiceOptions {
                upload_deadline: Duration::from_secs(self.upload_deadline_secs),
                upload_queue_capacity: self.upload_queue,
                ..ServiceOptions::default()
            },
        }
    }
}
