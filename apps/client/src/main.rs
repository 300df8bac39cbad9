//! filedepot client
//!
//! ```bash
//! filedepot-client upload ./files/ruru.bmp
//! filedepot-client download ruru.bmp --dir ./downloads
//! filedepot-client list
//! ```

mod cli;

use std::path::Path;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use filedepot_protocol::{ListFilesResponse, is_supported_image};
use filedepot_rpc::FileClient;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut client = FileClient::new(cli.server.clone());
    if let Some(timeout) = cli.timeout() {
        client = client.with_timeout(timeout);
    }

    match cli.command {
        Command::Upload { path } => upload(&client, &path).await,
        Command::Download { filename, dir } => download(&client, &filename, &dir).await,
        Command::List => {
            let files = client.list_files().await.context("error listing files")?;
            print!("{}", render_list(&files));
            Ok(())
        }
    }
}

async fn upload(client: &FileClient, path: &Path) -> anyhow::Result<()> {
    if !is_supported_image(&path.to_string_lossy()) {
        bail!("{} is not an image", path.display());
    }
    let resp = client
        .upload_file(path)
        .await
        .with_context(|| format!("cannot upload {}", path.display()))?;
    println!("image uploaded, size: {}", resp.size);
    Ok(())
}

async fn download(client: &FileClient, filename: &str, dir: &Path) -> anyhow::Result<()> {
    if !is_supported_image(filename) {
        bail!("{filename} is not an image");
    }
    let saved = client
        .download_file(filename, dir)
        .await
        .with_context(|| format!("error downloading {filename}"))?;
    println!("file {filename} downloaded successfully to {}", saved.display());
    Ok(())
}

fn render_list(resp: &ListFilesResponse) -> String {
    let mut out = String::from("files:\n");
    for file in &resp.files {
        out.push_str(&format!(
            "- {} (Created: {}, Updated: {})\n",
            file.filename, file.created_at, file.updated_at
        ));
    }
    out
}
