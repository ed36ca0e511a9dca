//! fetcherd - materialise remote blobs into the pool on demand.
//!
//! Listens on the configured fetcher endpoint; every request names a blob
//! by its content hash, which is downloaded from `{remote}/{key}` into
//! `{pool}/{key}`. The reply says whether the blob is now present.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use merklefs_pool::{Config, FetchReply, FetchRequest, DEFAULT_CONFIG};

/// Serve fetch requests for the merklefs pool.
#[derive(Parser)]
#[command(name = "fetcherd", version, about, long_about = None)]
struct Cli {
    /// Configuration file providing pool, remote, and endpoint
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli.config).context("loading configuration")?;
    info!(
        endpoint = %config.fetcher,
        remote = %config.remote,
        pool = %config.pool,
        "fetcher service starting"
    );

    if let Some(path) = config.fetcher.strip_prefix("unix:") {
        // A previous instance may have left its socket behind.
        let _ = fs::remove_file(path);
        let listener =
            UnixListener::bind(path).with_context(|| format!("binding unix socket {path}"))?;
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => spawn_handler(stream, config.clone()),
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    } else {
        let listener = TcpListener::bind(&config.fetcher)
            .with_context(|| format!("binding {}", config.fetcher))?;
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => spawn_handler(stream, config.clone()),
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }
    Ok(())
}

fn spawn_handler<S: Read + Write + Send + 'static>(stream: S, config: Config) {
    std::thread::spawn(move || {
        if let Err(err) = serve(stream, &config) {
            warn!(error = %err, "connection failed");
        }
    });
}

/// Handles one connection: a single request, a single reply.
fn serve<S: Read + Write>(stream: S, config: &Config) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let request: FetchRequest = serde_json::from_str(&line)?;

    let ok = fetch_blob(config, &request.key);
    info!(key = %request.key, ok = ok, "fetch");

    let mut stream = reader.into_inner();
    let mut reply = serde_json::to_vec(&FetchReply { ok })?;
    reply.push(b'\n');
    stream.write_all(&reply)?;
    Ok(())
}

/// Downloads `{remote}/{key}` into `{pool}/{key}`.
fn fetch_blob(config: &Config, key: &str) -> bool {
    if !valid_key(key) {
        warn!(key = %key, "rejecting malformed key");
        return false;
    }

    let url = format!("{}/{}", config.remote, key);
    let local = Path::new(&config.pool).join(key);
    let status = Command::new("wget")
        .arg("-q")
        .arg(&url)
        .arg("-O")
        .arg(&local)
        .status();

    match status {
        Ok(status) if status.success() => true,
        other => {
            if let Err(err) = &other {
                warn!(error = %err, "wget did not run");
            }
            // wget creates the output file before the transfer; a failed
            // download must not leave an empty blob under a valid hash.
            let _ = fs::remove_file(&local);
            false
        }
    }
}

/// Keys are hash strings: path separators and dot-names would escape the
/// pool directory.
fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && key.chars().all(|c| c.is_ascii_alphanumeric())
}
