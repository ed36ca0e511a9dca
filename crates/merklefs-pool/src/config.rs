//! Mount-time configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG: &str = "/etc/merklefs/config.json";

/// The three paths the filesystem needs at mount time.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory of blobs named by their content hash.
    pub pool: String,
    /// Logical identifier of the remote blob source. Opaque here; the
    /// fetcher service resolves it.
    pub remote: String,
    /// Endpoint of the fetcher RPC (`unix:<path>` or `<host>:<port>`).
    pub fetcher: String,
}

/// Errors from loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not the expected JSON shape
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl Config {
    /// Loads the configuration from [`DEFAULT_CONFIG`].
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(DEFAULT_CONFIG)
    }

    /// Loads the configuration from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
