//! Settings file (JSON):
//! ```text
//! {
//!     "max_download_rate": <bytes per sec, 0 = unlimited>,
//!     "max_upload_rate": <bytes per sec, 0 = unlimited>,
//!     "allowed_encryption": <bitmask: 1 = plaintext, 2 = RC4 header, 4 = RC4 full>,
//!     "prefer_encryption": <bool>,
//!     "block_size": <bytes>,
//!     "workers": <count>,
//!     "batch": <count>,
//!     "io_tick_ms": <millisec>,
//!     "engine_tick_ms": <millisec>,
//!     "connect_timeout_ms": <millisec>,
//!     "handshake_timeout_ms": <millisec>
//! }
//! ```
//! Missing fields take their default values.
use crate::mse::EncryptionTypes;
use crate::{netio, sched};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use std::{fs, io};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to access settings file: {0}")]
    Io(#[from] io::Error),
    #[error("malformed settings file: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::Json(e) => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_download_rate: usize,
    pub max_upload_rate: usize,
    pub allowed_encryption: EncryptionTypes,
    pub prefer_encryption: bool,
    pub block_size: usize,
    pub workers: usize,
    pub batch: usize,
    pub io_tick_ms: u64,
    pub engine_tick_ms: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_download_rate: 0,
            max_upload_rate: 0,
            allowed_encryption: EncryptionTypes::ALL,
            prefer_encryption: true,
            block_size: 16 * 1024,
            workers: 4,
            batch: 4,
            io_tick_ms: 50,
            engine_tick_ms: 500,
            connect_timeout_ms: 30_000,
            handshake_timeout_ms: 30_000,
        }
    }
}

impl Config {
    pub fn scheduler(&self) -> sched::Config {
        sched::Config {
            workers: self.workers,
            batch: self.batch,
        }
    }

    pub fn netio(&self) -> netio::Config {
        netio::Config {
            block_size: self.block_size,
            tick_period: Duration::from_millis(self.io_tick_ms),
        }
    }

    pub fn engine_tick(&self) -> Duration {
        Duration::from_millis(self.engine_tick_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Read settings from a JSON file.
pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
    let file = fs::File::open(path)?;
    let config = serde_json::from_reader(io::BufReader::new(file))?;
    Ok(config)
}

/// Write settings to a JSON file, replacing its content.
pub fn save(path: impl AsRef<Path>, config: &Config) -> Result<(), Error> {
    let file = fs::File::create(path)?;
    serde_json::to_writer_pretty(io::BufWriter::new(file), config)?;
    Ok(())
}
