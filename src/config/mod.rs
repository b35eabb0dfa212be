//! Configuration options for a DBRB process.

use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::utilities::crypto::ProcessId;
use crate::view::{View, ViewData};

/// Smallest shard size the tree overlay supports.
pub const MIN_SHARD_SIZE: usize = 4;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Configuration {
    pub node: NodeConfig,
    pub dbrb: DbrbConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Hex-encoded Ed25519 private key of this process.
    pub private_key: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DbrbConfig {
    /// Whether this node participates in DBRB at all.
    pub is_dbrb_process: bool,
    /// Deadline, in milliseconds, written on emitted transactions.
    pub transaction_timeout_ms: u64,
    /// Period for re-disseminating broadcasts whose certificate is not yet
    /// sealed.
    pub resend_messages_interval_ms: u64,
    /// Shard size for the tree overlay; 0 disables sharding.
    pub shard_size: usize,
    /// How far ahead of registration expiry to re-register, in milliseconds.
    pub registration_grace_period_ms: u64,
    /// Hex-encoded identities of the static membership seed, always merged
    /// into the fetched view.
    pub bootstrap_processes: Vec<String>,
}

impl Default for DbrbConfig {
    fn default() -> Self {
        DbrbConfig {
            is_dbrb_process: true,
            transaction_timeout_ms: 60_000,
            resend_messages_interval_ms: 500,
            shard_size: 0,
            registration_grace_period_ms: 3_600_000,
            bootstrap_processes: vec![],
        }
    }
}

impl DbrbConfig {
    /// Decodes the configured bootstrap identities.
    pub fn bootstrap_view(&self) -> Result<View, ConfigurationError> {
        let mut data = ViewData::new();
        for hex in &self.bootstrap_processes {
            let id = ProcessId::from_hex(hex).map_err(|_| {
                ConfigurationError::Other(format!("invalid bootstrap process id: '{hex}'"))
            })?;
            data.insert(id);
        }
        Ok(View::new(data))
    }

    /// Whether the tree overlay is in use, and if so with which shard size.
    pub fn sharding(&self) -> Result<Option<usize>, ConfigurationError> {
        match self.shard_size {
            0 => Ok(None),
            size if size >= MIN_SHARD_SIZE => Ok(Some(size)),
            size => Err(ConfigurationError::Other(format!(
                "shard size {size} is below the minimum of {MIN_SHARD_SIZE}"
            ))),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Configuration file does not exist: '{}'", .0)]
    ConfigurationFileDoesNotExist(String),
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("{}", .0)]
    Other(String),
}

type Result<T, E = ConfigurationError> = std::result::Result<T, E>;

impl Configuration {
    pub fn try_load(path: PathBuf) -> Result<Configuration> {
        if !path.exists() {
            return Err(ConfigurationError::ConfigurationFileDoesNotExist(
                path.display().to_string(),
            ));
        }

        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| ConfigurationError::Other(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Other(e.to_string()))
    }

    pub fn write(&self, path: PathBuf) -> Result<()> {
        let config = toml::to_string(&self)
            .map_err(|e| ConfigurationError::Other(format!("Failed to serialize configuration: {e}")))?;
        std::fs::write(path, config)?;
        Ok(())
    }
}
