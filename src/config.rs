use crate::RpcError;
use serde::Deserialize;
use std::path::Path;

/// Server configuration. Every field has a default so a partial file is fine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub port: u16,
    pub io_threads: usize,
    pub log_level: String,
    pub log_file_name: String,
    pub log_file_path: String,
    /// bytes per log file before rotating.
    pub log_max_file_size: u64,
    /// ms between two log syncs.
    pub log_sync_interval: i64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            port: 12345,
            io_threads: 4,
            log_level: "DEBUG".to_owned(),
            log_file_name: "reactrpc".to_owned(),
            log_file_path: "./log/".to_owned(),
            log_max_file_size: 1_000_000_000,
            log_sync_interval: 500,
        }
    }
}

impl RpcConfig {
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        toml::from_str(text).map_err(|e| RpcError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RpcError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// `0.0.0.0:<port>`.
    pub fn listen_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}
