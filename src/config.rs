//! Tunnel configuration, loadable from TOML and overridable from the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TunnelError};
use crate::protocol::defaults;

/// Which file discipline carries the commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// One long-lived file, appended and tailed, rotated by purge handshakes
    #[default]
    Streaming,
    /// Whole files written to a temp path and renamed into place
    Exchange,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    pub read: PathBuf,
    pub write: PathBuf,
    pub mode: TransportMode,
    /// Streaming: file size that triggers a purge (0 disables purging).
    /// Exchange: maximum size of one exchanged file.
    pub purge_size: u64,
    pub tunnel_timeout_ms: u64,
    pub read_duration_ms: u64,
    pub pace_ms: u64,
    pub verbose: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            read: PathBuf::new(),
            write: PathBuf::new(),
            mode: TransportMode::default(),
            purge_size: defaults::PURGE_SIZE,
            tunnel_timeout_ms: defaults::TUNNEL_TIMEOUT_MS,
            read_duration_ms: defaults::READ_DURATION_MS,
            pace_ms: defaults::PACE_MS,
            verbose: false,
        }
    }
}

impl TunnelConfig {
    pub fn new(read: impl Into<PathBuf>, write: impl Into<PathBuf>) -> Self {
        TunnelConfig {
            read: read.into(),
            write: write.into(),
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| TunnelError::Config(format!("{}: {e}", path.display())))
    }

    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel_timeout_ms)
    }

    pub fn read_duration(&self) -> Duration {
        Duration::from_millis(self.read_duration_ms)
    }

    pub fn pace(&self) -> Duration {
        Duration::from_millis(self.pace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read.as_os_str().is_empty() {
            return Err(TunnelError::Config("please supply --read".into()));
        }
        if self.write.as_os_str().is_empty() {
            return Err(TunnelError::Config("please supply --write".into()));
        }
        if self.read == self.write {
            return Err(TunnelError::Config(
                "--read and --write must be different files".into(),
            ));
        }
        if self.tunnel_timeout_ms == 0 {
            return Err(TunnelError::Config(
                "--tunnel-timeout must be greater than zero".into(),
            ));
        }
        if self.mode == TransportMode::Exchange && self.purge_size == 0 {
            return Err(TunnelError::Config(
                "exchange mode needs a non-zero maximum file size".into(),
            ));
        }
        Ok(())
    }
}
