use crate::error::Error;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SNAPLEN: i32 = 65535;
pub const DEFAULT_BUFFER_SIZE: i32 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub reassembly: ReassemblyConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(Error::ConfigIo)?;
        toml::from_str(&raw).map_err(Error::ConfigParse)
    }
}

/// Where packets come from and how the capture handle is set up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interface for live capture; `any` captures on every interface (Linux)
    pub interface: String,
    /// Replay this capture file instead of capturing live
    pub file: Option<PathBuf>,
    /// Restrict capture to TCP traffic on this port, ignored when `filter` is set
    pub port: Option<u16>,
    /// BPF filter expression
    pub filter: Option<String>,
    pub snaplen: i32,
    pub buffer_size: i32,
    pub timeout_ms: i32,
    /// Only capture packets received by the interface
    pub inbound_only: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: "any".to_owned(),
            file: None,
            port: None,
            filter: None,
            snaplen: DEFAULT_SNAPLEN,
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout_ms: 100,
            inbound_only: true,
        }
    }
}

impl CaptureConfig {
    /// Capture every TCP packet on `port`, on every interface
    #[must_use]
    pub fn for_port(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }

    /// The BPF expression applied to the capture handle
    #[must_use]
    pub fn filter_expression(&self) -> String {
        match (&self.filter, self.port) {
            (Some(filter), _) => filter.clone(),
            (None, Some(port)) => format!("tcp and port {port}"),
            (None, None) => "tcp".to_owned(),
        }
    }
}

/// Reassembly and flow eviction tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Flows without traffic for this long are force-flushed
    pub idle_timeout_secs: u64,
    /// How often idle flows are looked for
    pub flush_interval_ms: u64,
    /// How long a stream that started without a SYN waits for earlier segments
    pub start_grace_ms: u64,
    /// Out-of-order bytes held per direction before the direction is given up
    pub max_pending_bytes: usize,
    /// Largest accepted request line plus header block
    pub max_head_bytes: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            flush_interval_ms: 1000,
            start_grace_ms: 1000,
            max_pending_bytes: 16 * 1024 * 1024,
            max_head_bytes: 64 * 1024,
        }
    }
}

impl ReassemblyConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }
}
