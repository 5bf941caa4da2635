//! Node configuration: defaults, optional TOML file, CLI overrides on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fs_enum::FileFilter;
use crate::logger::LogFormat;
use crate::protocol::{
    timeouts, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT, FRAME_LEN_FIELD_MAX, MAX_CONNECTIONS,
    MAX_FILES, MAX_FRAME_SIZE, MAX_PATH_LEN, RESCAN_CYCLE,
};
use crate::snapshot::ScanLimits;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory being served (server) or mirrored into (client)
    pub root: PathBuf,
    pub port: u16,
    /// Server listen address; `0.0.0.0:<port>` when unset
    pub bind: Option<String>,
    pub tick_interval_ms: u64,
    /// Full rescan every N server ticks, refresh in between
    pub rescan_cycle: u64,
    pub max_connections: usize,
    pub max_files: usize,
    pub max_path_len: usize,
    pub max_frame_size: usize,
    pub max_message_size: usize,
    #[serde(flatten)]
    pub filter: FileFilter,
    pub log_file: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            port: DEFAULT_PORT,
            bind: None,
            tick_interval_ms: timeouts::TICK_MS,
            rescan_cycle: RESCAN_CYCLE,
            max_connections: MAX_CONNECTIONS,
            max_files: MAX_FILES,
            max_path_len: MAX_PATH_LEN,
            max_frame_size: MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            filter: FileFilter::default(),
            log_file: None,
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s).context("invalid config")?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("in {}", path.display()))
    }

    /// Defaults, or the file at `path` when one is given
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be non-zero");
        }
        if self.rescan_cycle == 0 {
            anyhow::bail!("rescan_cycle must be non-zero");
        }
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be non-zero");
        }
        if self.max_path_len < 2 {
            anyhow::bail!("max_path_len must allow at least one name byte");
        }
        if self.max_frame_size == 0 || self.max_frame_size > FRAME_LEN_FIELD_MAX {
            anyhow::bail!(
                "max_frame_size must be within 1..={} bytes",
                FRAME_LEN_FIELD_MAX
            );
        }
        if self.max_message_size > u32::MAX as usize {
            anyhow::bail!("max_message_size cannot exceed {} bytes", u32::MAX);
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn scan_limits(&self) -> ScanLimits {
        ScanLimits {
            max_files: self.max_files,
            max_path_len: self.max_path_len,
        }
    }

    pub fn bind_addr(&self) -> String {
        self.bind
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }

    /// `host`, `host:port`, `ip` or `[v6]:port`; the configured port fills
    /// in when none is given.
    pub fn server_addr(&self, address: &str) -> String {
        if address.parse::<SocketAddr>().is_ok() {
            return address.to_string();
        }
        if let Ok(ip) = address.parse::<IpAddr>() {
            return SocketAddr::new(ip, self.port).to_string();
        }
        match address.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
            _ => format!("{}:{}", address, self.port),
        }
    }
}
