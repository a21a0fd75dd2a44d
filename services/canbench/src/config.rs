//! canbench configuration
//!
//! Loaded in layers: built-in defaults, an optional YAML/TOML/JSON file,
//! then `CANBENCH_*` environment variables (`__` separates nested keys, e.g.
//! `CANBENCH_CHANNEL__ARBITRATION_BITRATE=250000`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::config_loader;
use common::logging::LogConfig;
use errors::{CanError, Result};
use serde::{Deserialize, Serialize};
use signal_db::Saturation;
use tracing::Level;

use crate::driver::{ChannelConfig, DeviceModel};
use crate::txlog::{DEFAULT_LOG_CAPACITY, MAX_LOG_CAPACITY};

pub const ENV_PREFIX: &str = "CANBENCH_";

/// Which adapter backend the session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverBackend {
    /// ZLG vendor library (falls back to offline when it cannot be loaded)
    #[default]
    Zlg,
    /// In-process echo adapter
    Loopback,
    /// No adapter; transmissions are only logged
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub backend: DriverBackend,
    /// Explicit path of the vendor library
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_path: Option<PathBuf>,
    /// SDK directory entered around native calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub device_model: DeviceModel,
    pub device_index: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            backend: DriverBackend::Zlg,
            library_path: None,
            working_dir: None,
            device_model: DeviceModel::UsbCanFd200U,
            device_index: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default level when RUST_LOG is not set
    pub level: String,
    /// Log directory (CANBENCH_LOG_DIR wins when set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    pub file: bool,
    pub json: bool,
    /// Transmission log entries kept in memory
    pub capacity: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: true,
            json: false,
            capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl LogSettings {
    pub fn level(&self) -> Result<Level> {
        self.level
            .parse::<Level>()
            .map_err(|_| CanError::config(format!("invalid log level '{}'", self.level)))
    }

    /// Subscriber configuration for `common::logging`
    pub fn to_log_config(&self) -> Result<LogConfig> {
        common::logging::init_log_root(self.dir.as_deref());
        Ok(LogConfig {
            level: self.level()?,
            log_dir: common::logging::get_log_root(),
            enable_file: self.file,
            enable_json: self.json,
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CyclicSettings {
    /// Period used when neither the command line nor the database gives one
    pub default_period_ms: u64,
    pub min_period_ms: u64,
    /// What to do with values outside a signal's raw range
    pub saturation: Saturation,
}

impl Default for CyclicSettings {
    fn default() -> Self {
        Self {
            default_period_ms: 100,
            min_period_ms: 1,
            saturation: Saturation::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_ms: u64,
    /// Broadcast buffer per subscriber
    pub buffer: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            buffer: 1024,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanBenchConfig {
    pub driver: DriverConfig,
    pub channel: ChannelConfig,
    pub log: LogSettings,
    pub cyclic: CyclicSettings,
    pub monitor: MonitorSettings,
}

impl CanBenchConfig {
    /// Load from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let config: Self = config_loader::load_layered(&Self::default(), path, env_prefix)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.channel.validate()?;
        self.log.level()?;

        if !(1..=MAX_LOG_CAPACITY).contains(&self.log.capacity) {
            return Err(CanError::config(format!(
                "log.capacity must be within 1..={}",
                MAX_LOG_CAPACITY
            )));
        }
        if self.cyclic.min_period_ms == 0 {
            return Err(CanError::config("cyclic.min_period_ms must be positive"));
        }
        if self.cyclic.default_period_ms < self.cyclic.min_period_ms {
            return Err(CanError::config(
                "cyclic.default_period_ms is below cyclic.min_period_ms",
            ));
        }
        if self.monitor.poll_interval_ms == 0 || self.monitor.buffer == 0 {
            return Err(CanError::config(
                "monitor.poll_interval_ms and monitor.buffer must be positive",
            ));
        }
        Ok(())
    }
}
