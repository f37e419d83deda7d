use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Contents of `keeper.toml`. Every field has a default, so an empty or
/// missing file is a valid configuration.
#[derive(Debug, Deserialize)]
pub struct KeeperConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            broker: BrokerConfig::default(),
            telemetry: TelemetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Write `audit/audit.jsonl` under the data directory.
    #[serde(default = "default_true")]
    pub audit: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            audit: default_true(),
        }
    }
}

impl BrokerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_timeout_secs() -> u64 {
    6 * 60 * 60
}
fn default_max_output_bytes() -> usize {
    1_000_000
}
fn default_true() -> bool {
    true
}
fn default_sample_interval_secs() -> u64 {
    15
}
fn default_level() -> String {
    "info".to_string()
}

impl KeeperConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read config file '{}'", path.display())
                })
            }
        };
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Invalid config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.broker.default_timeout_secs == 0 {
            anyhow::bail!("broker.default_timeout_secs must be positive");
        }
        if self.broker.default_timeout_secs > self.broker.max_timeout_secs {
            anyhow::bail!("broker.default_timeout_secs exceeds broker.max_timeout_secs");
        }
        if self.telemetry.sample_interval_secs == 0 {
            anyhow::bail!("telemetry.sample_interval_secs must be positive");
        }
        Ok(())
    }
}
