use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::Path};

pub const DEFAULT_PORT: u16 = 1560;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_SETTLE_MS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HOLD_WINDOW_SECS: u64 = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Numeric device password; travels as hex on the wire.
    pub password: u16,
    /// Bound for every connect, write and read.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Quiet gap that ends a response the device did not terminate.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_settle_ms() -> u64 {
    DEFAULT_SETTLE_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// How long an optimistic value wins over polled data.
    #[serde(default = "default_hold_window_secs")]
    pub hold_window_secs: u64,
}

fn default_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_hold_window_secs() -> u64 {
    DEFAULT_HOLD_WINDOW_SECS
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            hold_window_secs: default_hold_window_secs(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn hold_window(&self) -> Duration {
        Duration::from_secs(self.hold_window_secs)
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards BREEZART_HOST and BREEZART_PASSWORD, when set, override the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = fs::read_to_string(path)?;
        let cfg = Self::from_yaml(&raw)?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, anyhow::Error> {
        use anyhow::Context;

        let expanded = expand_env_placeholders(raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("BREEZART_HOST") {
            cfg.device.host = host;
        }
        if let Ok(password) = std::env::var("BREEZART_PASSWORD") {
            cfg.device.password = password
                .trim()
                .parse()
                .context("BREEZART_PASSWORD must be an integer in 0..=65535")?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(!self.device.host.trim().is_empty(), "device.host cannot be empty");
        anyhow::ensure!(self.device.port != 0, "device.port cannot be 0");
        anyhow::ensure!(
            self.device.timeout_secs > 0,
            "device.timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.polling.interval_secs > 0,
            "polling.interval_secs must be positive"
        );
        Ok(())
    }
}

/// Replace `$(NAME)` and `${NAME}` with the named environment variable.
/// `$$` is a literal `$`; a `$` followed by anything else is kept as is.
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    use anyhow::Context;

    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        let tail = &rest[dollar + 1..];

        let close = match tail.chars().next() {
            Some('$') => {
                out.push('$');
                rest = &tail[1..];
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                rest = tail;
                continue;
            }
        };

        let end = tail
            .find(close)
            .with_context(|| format!("config placeholder is missing its closing '{}'", close))?;
        let name = &tail[1..end];
        let value = std::env::var(name)
            .with_context(|| format!("config refers to unset environment variable {}", name))?;
        out.push_str(&value);
        rest = &tail[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
