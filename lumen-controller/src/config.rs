//! Daemon configuration.
//!
//! Loaded from a TOML file, every field optional:
//!
//! ```toml
//! [serial]
//! baud_rate = 115200
//! default_port = "/dev/ttyACM0"
//! autorun_program = "warm-white"
//!
//! [store]
//! dir = "/var/lib/lumen"
//! file = "programs.json"
//! restore_on_start = true
//!
//! [controller]
//! window_size = 10
//! resend_delay_ms = 50
//! teardown_timeout_ms = 500
//! ```
//!
//! `LUMEN_CONFIG` names the file; otherwise `./lumen.toml` is used when it
//! exists. `LUMEN_PORT` and `LUMEN_STORE_DIR` override the matching keys.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LUMEN_CONFIG";

/// Config file looked for in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "lumen.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub serial: SerialSection,
    pub store: StoreSection,
    pub controller: ControllerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSection {
    pub baud_rate: u32,
    /// Port to connect to at startup.
    pub default_port: Option<String>,
    /// Program to load and run once connected at startup.
    pub autorun_program: Option<String>,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            default_port: None,
            autorun_program: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub dir: PathBuf,
    pub file: String,
    pub restore_on_start: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            file: "programs.json".to_string(),
            restore_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSection {
    /// Frames allowed in flight before waiting for acks.
    pub window_size: usize,
    pub resend_delay_ms: u64,
    /// Upper bound on drain/flush when stopping or skipping a program.
    pub teardown_timeout_ms: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            window_size: 10,
            resend_delay_ms: 50,
            teardown_timeout_ms: 500,
        }
    }
}

impl ControllerSection {
    pub fn resend_delay(&self) -> Duration {
        Duration::from_millis(self.resend_delay_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

impl Config {
    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Locate and load the config for this process.
    ///
    /// `env` is consulted instead of the process environment so callers
    /// can supply their own lookup.
    pub fn discover(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match env(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(env);
        Ok(config)
    }

    /// Apply `LUMEN_PORT` and `LUMEN_STORE_DIR`.
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(port) = env("LUMEN_PORT").filter(|p| !p.is_empty()) {
            self.serial.default_port = Some(port);
        }
        if let Some(dir) = env("LUMEN_STORE_DIR").filter(|d| !d.is_empty()) {
            self.store.dir = PathBuf::from(dir);
        }
    }

    /// Full path of the store file.
    pub fn store_path(&self) -> PathBuf {
        self.store.dir.join(&self.store.file)
    }

    fn validate(&self) -> Result<()> {
        if self.controller.window_size == 0 {
            return Err(Error::Config("controller.window_size must be at least 1".into()));
        }
        if self.controller.resend_delay_ms == 0 {
            return Err(Error::Config(
                "controller.resend_delay_ms must be at least 1".into(),
            ));
        }
        if self.store.file.is_empty() {
            return Err(Error::Config("store.file cannot be empty".into()));
        }
        Ok(())
    }
}
