//! Configuration for the ptybridge binary.
//!
//! Loaded from `~/.ptybridge/config.toml`; a missing or malformed file falls
//! back to the defaults.
//!
//! ```toml
//! winpty_dll = "winpty.dll"
//! eof_poll_ms = 200
//! initial_cols = 80
//! initial_rows = 24
//!
//! [raw_mode]
//! disable_echo = true
//! min_read = 1
//!
//! [log]
//! level = "debug"
//! file = "C:/Users/me/ptybridge.log"
//! ```

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compat::RawMode;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// winpty DLL name or path
    pub winpty_dll: String,
    /// Exit poll period in milliseconds, used as initial delay and repeat
    pub eof_poll_ms: u64,
    /// Size used when the host terminal cannot report one
    pub initial_cols: u16,
    pub initial_rows: u16,
    /// Raw-mode toggles for a Cygwin/MSYS host terminal
    pub raw_mode: RawMode,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            winpty_dll: "winpty.dll".to_string(),
            eof_poll_ms: 200,
            initial_cols: 80,
            initial_rows: 24,
            raw_mode: RawMode::default(),
            log: LogConfig::default(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `ptybridge::driver=debug`
    pub level: String,
    /// Log file; `~/.ptybridge/ptybridge.log` when unset
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Self {
        if let Some(path) = Self::get_config_path() {
            if path.exists() {
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(config) = Self::from_toml_str(&content) {
                        return config;
                    }
                }
            }
        }
        Self::default()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn eof_poll_interval(&self) -> Duration {
        Duration::from_millis(self.eof_poll_ms.max(1))
    }

    pub fn initial_size(&self) -> (u16, u16) {
        (self.initial_cols.max(1), self.initial_rows.max(1))
    }

    /// Configured log file, or the default under the config directory
    pub fn log_path(&self) -> PathBuf {
        self.log
            .file
            .clone()
            .or_else(|| config_dir().map(|dir| dir.join("ptybridge.log")))
            .unwrap_or_else(|| PathBuf::from("ptybridge.log"))
    }
}

fn config_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".ptybridge"))
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
