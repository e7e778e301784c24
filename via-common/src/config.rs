//! Configuration loading and default path resolution
//!
//! Values are resolved in priority order:
//! 1. Command-line argument (highest, merged in the binary crate)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file path
    pub database_path: PathBuf,
    /// OBD-II adapter port (None = auto-detect / simulate)
    pub obd_port: Option<String>,
    /// Seconds between persisted engine rows (readings are sampled faster)
    pub obd_log_interval_s: f64,
    /// Use the simulated GPS source instead of hardware
    pub gps_simulate: bool,
    /// GPS serial port (unused while gps_simulate is true)
    pub gps_port: Option<String>,
    /// GPS serial baud rate
    pub gps_baud_rate: u32,
    /// Milliseconds between GPS fixes
    pub gps_update_interval_ms: u64,
    /// Milliseconds between Bluetooth device polls
    pub bt_poll_interval_ms: u64,
    /// Milliseconds between media player polls while a device is connected
    pub media_poll_interval_ms: u64,
    /// Default log filter when RUST_LOG is not set
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            obd_port: None,
            obd_log_interval_s: 1.0,
            gps_simulate: true,
            gps_port: None,
            gps_baud_rate: 9600,
            gps_update_interval_ms: 2000,
            bt_poll_interval_ms: 2000,
            media_poll_interval_ms: 1000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// `cli_path` takes priority over the `VIA_CONFIG` environment variable,
    /// which takes priority over the platform config directory. A missing
    /// file is not an error; defaults are used.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_file(cli_path) {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)?;
                toml::from_str(&contents)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
            }
            _ => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (names shared with the
    /// companion deployment scripts).
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_path = database_path_from_url(&url);
        }
        if let Ok(port) = std::env::var("OBD_PORT") {
            self.obd_port = Some(port);
        }
        if let Ok(v) = std::env::var("OBD_LOG_INTERVAL_S") {
            if let Ok(secs) = v.parse() {
                self.obd_log_interval_s = secs;
            }
        }
        if let Ok(v) = std::env::var("GPS_SIMULATE") {
            self.gps_simulate = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(port) = std::env::var("GPS_PORT") {
            self.gps_port = Some(port);
        }
        if let Ok(v) = std::env::var("GPS_BAUD_RATE") {
            if let Ok(baud) = v.parse() {
                self.gps_baud_rate = baud;
            }
        }
        if let Ok(v) = std::env::var("GPS_UPDATE_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.gps_update_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("BT_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.bt_poll_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("MEDIA_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.media_poll_interval_ms = ms;
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log_level = level;
        }
    }
}

/// Locate the config file: CLI argument, then VIA_CONFIG, then the
/// platform config directory.
fn resolve_config_file(cli_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("VIA_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|d| d.join("via").join("config.toml"))
}

/// Accept either a `sqlite://` URL (scripts pass DATABASE_URL that way) or
/// a bare filesystem path.
fn database_path_from_url(url: &str) -> PathBuf {
    let trimmed = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    PathBuf::from(trimmed)
}

/// Get OS-dependent default database path
fn default_database_path() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/via/dashboard.db (or /var/lib/via system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("via"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/via"))
            .join("dashboard.db")
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("via"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/via"))
            .join("dashboard.db")
    } else {
        dirs::data_local_dir()
            .map(|d| d.join("via"))
            .unwrap_or_else(|| PathBuf::from("./via_data"))
            .join("dashboard.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bt_poll_interval_ms, 2000);
        assert_eq!(config.media_poll_interval_ms, 1000);
        assert_eq!(config.gps_update_interval_ms, 2000);
        assert_eq!(config.gps_baud_rate, 9600);
        assert!(config.gps_simulate);
        assert_eq!(config.obd_log_interval_s, 1.0);
        assert!(config.obd_port.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str("bt_poll_interval_ms = 500").unwrap();
        assert_eq!(config.bt_poll_interval_ms, 500);
        assert_eq!(config.media_poll_interval_ms, 1000);
        assert!(config.gps_simulate);
    }

    #[test]
    fn test_database_path_from_url() {
        assert_eq!(
            database_path_from_url("sqlite:///tmp/dash.db"),
            PathBuf::from("/tmp/dash.db")
        );
        assert_eq!(
            database_path_from_url("/tmp/dash.db"),
            PathBuf::from("/tmp/dash.db")
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("BT_POLL_INTERVAL_MS", "750");
        std::env::set_var("GPS_SIMULATE", "false");
        std::env::set_var("OBD_PORT", "/dev/ttyUSB1");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.bt_poll_interval_ms, 750);
        assert!(!config.gps_simulate);
        assert_eq!(config.obd_port.as_deref(), Some("/dev/ttyUSB1"));

        std::env::remove_var("BT_POLL_INTERVAL_MS");
        std::env::remove_var("GPS_SIMULATE");
        std::env::remove_var("OBD_PORT");
    }

    #[test]
    #[serial]
    fn test_env_override_ignores_garbage() {
        std::env::set_var("GPS_UPDATE_INTERVAL_MS", "not-a-number");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.gps_update_interval_ms, 2000);

        std::env::remove_var("GPS_UPDATE_INTERVAL_MS");
    }
}
