//! TOML configuration file loading
//!
//! Supports `~/.config/edge-bridge/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{DuplicateLogin, Mode};
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct BridgeConfigFile {
    /// `bridge` or `gateway`
    #[serde(default)]
    pub mode: Option<Mode>,

    /// Platform connection
    #[serde(default)]
    pub platform: PlatformFileConfig,

    /// Device-facing listener
    #[serde(default)]
    pub device: DeviceFileConfig,

    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
}

/// Platform connection configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlatformFileConfig {
    /// Broker URI (e.g. "ssl://iot-mqtts.example.com:8883")
    pub server_uri: Option<String>,

    /// Bridge identity (bridge mode)
    pub bridge_id: Option<String>,

    /// Gateway device identity (gateway mode)
    pub device_id: Option<String>,

    /// Shared secret
    pub secret: Option<String>,

    /// "secret" or "certificate"
    pub auth: Option<String>,

    /// Client certificate path (certificate auth)
    pub cert_path: Option<PathBuf>,

    /// Client key path (certificate auth)
    pub key_path: Option<PathBuf>,

    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub ack_timeout_secs: Option<u64>,
    pub keep_alive_secs: Option<u64>,
}

/// Device listener configuration
#[derive(Debug, Default, Deserialize)]
pub struct DeviceFileConfig {
    /// Listen address (e.g. "0.0.0.0:8900")
    pub listen_addr: Option<String>,

    /// Single-character frame delimiters
    pub frame_start: Option<String>,
    pub frame_separator: Option<String>,
    pub frame_end: Option<String>,

    /// Maximum frame length in bytes
    pub max_frame_len: Option<usize>,

    /// What to do when a logged-in key logs in again
    pub duplicate_login: Option<DuplicateLogin>,

    /// Close the channel when the platform rejects a login
    pub close_on_login_failure: Option<bool>,
}

/// Reconnect backoff configuration
#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    pub base_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub jitter_low: Option<f64>,
    pub jitter_high: Option<f64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `BridgeConfigFile::default()` if there is no file.
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed
pub fn load_config_file() -> Result<BridgeConfigFile> {
    match config_file_path() {
        Some(path) if path.exists() => load_config_file_from(&path),
        _ => Ok(BridgeConfigFile::default()),
    }
}

/// Load a TOML config file from an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_config_file_from(path: &Path) -> Result<BridgeConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/edge-bridge/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("edge-bridge").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let file: BridgeConfigFile = toml::from_str(
            r#"
            mode = "gateway"

            [platform]
            server_uri = "ssl://iot.example.com:8883"
            device_id = "gw-1"

            [device]
            frame_end = "$"
            duplicate_login = "replace"
            "#,
        )
        .unwrap();

        assert_eq!(file.mode, Some(Mode::Gateway));
        assert_eq!(file.platform.device_id.as_deref(), Some("gw-1"));
        assert!(file.platform.secret.is_none());
        assert_eq!(file.device.frame_end.as_deref(), Some("$"));
        assert_eq!(file.device.duplicate_login, Some(DuplicateLogin::Replace));
        assert!(file.reconnect.base_ms.is_none());
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let file: BridgeConfigFile = toml::from_str("").unwrap();
        assert!(file.mode.is_none());
        assert!(file.platform.server_uri.is_none());
    }

    #[test]
    fn unreadable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_file_from(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mode = [").unwrap();

        assert!(matches!(load_config_file_from(&path).unwrap_err(), Error::Toml(_)));
    }
}
