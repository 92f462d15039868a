//! Configuration management for the edge bridge
//!
//! Values are layered env > TOML file > defaults. Environment keys carry the
//! `EDGE_BRIDGE_` prefix; the lookup is injectable so loading can be tested
//! without touching the process environment.

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::Delimiters;
use crate::codec::frame::DEFAULT_MAX_FRAME_LEN;
use crate::transport::{AuthMode, BackoffPolicy, TransportOptions};
use crate::{Error, Result};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "EDGE_BRIDGE_";

/// Which orchestrator to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Individually authenticated devices relayed under a bridge identity
    #[default]
    Bridge,
    /// Pre-registered sub-devices behind one gateway device
    Gateway,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bridge" => Ok(Self::Bridge),
            "gateway" => Ok(Self::Gateway),
            other => Err(Error::Config(format!("unknown mode '{other}'"))),
        }
    }
}

/// Policy for a login on a key that already has a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateLogin {
    /// Keep the existing session; a login from another channel is refused
    #[default]
    Reuse,
    /// Replace the existing session and close its channel
    Replace,
}

impl FromStr for DuplicateLogin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reuse" => Ok(Self::Reuse),
            "replace" => Ok(Self::Replace),
            other => Err(Error::Config(format!("unknown duplicate_login policy '{other}'"))),
        }
    }
}

/// How the edge authenticates to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthKind {
    #[default]
    Secret,
    Certificate,
}

impl FromStr for AuthKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "secret" => Ok(Self::Secret),
            "certificate" | "cert" => Ok(Self::Certificate),
            other => Err(Error::Config(format!("unknown auth mode '{other}'"))),
        }
    }
}

/// Edge bridge configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Orchestrator to run
    pub mode: Mode,

    /// Platform connection
    pub platform: PlatformConfig,

    /// Device-facing listener
    pub device: DeviceConfig,

    /// Reconnect backoff
    pub reconnect: BackoffPolicy,
}

/// Platform connection configuration
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Broker URI
    pub server_uri: String,

    /// Bridge identity (bridge mode)
    pub bridge_id: Option<String>,

    /// Gateway device identity (gateway mode)
    pub device_id: Option<String>,

    /// Authentication kind
    pub auth: AuthKind,

    /// Shared secret (secret auth)
    pub secret: Option<String>,

    /// Client certificate (certificate auth)
    pub cert_path: Option<PathBuf>,

    /// Client key (certificate auth)
    pub key_path: Option<PathBuf>,

    /// Connect-complete timeout
    pub connect_timeout: Duration,

    /// Timeout for synchronous platform calls (login, shadow get)
    pub request_timeout: Duration,

    /// Timeout for a device to acknowledge a relayed command
    pub ack_timeout: Duration,

    /// MQTT keep-alive
    pub keep_alive: Duration,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            server_uri: String::new(),
            bridge_id: None,
            device_id: None,
            auth: AuthKind::Secret,
            secret: None,
            cert_path: None,
            key_path: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(120),
        }
    }
}

/// Device listener configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Listen address
    pub listen_addr: String,

    /// Frame delimiters
    pub delimiters: Delimiters,

    /// Maximum frame length in bytes
    pub max_frame_len: usize,

    /// Duplicate-login policy
    pub duplicate_login: DuplicateLogin,

    /// Close the channel when the platform rejects a login
    pub close_on_login_failure: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8900".to_string(),
            delimiters: Delimiters::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            duplicate_login: DuplicateLogin::default(),
            close_on_login_failure: true,
        }
    }
}

impl Config {
    /// Load configuration from the standard file path and process env
    ///
    /// # Errors
    ///
    /// Returns error if the file or an env value cannot be parsed, or the
    /// result fails validation
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file()?;
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Load configuration from an explicit file and a custom env lookup
    ///
    /// # Errors
    ///
    /// Returns error if the file or an env value cannot be parsed, or the
    /// result fails validation
    pub fn load_from<F>(path: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fc = match path {
            Some(path) => file::load_config_file_from(path)?,
            None => file::BridgeConfigFile::default(),
        };
        Self::from_sources(fc, env)
    }

    /// Merge env over a parsed file over defaults, then validate
    ///
    /// # Errors
    ///
    /// Returns error if an env value cannot be parsed or validation fails
    pub fn from_sources<F>(fc: file::BridgeConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| env(&format!("{ENV_PREFIX}{name}"));
        let defaults = Self::default();

        let mode = match var("MODE") {
            Some(v) => v.parse()?,
            None => fc.mode.unwrap_or(defaults.mode),
        };

        let pf = fc.platform;
        let pd = defaults.platform;
        let auth = match var("AUTH").or(pf.auth) {
            Some(v) => v.parse()?,
            None => pd.auth,
        };
        let platform = PlatformConfig {
            server_uri: var("SERVER_URI").or(pf.server_uri).unwrap_or(pd.server_uri),
            bridge_id: var("BRIDGE_ID").or(pf.bridge_id),
            device_id: var("DEVICE_ID").or(pf.device_id),
            auth,
            secret: var("SECRET").or(pf.secret),
            cert_path: var("CERT_PATH").map(PathBuf::from).or(pf.cert_path),
            key_path: var("KEY_PATH").map(PathBuf::from).or(pf.key_path),
            connect_timeout: secs(parsed(&var, "CONNECT_TIMEOUT_SECS")?.or(pf.connect_timeout_secs))
                .unwrap_or(pd.connect_timeout),
            request_timeout: secs(parsed(&var, "REQUEST_TIMEOUT_SECS")?.or(pf.request_timeout_secs))
                .unwrap_or(pd.request_timeout),
            ack_timeout: secs(parsed(&var, "ACK_TIMEOUT_SECS")?.or(pf.ack_timeout_secs))
                .unwrap_or(pd.ack_timeout),
            keep_alive: secs(parsed(&var, "KEEP_ALIVE_SECS")?.or(pf.keep_alive_secs))
                .unwrap_or(pd.keep_alive),
        };

        let df = fc.device;
        let dd = defaults.device;
        let delimiters = Delimiters {
            start: delimiter(var("FRAME_START").or(df.frame_start), dd.delimiters.start)?,
            separator: delimiter(var("FRAME_SEPARATOR").or(df.frame_separator), dd.delimiters.separator)?,
            end: delimiter(var("FRAME_END").or(df.frame_end), dd.delimiters.end)?,
        };
        let duplicate_login = match var("DUPLICATE_LOGIN") {
            Some(v) => v.parse()?,
            None => df.duplicate_login.unwrap_or(dd.duplicate_login),
        };
        let device = DeviceConfig {
            listen_addr: var("LISTEN_ADDR").or(df.listen_addr).unwrap_or(dd.listen_addr),
            delimiters,
            max_frame_len: parsed(&var, "MAX_FRAME_LEN")?
                .or(df.max_frame_len)
                .unwrap_or(dd.max_frame_len),
            duplicate_login,
            close_on_login_failure: parsed(&var, "CLOSE_ON_LOGIN_FAILURE")?
                .or(df.close_on_login_failure)
                .unwrap_or(dd.close_on_login_failure),
        };

        let rf = fc.reconnect;
        let rd = defaults.reconnect;
        let reconnect = BackoffPolicy {
            base: millis(parsed(&var, "RECONNECT_BASE_MS")?.or(rf.base_ms)).unwrap_or(rd.base),
            multiplier: parsed(&var, "RECONNECT_MULTIPLIER")?
                .or(rf.multiplier)
                .unwrap_or(rd.multiplier),
            min: millis(parsed(&var, "RECONNECT_MIN_MS")?.or(rf.min_ms)).unwrap_or(rd.min),
            max: millis(parsed(&var, "RECONNECT_MAX_MS")?.or(rf.max_ms)).unwrap_or(rd.max),
            jitter: (
                parsed(&var, "RECONNECT_JITTER_LOW")?
                    .or(rf.jitter_low)
                    .unwrap_or(rd.jitter.0),
                parsed(&var, "RECONNECT_JITTER_HIGH")?
                    .or(rf.jitter_high)
                    .unwrap_or(rd.jitter.1),
            ),
        };

        let config = Self {
            mode,
            platform,
            device,
            reconnect,
        };
        config.validate()?;
        Ok(config)
    }

    /// Platform identity for the selected mode
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        match self.mode {
            Mode::Bridge => self.platform.bridge_id.as_deref(),
            Mode::Gateway => self.platform.device_id.as_deref(),
        }
        .filter(|id| !id.is_empty())
    }

    /// Authentication material for the platform connection
    ///
    /// # Errors
    ///
    /// Returns error if the material for the selected auth kind is missing
    pub fn auth_mode(&self) -> Result<AuthMode> {
        match self.platform.auth {
            AuthKind::Secret => self
                .platform
                .secret
                .clone()
                .filter(|s| !s.is_empty())
                .map(|secret| AuthMode::Secret { secret })
                .ok_or_else(|| Error::Config("secret auth requires a secret".to_string())),
            AuthKind::Certificate => {
                let cert_path = self.platform.cert_path.clone().ok_or_else(|| {
                    Error::Config("certificate auth requires cert_path".to_string())
                })?;
                let key_path = self
                    .platform
                    .key_path
                    .clone()
                    .unwrap_or_else(|| cert_path.clone());
                Ok(AuthMode::Certificate {
                    cert_path,
                    key_path,
                })
            }
        }
    }

    /// Options for the platform transport client
    ///
    /// # Errors
    ///
    /// Returns error if identity or auth material is missing
    pub fn transport_options(&self) -> Result<TransportOptions> {
        let identity = self
            .identity()
            .ok_or_else(|| Error::Config(format!("{:?} mode requires an identity", self.mode)))?;

        Ok(TransportOptions {
            server_uri: self.platform.server_uri.clone(),
            identity: identity.to_string(),
            auth: self.auth_mode()?,
            connect_timeout: self.platform.connect_timeout,
            keep_alive: self.platform.keep_alive,
            backoff: self.reconnect,
        })
    }

    /// Check the configuration for values that cannot work
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.platform.server_uri.trim().is_empty() {
            return Err(Error::Config("server_uri must not be empty".to_string()));
        }
        self.transport_options()?;

        let d = self.device.delimiters;
        if d.start == d.separator || d.start == d.end || d.separator == d.end {
            return Err(Error::Config("frame delimiters must be distinct".to_string()));
        }
        if self.device.max_frame_len == 0 {
            return Err(Error::Config("max_frame_len must be positive".to_string()));
        }

        let r = &self.reconnect;
        if r.base.is_zero() || r.max.is_zero() {
            return Err(Error::Config(
                "reconnect base and max must be positive".to_string(),
            ));
        }
        if r.min > r.max {
            return Err(Error::Config(format!(
                "reconnect min {:?} exceeds max {:?}",
                r.min, r.max
            )));
        }
        if r.multiplier < 1.0 || !r.multiplier.is_finite() {
            return Err(Error::Config(format!(
                "reconnect multiplier {} must be at least 1",
                r.multiplier
            )));
        }
        let (low, high) = r.jitter;
        if low <= 0.0 || low > high || !high.is_finite() {
            return Err(Error::Config(format!(
                "reconnect jitter range [{low}, {high}] is invalid"
            )));
        }

        Ok(())
    }
}

fn secs(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_secs)
}

fn millis(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_millis)
}

fn parsed<T, V>(var: &V, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {ENV_PREFIX}{name} '{raw}': {e}")))
        })
        .transpose()
}

fn delimiter(value: Option<String>, default: u8) -> Result<u8> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.as_bytes() {
        [b] if b.is_ascii() && !b.is_ascii_alphanumeric() => Ok(*b),
        _ => Err(Error::Config(format!(
            "frame delimiter '{value}' must be a single ASCII symbol"
        ))),
    }
}
