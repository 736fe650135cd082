//! Client configuration parsed from environment variables or built in code.

use std::time::Duration;

use url::Url;

use crate::credentials::KeyRotation;
use crate::error::{Error, TransportError};

pub const DEFAULT_DEVICE_TYPE: &str = "trim-rpc";
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_PONG_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Which websocket channel of the appliance to attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Channel {
    #[default]
    Main,
    Timer,
}

impl Channel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Timer => "timer",
        }
    }
}

/// Transport keepalive. Fixed per client; calls cannot override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepalivePolicy {
    pub interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
        }
    }
}

/// Exponential delay between failed reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay after `attempt` consecutive failures (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << shift).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        }
    }
}

/// Application-level `user.active` probe run by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// `http(s)://host[:port]` of the appliance.
    pub address: String,
    pub channel: Channel,
    pub username: String,
    pub password: String,
    pub device_type: String,
    pub device_name: String,
    pub stay_logged_in: bool,
    /// Accept self-signed appliance certificates on `wss://`.
    pub accept_invalid_certs: bool,
    pub handshake_timeout: Duration,
    pub keepalive: KeepalivePolicy,
    /// `None` disables the heartbeat.
    pub heartbeat: Option<Heartbeat>,
    pub reconnect_backoff: Backoff,
    pub key_rotation: KeyRotation,
}

impl ClientConfig {
    /// Config for `address` with every optional field at its default.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            channel: Channel::default(),
            username: String::new(),
            password: String::new(),
            device_type: DEFAULT_DEVICE_TYPE.to_owned(),
            device_name: default_device_name(),
            stay_logged_in: true,
            accept_invalid_certs: false,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            keepalive: KeepalivePolicy::default(),
            heartbeat: Some(Heartbeat::default()),
            reconnect_backoff: Backoff::default(),
            key_rotation: KeyRotation::default(),
        }
    }

    #[must_use]
    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Build typed client config from environment variables.
    ///
    /// Required:
    /// - `TRIM_ADDRESS`: appliance base URL
    /// - `TRIM_USERNAME` and `TRIM_PASSWORD`
    ///
    /// Optional:
    /// - `TRIM_CHANNEL`: `main` (default) or `timer`
    /// - `TRIM_DEVICE_NAME`: default `<os>-Client`
    /// - `TRIM_ACCEPT_INVALID_CERTS`: default false
    /// - `TRIM_HEARTBEAT_SECS`: default 60, `0` disables
    /// - `TRIM_KEY_ROTATION`: `credential` (default) or `request`
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for missing required values or unparsable ones.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for missing required values or unparsable ones.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::new(required(&lookup, "TRIM_ADDRESS")?);

        config.channel = parse_channel(lookup("TRIM_CHANNEL").as_deref())?;
        config.username = required(&lookup, "TRIM_USERNAME")?;
        config.password = required(&lookup, "TRIM_PASSWORD")?;

        if let Some(name) = lookup("TRIM_DEVICE_NAME") {
            config.device_name = name;
        }
        config.accept_invalid_certs = parse_bool("TRIM_ACCEPT_INVALID_CERTS", lookup("TRIM_ACCEPT_INVALID_CERTS"))?;
        config.heartbeat = match lookup("TRIM_HEARTBEAT_SECS") {
            None => Some(Heartbeat::default()),
            Some(raw) => match raw.parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Heartbeat { interval: Duration::from_secs(secs), ..Heartbeat::default() }),
                Err(_) => return Err(Error::Config(format!("invalid TRIM_HEARTBEAT_SECS: {raw}"))),
            },
        };
        config.key_rotation = parse_key_rotation(lookup("TRIM_KEY_ROTATION").as_deref())?;

        Ok(config)
    }

    /// Websocket URL: `<ws|wss>://<host>[:port]/websocket?type=<channel>`.
    ///
    /// `https` and `wss` addresses map to `wss`, everything else to `ws`. An
    /// address without a scheme is read as `http`. Userinfo, path, query and
    /// fragment of the configured address are dropped.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidAddress`] when the address does not parse or
    /// has no host.
    pub fn endpoint(&self) -> Result<String, TransportError> {
        let invalid = || TransportError::InvalidAddress(self.address.clone());
        let address = self.address.trim();
        let parsed = if address.contains("://") {
            Url::parse(address)
        } else {
            Url::parse(&format!("http://{address}"))
        }
        .map_err(|_| invalid())?;

        let host = parsed.host_str().filter(|host| !host.is_empty()).ok_or_else(invalid)?;
        let scheme = match parsed.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        let mut url = Url::parse(&format!("{scheme}://{authority}")).map_err(|_| invalid())?;
        url.set_path("/websocket");
        url.set_query(Some(&format!("type={}", self.channel.as_str())));
        Ok(url.into())
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, Error> {
    lookup(key)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::Config(format!("{key} is required")))
}

fn default_device_name() -> String {
    format!("{}-Client", std::env::consts::OS)
}

fn parse_channel(raw: Option<&str>) -> Result<Channel, Error> {
    match raw.unwrap_or("main") {
        "main" => Ok(Channel::Main),
        "timer" => Ok(Channel::Timer),
        other => Err(Error::Config(format!("unknown TRIM_CHANNEL: {other}"))),
    }
}

fn parse_bool(key: &str, raw: Option<String>) -> Result<bool, Error> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("") => Ok(false),
        Some("1" | "true" | "yes") => Ok(true),
        Some("0" | "false" | "no") => Ok(false),
        Some(other) => Err(Error::Config(format!("invalid {key}: {other}"))),
    }
}

fn parse_key_rotation(raw: Option<&str>) -> Result<KeyRotation, Error> {
    match raw.unwrap_or("credential") {
        "credential" => Ok(KeyRotation::PerCredential),
        "request" => Ok(KeyRotation::PerRequest),
        other => Err(Error::Config(format!(
            "unsupported TRIM_KEY_ROTATION '{other}' (expected 'credential' or 'request')"
        ))),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
