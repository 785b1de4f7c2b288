//! # Configuration Management
//!
//! Centralized configuration for the coordinator, its listener and the
//! key material both use.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - TOML strings via `from_toml()`
//! - Environment overrides (`COVERT_MUX_*`) via `from_env()` / `apply_env()`
//! - Direct instantiation with defaults
//!
//! Durations are written in milliseconds, log levels as lowercase strings and
//! key material as hex.

use crate::core::token::TransportMode;
use crate::error::{ProtocolError, Result};
use crate::utils::crypto::decode_key_hex;
use crate::utils::timeout;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::Level;
use x25519_dalek::StaticSecret;

/// Listen address used when an obfuscation layer fronts the listener
pub const PLUGGABLE_LISTEN_ADDRESS: &str = "127.0.0.1:55000";

/// Highest obfuscation level understood by the token codec
pub const MAX_OBFS_LEVEL: u8 = 3;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TunnelConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub keys: KeyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TunnelConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `COVERT_MUX_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
            match std::env::var(name) {
                Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                    ProtocolError::ConfigError(format!("Invalid value for {name}: '{raw}'"))
                }),
                Err(_) => Ok(None),
            }
        }

        if let Ok(domain) = std::env::var("COVERT_MUX_CTL_DOMAIN") {
            self.coordinator.ctl_domain = domain;
        }
        if let Ok(resolvers) = std::env::var("COVERT_MUX_RESOLVERS") {
            self.coordinator.resolvers = resolvers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(n) = parsed::<usize>("COVERT_MUX_REQ_NUM")? {
            self.coordinator.req_num = n;
        }
        if let Some(ms) = parsed::<u64>("COVERT_MUX_REQUEST_INTERVAL_MS")? {
            self.coordinator.request_interval = Duration::from_millis(ms);
        }
        if let Ok(ip) = std::env::var("COVERT_MUX_REQUESTER_IP") {
            self.coordinator.requester_ip = ip;
        }
        if let Ok(addr) = std::env::var("COVERT_MUX_LISTEN_ADDRESS") {
            self.listener.address = addr;
        }
        if let Some(ms) = parsed::<u64>("COVERT_MUX_HANDSHAKE_TIMEOUT_MS")? {
            self.listener.handshake_timeout = Duration::from_millis(ms);
        }
        if let Ok(secret) = std::env::var("COVERT_MUX_LOCAL_SECRET") {
            self.keys.local_secret = Some(secret);
        }
        if let Ok(public) = std::env::var("COVERT_MUX_REMOTE_PUBLIC") {
            self.keys.remote_public = Some(public);
        }
        if let Some(level) = parsed::<Level>("COVERT_MUX_LOG_LEVEL")? {
            self.logging.log_level = level;
        }
        Ok(())
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Address the listener should bind, accounting for an obfuscation layer
    pub fn effective_listen_address(&self) -> &str {
        if self.coordinator.obfs_level > 0 {
            PLUGGABLE_LISTEN_ADDRESS
        } else {
            &self.listener.address
        }
    }

    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.coordinator.validate());
        errors.extend(self.listener.validate());
        errors.extend(self.keys.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Request scheduling and token contents
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    /// Domain the tokens are prefixed to
    pub ctl_domain: String,

    /// DNS resolvers, tried round-robin (e.g., "8.8.8.8:53")
    pub resolvers: Vec<String>,

    /// Pool capacity and requested connection count
    pub req_num: usize,

    /// Spacing between token emissions
    #[serde(with = "duration_serde")]
    pub request_interval: Duration,

    /// Streams serviced per write-ready event
    pub swapcount: usize,

    /// How the server reaches the coordinator
    pub mode: TransportMode,

    /// 0 = none, 1-2 = certificate-based layer, 3 = padding-based layer
    pub obfs_level: u8,

    /// Certificate shared with the obfuscation layer (levels 1-2)
    #[serde(default)]
    pub certificate: Option<String>,

    /// Address the server should connect back to
    pub requester_ip: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ctl_domain: String::from("ctl.example.com"),
            resolvers: vec![String::from("8.8.8.8:53")],
            req_num: 3,
            request_interval: timeout::REQUEST_INTERVAL,
            swapcount: crate::protocol::pool::DEFAULT_SWAPCOUNT,
            mode: TransportMode::Vps,
            obfs_level: 0,
            certificate: None,
            requester_ip: String::from("127.0.0.1"),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.ctl_domain.trim_matches('.').is_empty() {
            errors.push("Control domain cannot be empty".to_string());
        } else if self
            .ctl_domain
            .trim_matches('.')
            .split('.')
            .any(|l| l.is_empty() || l.len() > 63)
        {
            errors.push(format!("Invalid control domain: '{}'", self.ctl_domain));
        }

        if self.resolvers.is_empty() {
            errors.push("At least one resolver must be configured".to_string());
        }
        for resolver in &self.resolvers {
            if resolver.parse::<SocketAddr>().is_err() {
                errors.push(format!(
                    "Invalid resolver address: '{resolver}' (expected format: '8.8.8.8:53')"
                ));
            }
        }

        if self.req_num == 0 {
            errors.push("req_num must be greater than 0".to_string());
        } else if self.req_num > 255 {
            errors.push(format!(
                "req_num too large: {} (token field holds at most 255)",
                self.req_num
            ));
        }

        if self.request_interval.as_millis() < 10 {
            errors.push("Request interval too short (minimum: 10ms)".to_string());
        } else if self.request_interval.as_secs() > 60 {
            errors.push("Request interval too long (maximum: 60s)".to_string());
        }

        if self.swapcount == 0 {
            errors.push("swapcount must be greater than 0".to_string());
        }

        if self.obfs_level > MAX_OBFS_LEVEL {
            errors.push(format!(
                "Invalid obfuscation level: {} (valid range: 0-{MAX_OBFS_LEVEL})",
                self.obfs_level
            ));
        } else if (1..=2).contains(&self.obfs_level) && self.certificate.is_none() {
            errors.push(
                "certificate must be specified for obfuscation levels 1 and 2".to_string(),
            );
        }

        if self.requester_ip.parse::<IpAddr>().is_err() {
            errors.push(format!("Invalid requester IP: '{}'", self.requester_ip));
        }

        errors
    }
}

/// Inbound connection handling
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Listen address (e.g., "0.0.0.0:8000")
    pub address: String,

    /// Upper bound on waiting for the authentication blob
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Pause before the first handshake read
    #[serde(with = "duration_serde")]
    pub handshake_initial_delay: Duration,

    /// Empty reads tolerated during the handshake
    pub max_empty_reads: u32,

    /// Timeout for graceful shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0:8000"),
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            handshake_initial_delay: timeout::HANDSHAKE_INITIAL_DELAY,
            max_empty_reads: crate::protocol::handshake::DEFAULT_MAX_EMPTY_READS,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ListenerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Listen address cannot be empty".to_string());
        } else if self.address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid listen address format: '{}' (expected format: '0.0.0.0:8000')",
                self.address
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.handshake_initial_delay >= self.handshake_timeout {
            errors.push("Handshake initial delay must be shorter than the timeout".to_string());
        }

        if self.max_empty_reads == 0 {
            errors.push("max_empty_reads must be greater than 0".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Hex-encoded key material
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct KeyConfig {
    /// Coordinator's static X25519 secret (64 hex chars)
    #[serde(default)]
    pub local_secret: Option<String>,

    /// Remote side's Ed25519 verifying key (64 hex chars)
    #[serde(default)]
    pub remote_public: Option<String>,
}

impl KeyConfig {
    pub fn local_secret(&self) -> Result<StaticSecret> {
        let hex_str = self
            .local_secret
            .as_deref()
            .ok_or_else(|| ProtocolError::ConfigError("keys.local_secret is not set".into()))?;
        Ok(StaticSecret::from(decode_key_hex::<32>(hex_str)?))
    }

    pub fn remote_public(&self) -> Result<VerifyingKey> {
        let hex_str = self
            .remote_public
            .as_deref()
            .ok_or_else(|| ProtocolError::ConfigError("keys.remote_public is not set".into()))?;
        VerifyingKey::from_bytes(&decode_key_hex::<32>(hex_str)?)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid remote public key: {e}")))
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.local_secret.is_some() {
            if let Err(e) = self.local_secret() {
                errors.push(format!("keys.local_secret: {e}"));
            }
        }
        if self.remote_public.is_some() {
            if let Err(e) = self.remote_public() {
                errors.push(format!("keys.remote_public: {e}"));
            }
        }
        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("covert-mux"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            match self.log_file_path {
                Some(ref path) => {
                    if let Some(parent) = Path::new(path).parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            errors.push(format!(
                                "Log file directory does not exist: {}",
                                parent.display()
                            ));
                        }
                    }
                }
                None => errors
                    .push("log_file_path must be specified when log_to_file is true".to_string()),
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations as milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// tracing::Level as a lowercase string
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
