//! # Configuration Management
//!
//! Centralized configuration for discovery clients and lookup services.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides (`DISCOVERY_*`)
//!
//! The format list is turned into an explicit provider list by
//! [`FormatConfig::providers`]; nothing is discovered implicitly.

use crate::constraints::{InvocationConstraint, InvocationConstraints};
use crate::core::packet::MIN_PACKET_SIZE;
use crate::error::{DiscoveryError, Result};
use crate::format::hmac::{self, HmacSha256Format};
use crate::format::plaintext::{self, Plaintext};
use crate::format::{FormatProvider, FormatRegistry};
use crate::marshal::{FramedMarshaller, MarshalContext, DEFAULT_MAX_REGISTRAR_SIZE};
use crate::protocol::{
    Discovery, Locator, MulticastGroups, ProtocolGeneration, DEFAULT_MAX_PACKET_SIZE, DEFAULT_SOCKET_TIMEOUT, DEFAULT_TIME_TO_LIVE, DISCOVERY_PORT,
    MULTICAST_ANNOUNCEMENT_GROUP, MULTICAST_REQUEST_GROUP,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// Main discovery configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub multicast: MulticastConfig,

    #[serde(default)]
    pub unicast: UnicastConfig,

    #[serde(default)]
    pub formats: FormatConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DiscoveryConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| DiscoveryError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| DiscoveryError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| DiscoveryError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `DISCOVERY_*` environment variables.
    ///
    /// Unparseable numeric values are reported rather than ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(size) = std::env::var("DISCOVERY_MAX_PACKET_SIZE") {
            config.multicast.max_packet_size = parse_env("DISCOVERY_MAX_PACKET_SIZE", &size)?;
        }

        if let Ok(ttl) = std::env::var("DISCOVERY_TTL") {
            config.multicast.time_to_live = parse_env("DISCOVERY_TTL", &ttl)?;
        }

        if let Ok(interface) = std::env::var("DISCOVERY_INTERFACE") {
            config.multicast.interface = Some(interface);
        }

        if let Ok(port) = std::env::var("DISCOVERY_UNICAST_PORT") {
            config.unicast.port = parse_env("DISCOVERY_UNICAST_PORT", &port)?;
        }

        if let Ok(timeout) = std::env::var("DISCOVERY_SOCKET_TIMEOUT_MS") {
            let millis: u64 = parse_env("DISCOVERY_SOCKET_TIMEOUT_MS", &timeout)?;
            config.unicast.socket_timeout = Duration::from_millis(millis);
        }

        if let Ok(formats) = std::env::var("DISCOVERY_FORMATS") {
            config.formats.enabled = formats
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(key) = std::env::var("DISCOVERY_HMAC_KEY") {
            config.formats.hmac_key = Some(key);
        }

        if let Ok(level) = std::env::var("DISCOVERY_LOG_LEVEL") {
            config.logging.log_level = level
                .parse()
                .map_err(|_| DiscoveryError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
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

    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DiscoveryError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| DiscoveryError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.multicast.validate());
        errors.extend(self.unicast.validate());
        errors.extend(self.formats.validate());
        errors.extend(self.logging.validate());
        errors
    }

    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DiscoveryError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Baseline constraints for operations driven by this configuration.
    ///
    /// Values are preferences, so requirements supplied by the caller win.
    pub fn default_constraints(&self) -> InvocationConstraints {
        InvocationConstraints::preferred([
            InvocationConstraint::MulticastMaxPacketSize(self.multicast.max_packet_size),
            InvocationConstraint::MulticastTimeToLive(self.multicast.time_to_live),
            InvocationConstraint::UnicastSocketTimeout(self.unicast.socket_timeout),
        ])
    }

    pub fn format_registry(&self) -> Result<Arc<FormatRegistry>> {
        Ok(Arc::new(FormatRegistry::new(self.formats.providers()?)))
    }

    /// Facade for `generation` over the configured formats and groups
    pub fn discovery(&self, generation: ProtocolGeneration) -> Result<Discovery> {
        let formats = self.format_registry()?;
        Ok(Discovery::for_generation(generation, formats).with_groups(self.multicast.groups()?))
    }

    /// Marshal context framing registrars up to the configured size
    pub fn marshal_context(&self) -> MarshalContext {
        MarshalContext::new(Arc::new(FramedMarshaller::new(self.unicast.max_registrar_size)))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DiscoveryError::ConfigError(format!("Invalid value for {name}: '{value}'")))
}

/// Multicast request and announcement settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MulticastConfig {
    /// Group lookup services listen on (e.g., "224.0.1.85:4160")
    pub request_group: String,

    pub announcement_group: String,

    /// Upper bound on each datagram, header included
    pub max_packet_size: usize,

    pub time_to_live: u8,

    /// Local interface address for multicast traffic
    #[serde(default)]
    pub interface: Option<String>,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            request_group: MULTICAST_REQUEST_GROUP.to_string(),
            announcement_group: MULTICAST_ANNOUNCEMENT_GROUP.to_string(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            time_to_live: DEFAULT_TIME_TO_LIVE,
            interface: None,
        }
    }
}

impl MulticastConfig {
    pub fn request_group_addr(&self) -> Result<SocketAddr> {
        parse_group("request_group", &self.request_group)
    }

    pub fn announcement_group_addr(&self) -> Result<SocketAddr> {
        parse_group("announcement_group", &self.announcement_group)
    }

    /// Both groups, for addressing encoded datagrams
    pub fn groups(&self) -> Result<MulticastGroups> {
        Ok(MulticastGroups {
            request: self.request_group_addr()?,
            announcement: self.announcement_group_addr()?,
        })
    }

    /// Local IPv4 interface; `None` lets the OS choose
    pub fn interface_addr(&self) -> Result<Option<Ipv4Addr>> {
        let Some(s) = self.interface.as_deref() else {
            return Ok(None);
        };
        match s.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => Ok(Some(addr)),
            Ok(IpAddr::V6(_)) => Err(DiscoveryError::ConfigError(format!(
                "Interface address must be IPv4: '{s}'"
            ))),
            Err(_) => Err(DiscoveryError::ConfigError(format!(
                "Invalid interface address: '{s}'"
            ))),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("request_group", &self.request_group),
            ("announcement_group", &self.announcement_group),
        ] {
            if let Err(e) = parse_group(field, value) {
                errors.push(e.to_string());
            }
        }

        if self.max_packet_size < MIN_PACKET_SIZE {
            errors.push(format!(
                "Max packet size too small: {} (minimum: {MIN_PACKET_SIZE})",
                self.max_packet_size
            ));
        } else if self.max_packet_size > 65_507 {
            errors.push(format!(
                "Max packet size too large: {} (maximum UDP payload: 65507)",
                self.max_packet_size
            ));
        }

        if self.time_to_live == 0 {
            errors.push("Time-to-live must be greater than 0".to_string());
        }

        if let Err(e) = self.interface_addr() {
            errors.push(e.to_string());
        }

        errors
    }
}

fn parse_group(field: &str, value: &str) -> Result<SocketAddr> {
    let addr: SocketAddr = value.parse().map_err(|_| {
        DiscoveryError::ConfigError(format!(
            "Invalid {field} address: '{value}' (expected format: '224.0.1.85:4160')"
        ))
    })?;
    if !addr.ip().is_multicast() {
        return Err(DiscoveryError::ConfigError(format!(
            "{field} is not a multicast address: '{value}'"
        )));
    }
    Ok(addr)
}

/// Unicast discovery settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UnicastConfig {
    pub port: u16,

    /// Timeout for each blocking read on the discovery stream
    #[serde(with = "duration_serde")]
    pub socket_timeout: Duration,

    /// Connect timeout used when no connection deadline is constrained
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Largest registrar blob accepted from a lookup service
    pub max_registrar_size: usize,
}

impl Default for UnicastConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            connect_timeout: Duration::from_secs(15),
            max_registrar_size: DEFAULT_MAX_REGISTRAR_SIZE,
        }
    }
}

impl UnicastConfig {
    /// Lookup service on `host` at the configured port
    pub fn locator(&self, host: impl Into<String>) -> Locator {
        Locator::new(host, self.port)
    }

    pub fn listen_addr(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.port)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("Unicast port must be greater than 0".to_string());
        }

        if self.socket_timeout.as_millis() < 100 {
            errors.push("Socket timeout too short (minimum: 100ms)".to_string());
        } else if self.socket_timeout.as_secs() > 600 {
            errors.push("Socket timeout too long (maximum: 600s)".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        }

        if self.max_registrar_size == 0 {
            errors.push("Max registrar size must be greater than 0".to_string());
        } else if self.max_registrar_size > 64 * 1024 * 1024 {
            errors.push(format!(
                "Max registrar size too large: {} bytes (maximum: 64 MB)",
                self.max_registrar_size
            ));
        }

        errors
    }
}

/// Generation-2 formats, in preference order
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FormatConfig {
    pub enabled: Vec<String>,

    /// Hex-encoded shared key for the HMAC format
    #[serde(default)]
    pub hmac_key: Option<String>,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            enabled: vec![plaintext::FORMAT_NAME.to_string()],
            hmac_key: None,
        }
    }
}

impl FormatConfig {
    fn hmac_key_bytes(&self) -> Result<Vec<u8>> {
        let key = self.hmac_key.as_deref().ok_or_else(|| {
            DiscoveryError::ConfigError(format!("{} is enabled but hmac_key is not set", hmac::FORMAT_NAME))
        })?;
        hex::decode(key.trim())
            .map_err(|e| DiscoveryError::ConfigError(format!("hmac_key is not valid hex: {e}")))
    }

    /// Providers for every enabled format, in configured order
    pub fn providers(&self) -> Result<Vec<FormatProvider>> {
        let mut providers = Vec::new();
        for name in &self.enabled {
            match name.as_str() {
                plaintext::FORMAT_NAME => providers.extend(Plaintext::providers()),
                hmac::FORMAT_NAME => {
                    let key = self.hmac_key_bytes()?;
                    let format = HmacSha256Format::providers(&key)
                        .map_err(|e| DiscoveryError::ConfigError(e.to_string()))?;
                    providers.extend(format);
                }
                other => {
                    return Err(DiscoveryError::ConfigError(format!(
                        "Unknown discovery format: '{other}'"
                    )))
                }
            }
        }
        Ok(providers)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.enabled.is_empty() {
            errors.push("At least one discovery format must be enabled".to_string());
        }

        for (i, name) in self.enabled.iter().enumerate() {
            if self.enabled[..i].contains(name) {
                errors.push(format!("Discovery format listed twice: '{name}'"));
            }
            match name.as_str() {
                plaintext::FORMAT_NAME => {}
                hmac::FORMAT_NAME => match self.hmac_key_bytes() {
                    Ok(key) if key.len() < hmac::MIN_KEY_LEN => errors.push(format!(
                        "hmac_key too short: {} bytes (minimum: {})",
                        key.len(),
                        hmac::MIN_KEY_LEN
                    )),
                    Ok(_) => {}
                    Err(e) => errors.push(e.to_string()),
                },
                other => errors.push(format!("Unknown discovery format: '{other}'")),
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("discovery"),
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
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations as integer milliseconds
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
