//! Broker configuration
//!
//! TOML document layered as defaults -> file -> `EMBERMQ__*` environment
//! overrides (double underscore separates nested keys). The file also
//! supports in-place `${VAR}` / `${VAR:-default}` substitution. A missing
//! file is not an error; the defaults apply.

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Substitute environment variables in the raw file content.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// TCP bind address; empty disables the plain listener
    pub listen: String,
    /// TLS listener
    pub tls: TlsConfig,
    /// WebSocket listeners
    pub websockets: WebSocketsConfig,
    /// Logging
    pub logging: LoggingConfig,
    /// Session store
    pub storage: StorageConfig,
    /// Ordered list of extension names to activate
    pub plugins: Vec<String>,
}

/// TLS listener configuration; enabled iff all three fields are non-empty
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub listen: String,
    /// Path to the PEM certificate file
    pub cert: String,
    /// Path to the PEM key file
    pub key: String,
}

impl TlsConfig {
    pub fn enabled(&self) -> bool {
        !self.listen.is_empty() && !self.cert.is_empty() && !self.key.is_empty()
    }
}

/// WebSocket listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketsConfig {
    /// Bind address; empty disables plain WebSockets
    pub listen: String,
    /// Upgrade request path
    pub path: String,
    /// Reject requests with a missing or empty Origin header
    pub reject_empty_origin: bool,
    /// Origin allow-list; empty allows all
    pub origins: Vec<String>,
    /// Secure WebSockets; enabled iff all three fields are non-empty
    pub wss: TlsConfig,
}

impl Default for WebSocketsConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            path: "/ws".to_string(),
            reject_empty_origin: false,
            origins: Vec::new(),
            wss: TlsConfig::default(),
        }
    }
}

/// Logging configuration. Rotation fields are handed to the file-appender
/// backend as-is.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of: debug, info, error, fatal. Unknown values coerce to error.
    pub log_level: String,
    /// Log file name; empty logs to stderr only
    pub filename: String,
    /// Maximum size per log file in megabytes
    pub max_size: u32,
    /// Number of rotated files to keep
    pub max_backups: u32,
    /// Days to retain rotated files
    pub max_age: u32,
    /// Compress rotated files
    pub enable_compression: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "error".to_string(),
            filename: "embermq.log".to_string(),
            max_size: 5,
            max_backups: 20,
            max_age: 30,
            enable_compression: true,
        }
    }
}

impl LoggingConfig {
    /// Parsed log level with unknown values coerced to error
    pub fn level(&self) -> tracing::Level {
        match self.log_level.as_str() {
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "error" | "fatal" => tracing::Level::ERROR,
            _ => tracing::Level::ERROR,
        }
    }
}

/// Session store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the session keyspace
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: ".sessions.store".to_string(),
        }
    }
}

/// Expand a `:port` style address to a bindable `host:port` form
pub fn bind_addr(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    }
}

impl Config {
    /// Load configuration from a TOML file with environment overrides.
    /// A missing file falls back to the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("listen", ":1883")?
            .set_default("tls.listen", ":8883")?
            .set_default("websockets.path", "/ws")?
            .set_default("logging.log_level", "error")?
            .set_default("logging.filename", "embermq.log")?
            .set_default("logging.max_size", 5)?
            .set_default("logging.max_backups", 20)?
            .set_default("logging.max_age", 30)?
            .set_default("logging.enable_compression", true)?
            .set_default("storage.path", ".sessions.store")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file, defaults apply
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("EMBERMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty()
            && !self.tls.enabled()
            && self.websockets.listen.is_empty()
            && !self.websockets.wss.enabled()
        {
            return Err(ConfigError::Validation(
                "no listener configured: set listen, tls, websockets or websockets.wss"
                    .to_string(),
            ));
        }

        if self.storage.path.is_empty() {
            return Err(ConfigError::Validation(
                "storage.path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
