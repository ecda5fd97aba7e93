//! Configuration structs with sensible defaults and RON persistence.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listening side.
    pub server: ServerConfig,
    /// Dialing side.
    pub client: ClientConfig,
    /// TLS material, shared by both sides.
    pub tls: TlsConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_address: String,
    /// Port to bind.
    pub port: u16,
    /// Reject messages that need authentication from unauthenticated peers.
    pub authentication_mandatory: bool,
    /// How long a new connection may stay unauthenticated, in milliseconds.
    pub auth_ttl_ms: u64,
    /// Target tick rate (Hz).
    pub tick_frequency: u32,
    /// Largest accepted frame payload in bytes.
    pub max_message_size: u32,
    /// Maximum simultaneous connections (0 = unlimited).
    pub max_connections: u32,
    /// TLS handshake budget in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Disable Nagle's algorithm on accepted sockets.
    pub tcp_nodelay: bool,
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host to dial.
    pub server_address: String,
    /// Server port to dial.
    pub server_port: u16,
    /// Connect budget in milliseconds.
    pub connect_timeout_ms: u64,
    /// How often the client drains its inbound queue (Hz).
    pub poll_frequency: u32,
    /// Largest accepted frame payload in bytes.
    pub max_message_size: u32,
}

/// TLS configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Wrap every connection in TLS.
    pub enabled: bool,
    /// PEM certificate chain (server identity, or client identity for mutual auth).
    pub cert_path: Option<PathBuf>,
    /// PEM private key matching `cert_path`.
    pub key_path: Option<PathBuf>,
    /// PEM CA bundle. Clients verify the server with it; servers verify
    /// clients with it when `require_client_cert` is set.
    pub ca_path: Option<PathBuf>,
    /// Server only: demand a client certificate signed by `ca_path`.
    pub require_client_cert: bool,
    /// Client only: name expected in the server certificate.
    pub server_name: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (e.g. "info", "debug,netengine_net=trace").
    pub level: String,
    /// Directory for the JSON log file; no file when unset.
    pub log_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7777,
            authentication_mandatory: true,
            auth_ttl_ms: 10_000,
            tick_frequency: 33,
            max_message_size: 16 * 1024,
            max_connections: 0,
            handshake_timeout_ms: 5_000,
            tcp_nodelay: true,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
            connect_timeout_ms: 10_000,
            poll_frequency: 33,
            max_message_size: 16 * 1024,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            ca_path: None,
            require_client_cert: false,
            server_name: "localhost".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

// --- Derived values ---

impl ServerConfig {
    pub fn auth_ttl(&self) -> Duration {
        Duration::from_millis(self.auth_ttl_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Parsed `bind_address:port`.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self
            .bind_address
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                field: "server.bind_address",
                reason: e.to_string(),
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `server_address:server_port`, suitable for name resolution.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }
}

/// `<platform config dir>/netengine`, if the platform has one.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("netengine"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::InvalidValue {
                field,
                reason: reason.to_string(),
            })
        };

        if self.server.tick_frequency == 0 {
            return invalid("server.tick_frequency", "must be at least 1 Hz");
        }
        if self.client.poll_frequency == 0 {
            return invalid("client.poll_frequency", "must be at least 1 Hz");
        }
        if self.server.max_message_size == 0 {
            return invalid("server.max_message_size", "must be positive");
        }
        if self.client.max_message_size == 0 {
            return invalid("client.max_message_size", "must be positive");
        }
        if self.tls.require_client_cert && self.tls.ca_path.is_none() {
            return invalid("tls.ca_path", "required when client certificates are required");
        }
        self.server.socket_addr()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("port: 7777"));
        assert!(ron_str.contains("tick_frequency: 33"));
        assert!(ron_str.contains("auth_ttl_ms: 10000"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.tls.cert_path = Some(PathBuf::from("/etc/netengine/cert.pem"));
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(server: (port: 9000))").unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.tick_frequency, 33);
        assert_eq!(config.tls, TlsConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.auth_ttl_ms = 200;
        config.client.server_address = "10.0.0.1".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.server.max_connections = 64;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.server.max_connections, 64);
        assert!(reloaded.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_durations_and_address() {
        let server = ServerConfig::default();
        assert_eq!(server.auth_ttl(), Duration::from_secs(10));
        assert_eq!(server.socket_addr().unwrap().port(), 7777);
        assert_eq!(ClientConfig::default().endpoint(), "127.0.0.1:7777");
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.server.tick_frequency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "server.tick_frequency",
                ..
            })
        ));

        let mut config = Config::default();
        config.server.bind_address = "not an ip".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tls.require_client_cert = true;
        assert!(config.validate().is_err());
    }
}
