/// Configuration management for the router
///
/// Configuration is a TOML file with one `[routes.<name>]` table per route
/// and an optional `[metadata_cache]` section. Loading validates everything
/// up front; validation failures carry the offending option and section in
/// the message and make the process exit non-zero.
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::destination::metadata::{parse_metadata_uri, MetadataUri};
use crate::metadata::session::{SslConfig, SslMode};
use crate::net::Endpoint;
use crate::protocol::RouteProtocol;
use crate::routing::{AccessMode, RouteSettings};
use crate::utils::{is_valid_socket_path, split_addr_port};

/// Default bootstrap server port for the metadata cache.
pub const DEFAULT_METADATA_PORT: u16 = 32275;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

fn default_connect_timeout() -> u64 {
    1
}
fn default_client_connect_timeout() -> u64 {
    9
}
fn default_max_connections() -> u64 {
    512
}
fn default_max_connect_errors() -> u64 {
    100
}
fn default_net_buffer_length() -> u64 {
    16384
}
fn default_ttl() -> u64 {
    300
}
fn default_ssl_mode() -> String {
    "PREFERRED".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("{0}")]
    Validation(String),
}

fn option_err(option: &str, section: &str, reason: impl Display) -> ConfigError {
    ConfigError::Validation(format!("option {} in [{}] {}", option, section, reason))
}

fn check_range(
    value: u64,
    min: u64,
    max: u64,
    option: &str,
    section: &str,
) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(option_err(
            option,
            section,
            format!(
                "needs value between {} and {} inclusive, was '{}'",
                min, max, value
            ),
        ));
    }
    Ok(())
}

/// Main router configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Metadata cache section, required by metadata-cache destinations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_cache: Option<MetadataCacheConfig>,
    /// One table per route, keyed by route name
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One route section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Bind host, optionally with a port (`host:port`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
    /// TCP port, used when bind_address does not name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_port: Option<u16>,
    /// Local stream socket path; may be combined with a TCP bind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    /// Comma-separated address list, or a metadata-cache URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destinations: Option<String>,
    /// read-write, read-only or read-write-ring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// classic (default) or x
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Seconds allowed for reaching a destination server
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds a client may take to finish its handshake
    #[serde(default = "default_client_connect_timeout")]
    pub client_connect_timeout: u64,
    /// Ceiling on concurrently routed sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: u64,
    /// Handshake failures before a source host is blocked
    #[serde(default = "default_max_connect_errors")]
    pub max_connect_errors: u64,
    /// Seconds after which the error counter resets; 0 disables the reset
    #[serde(default)]
    pub max_connect_errors_timeout: u64,
    /// Copy buffer size in bytes
    #[serde(default = "default_net_buffer_length")]
    pub net_buffer_length: u64,
}

/// Where a route's destinations come from.
#[derive(Debug, Clone)]
pub enum DestinationSpec {
    Static(Vec<Endpoint>),
    Metadata(MetadataUri),
}

impl RouteConfig {
    pub fn access_mode(&self) -> Result<AccessMode, String> {
        let value = self
            .mode
            .as_deref()
            .ok_or("needs to be specified; valid are read-write, read-only, read-write-ring")?;
        AccessMode::from_name(value).ok_or_else(|| {
            format!(
                "is invalid; valid are read-write, read-only, read-write-ring (was '{}')",
                value
            )
        })
    }

    pub fn route_protocol(&self) -> Result<RouteProtocol, String> {
        match self.protocol.as_deref() {
            None => Ok(RouteProtocol::Classic),
            Some(value) => RouteProtocol::from_name(value)
                .ok_or_else(|| format!("is invalid; valid are classic, x (was '{}')", value)),
        }
    }

    /// The TCP endpoint to bind, if any. A port named inside `bind_address`
    /// wins over `bind_port`.
    pub fn bind_endpoint(&self) -> Result<Option<Endpoint>, String> {
        let (host, addr_port) = match self.bind_address.as_deref() {
            Some(value) => split_addr_port(value)?,
            None => (DEFAULT_BIND_ADDRESS.to_string(), 0),
        };
        let port = if addr_port != 0 {
            addr_port
        } else {
            self.bind_port.unwrap_or(0)
        };
        if port == 0 {
            return Ok(None);
        }
        Ok(Some(Endpoint::new(host, port)))
    }

    /// Parse `destinations` into a static list or a metadata-cache spec.
    pub fn destination_spec(&self, protocol: RouteProtocol) -> Result<DestinationSpec, String> {
        let raw = self
            .destinations
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or("is required and needs a value")?;

        if raw.contains("://") {
            return Ok(DestinationSpec::Metadata(parse_metadata_uri(raw)?));
        }

        if raw.starts_with(',') || raw.ends_with(',') {
            return Err(format!(
                "has an empty address in the destination list (was '{}')",
                raw
            ));
        }

        let mut endpoints = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(format!(
                    "has an empty address in the destination list (was '{}')",
                    raw
                ));
            }
            let (host, port) = split_addr_port(part)?;
            let port = if port == 0 { protocol.default_port() } else { port };
            endpoints.push(Endpoint::new(host, port));
        }
        Ok(DestinationSpec::Static(endpoints))
    }

    fn validate(
        &self,
        section: &str,
        have_metadata_cache: bool,
        bound: &mut Vec<Endpoint>,
    ) -> Result<(), ConfigError> {
        let mode = self
            .access_mode()
            .map_err(|reason| option_err("mode", section, reason))?;
        let protocol = self
            .route_protocol()
            .map_err(|reason| option_err("protocol", section, reason))?;

        check_range(self.connect_timeout, 1, 65535, "connect_timeout", section)?;
        check_range(
            self.client_connect_timeout,
            2,
            31536000,
            "client_connect_timeout",
            section,
        )?;
        check_range(self.max_connections, 1, 65535, "max_connections", section)?;
        check_range(
            self.max_connect_errors,
            1,
            i64::MAX as u64,
            "max_connect_errors",
            section,
        )?;
        check_range(
            self.net_buffer_length,
            1024,
            16 * 1024 * 1024,
            "net_buffer_length",
            section,
        )?;

        if let Some(socket) = self.socket.as_deref() {
            if !is_valid_socket_path(socket) {
                return Err(option_err(
                    "socket",
                    section,
                    format!("is not a valid socket path (was '{}')", socket),
                ));
            }
        }

        let endpoint = self
            .bind_endpoint()
            .map_err(|reason| option_err("bind_address", section, reason))?;
        match &endpoint {
            None if self.socket.is_none() => {
                let message = if self.bind_address.is_some() {
                    "no socket, no bind_port, and TCP port in bind_address is not provided"
                } else {
                    "one of bind_port, bind_address, or socket is required"
                };
                return Err(ConfigError::Validation(format!(
                    "in [{}]: {}",
                    section, message
                )));
            }
            Some(endpoint) => {
                let wildcard = endpoint.host == "0.0.0.0" || endpoint.host == "::";
                let collision = bound.iter().any(|existing| {
                    existing == endpoint
                        || (existing.port == endpoint.port
                            && (wildcard || existing.host == "0.0.0.0" || existing.host == "::"))
                });
                if collision {
                    return Err(ConfigError::Validation(format!(
                        "in [{}]: duplicate IP or name found in bind_address '{}'",
                        section, endpoint
                    )));
                }
                bound.push(endpoint.clone());
            }
            None => {}
        }

        let spec = self
            .destination_spec(protocol)
            .map_err(|reason| option_err("destinations", section, reason))?;
        match &spec {
            DestinationSpec::Static(endpoints) => {
                if let Some(bind) = &endpoint {
                    if endpoints.contains(bind) {
                        return Err(ConfigError::Validation(format!(
                            "in [{}]: Bind Address can not be part of destinations",
                            section
                        )));
                    }
                }
            }
            DestinationSpec::Metadata(_) => {
                if !have_metadata_cache {
                    return Err(ConfigError::Validation(
                        "Routing needs Metadata Cache, but none was found in configuration"
                            .to_string(),
                    ));
                }
                if mode == AccessMode::ReadWriteRing {
                    return Err(option_err(
                        "mode",
                        section,
                        "is invalid for metadata-cache destinations; valid are read-write, read-only",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Materialize the runtime settings for this route.
    pub fn to_route_settings(&self, name: &str) -> Result<RouteSettings, ConfigError> {
        let section = format!("routes.{}", name);
        Ok(RouteSettings {
            name: name.to_string(),
            mode: self
                .access_mode()
                .map_err(|reason| option_err("mode", &section, reason))?,
            protocol: self
                .route_protocol()
                .map_err(|reason| option_err("protocol", &section, reason))?,
            bind_address: self
                .bind_endpoint()
                .map_err(|reason| option_err("bind_address", &section, reason))?,
            bind_socket: self.socket.as_deref().map(PathBuf::from),
            max_connections: self.max_connections as usize,
            destination_connect_timeout: Duration::from_secs(self.connect_timeout),
            client_connect_timeout: Duration::from_secs(self.client_connect_timeout),
            max_connect_errors: self.max_connect_errors,
            max_connect_errors_timeout: Duration::from_secs(self.max_connect_errors_timeout),
            net_buffer_length: self.net_buffer_length as usize,
        })
    }
}

/// Metadata cache section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataCacheConfig {
    /// Comma-separated bootstrap URIs (`mysql://host:port` or `host:port`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_server_addresses: Option<String>,
    /// User authenticating against the metadata servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Cluster name to read from the metadata schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_cluster: Option<String>,
    /// Seconds between the end of one refresh and the start of the next
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_capath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_crl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_crlpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_version: Option<String>,
}

impl MetadataCacheConfig {
    const SECTION: &'static str = "metadata_cache";

    pub fn bootstrap_endpoints(&self) -> Result<Vec<Endpoint>, String> {
        let raw = self
            .bootstrap_server_addresses
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or("is required and needs a value")?;

        let mut endpoints = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            let part = part.strip_prefix("mysql://").unwrap_or(part);
            let (host, port) = split_addr_port(part)?;
            let port = if port == 0 { DEFAULT_METADATA_PORT } else { port };
            endpoints.push(Endpoint::new(host, port));
        }
        if endpoints.is_empty() {
            return Err("is required and needs a value".to_string());
        }
        Ok(endpoints)
    }

    pub fn parsed_ssl_mode(&self) -> Result<SslMode, String> {
        SslMode::from_name(&self.ssl_mode).ok_or_else(|| {
            format!(
                "needs to be one of DISABLED, PREFERRED, REQUIRED, VERIFY_CA, VERIFY_IDENTITY, \
                 was '{}'",
                self.ssl_mode
            )
        })
    }

    pub fn ssl_config(&self) -> Result<SslConfig, String> {
        Ok(SslConfig {
            mode: self.parsed_ssl_mode()?,
            ca: self.ssl_ca.clone(),
            capath: self.ssl_capath.clone(),
            crl: self.ssl_crl.clone(),
            crlpath: self.ssl_crlpath.clone(),
            cipher: self.ssl_cipher.clone(),
            tls_version: self.tls_version.clone(),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.user.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err(option_err("user", Self::SECTION, "is required"));
        }
        if self
            .metadata_cluster
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
        {
            return Err(option_err("metadata_cluster", Self::SECTION, "is required"));
        }
        self.bootstrap_endpoints()
            .map_err(|reason| option_err("bootstrap_server_addresses", Self::SECTION, reason))?;
        check_range(self.ttl, 0, u32::MAX as u64, "ttl", Self::SECTION)?;
        self.parsed_ssl_mode()
            .map_err(|reason| option_err("ssl_mode", Self::SECTION, reason))?;
        Ok(())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(option_err(
                    "level",
                    "logging",
                    format!("is invalid (was '{}')", other),
                ))
            }
        }

        if self.routes.is_empty() {
            return Err(ConfigError::Validation(
                "no [routes.<name>] section found in configuration".to_string(),
            ));
        }

        let mut bound = Vec::new();
        for (name, route) in &self.routes {
            let section = format!("routes.{}", name);
            route.validate(&section, self.metadata_cache.is_some(), &mut bound)?;
        }

        if let Some(metadata_cache) = &self.metadata_cache {
            metadata_cache.validate()?;
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, kind: &str) -> Result<(), ConfigError> {
        let config = match kind {
            "static" => Config {
                routes: BTreeMap::from([(
                    "cluster_ro".to_string(),
                    RouteConfig {
                        bind_address: Some("0.0.0.0".to_string()),
                        bind_port: Some(7001),
                        socket: None,
                        destinations: Some("10.0.1.10:3306,10.0.1.11:3306,10.0.1.12:3306".into()),
                        mode: Some("read-only".to_string()),
                        protocol: None,
                        connect_timeout: default_connect_timeout(),
                        client_connect_timeout: default_client_connect_timeout(),
                        max_connections: default_max_connections(),
                        max_connect_errors: default_max_connect_errors(),
                        max_connect_errors_timeout: 0,
                        net_buffer_length: default_net_buffer_length(),
                    },
                )]),
                ..Config::default()
            },
            "metadata" => Config {
                metadata_cache: Some(MetadataCacheConfig {
                    bootstrap_server_addresses: Some(
                        "mysql://10.0.1.10:3306,mysql://10.0.1.11:3306".to_string(),
                    ),
                    user: Some("router_user".to_string()),
                    metadata_cluster: Some("mycluster".to_string()),
                    ttl: default_ttl(),
                    ssl_mode: default_ssl_mode(),
                    ssl_ca: None,
                    ssl_capath: None,
                    ssl_crl: None,
                    ssl_crlpath: None,
                    ssl_cipher: None,
                    tls_version: None,
                }),
                routes: BTreeMap::from([
                    (
                        "cluster_rw".to_string(),
                        RouteConfig {
                            bind_address: Some("0.0.0.0".to_string()),
                            bind_port: Some(6446),
                            socket: None,
                            destinations: Some(
                                "metadata-cache://mycluster/default?role=PRIMARY".to_string(),
                            ),
                            mode: Some("read-write".to_string()),
                            protocol: None,
                            connect_timeout: default_connect_timeout(),
                            client_connect_timeout: default_client_connect_timeout(),
                            max_connections: default_max_connections(),
                            max_connect_errors: default_max_connect_errors(),
                            max_connect_errors_timeout: 0,
                            net_buffer_length: default_net_buffer_length(),
                        },
                    ),
                    (
                        "cluster_ro".to_string(),
                        RouteConfig {
                            bind_address: Some("0.0.0.0".to_string()),
                            bind_port: Some(6447),
                            socket: None,
                            destinations: Some(
                                "metadata-cache://mycluster/default?role=SECONDARY".to_string(),
                            ),
                            mode: Some("read-only".to_string()),
                            protocol: None,
                            connect_timeout: default_connect_timeout(),
                            client_connect_timeout: default_client_connect_timeout(),
                            max_connections: default_max_connections(),
                            max_connect_errors: default_max_connect_errors(),
                            max_connect_errors_timeout: 0,
                            net_buffer_length: default_net_buffer_length(),
                        },
                    ),
                ]),
                ..Config::default()
            },
            _ => {
                return Err(ConfigError::Validation(
                    "example kind must be 'static' or 'metadata'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn static_route() -> RouteConfig {
        RouteConfig {
            bind_address: Some("127.0.0.1".to_string()),
            bind_port: Some(7001),
            socket: None,
            destinations: Some("10.0.0.1:3306,10.0.0.2:3306".to_string()),
            mode: Some("read-only".to_string()),
            protocol: None,
            connect_timeout: default_connect_timeout(),
            client_connect_timeout: default_client_connect_timeout(),
            max_connections: default_max_connections(),
            max_connect_errors: default_max_connect_errors(),
            max_connect_errors_timeout: 0,
            net_buffer_length: default_net_buffer_length(),
        }
    }

    fn config_with(route: RouteConfig) -> Config {
        Config {
            routes: BTreeMap::from([("test".to_string(), route)]),
            ..Config::default()
        }
    }

    #[test]
    fn test_valid_static_config() {
        assert!(config_with(static_route()).validate().is_ok());
    }

    #[test]
    fn test_empty_config_is_invalid() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_mode_is_required() {
        let mut route = static_route();
        route.mode = None;
        let err = config_with(route).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "option mode in [routes.test] needs to be specified; valid are read-write, \
             read-only, read-write-ring"
        );
    }

    #[test]
    fn test_invalid_mode_message() {
        let mut route = static_route();
        route.mode = Some("sideways".to_string());
        let err = config_with(route).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "option mode in [routes.test] is invalid; valid are read-write, read-only, \
             read-write-ring (was 'sideways')"
        );
    }

    #[test]
    fn test_connect_timeout_range() {
        let mut route = static_route();
        route.connect_timeout = 0;
        let err = config_with(route).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "option connect_timeout in [routes.test] needs value between 1 and 65535 \
             inclusive, was '0'"
        );
    }

    #[test]
    fn test_client_connect_timeout_range() {
        let mut route = static_route();
        route.client_connect_timeout = 1;
        assert!(config_with(route).validate().is_err());
    }

    #[test]
    fn test_net_buffer_length_range() {
        let mut route = static_route();
        route.net_buffer_length = 512;
        assert!(config_with(route).validate().is_err());

        let mut route = static_route();
        route.net_buffer_length = 16 * 1024 * 1024;
        assert!(config_with(route).validate().is_ok());
    }

    #[test]
    fn test_bind_requires_port_or_socket() {
        let mut route = static_route();
        route.bind_port = None;
        let err = config_with(route).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "in [routes.test]: no socket, no bind_port, and TCP port in bind_address is \
             not provided"
        );

        let mut route = static_route();
        route.bind_address = None;
        route.bind_port = None;
        let err = config_with(route).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "in [routes.test]: one of bind_port, bind_address, or socket is required"
        );
    }

    #[test]
    fn test_socket_only_route_is_valid() {
        let mut route = static_route();
        route.bind_address = None;
        route.bind_port = None;
        route.socket = Some("/tmp/router.sock".to_string());
        assert!(config_with(route).validate().is_ok());
    }

    #[test]
    fn test_bind_port_inside_bind_address_wins() {
        let mut route = static_route();
        route.bind_address = Some("127.0.0.1:6446".to_string());
        route.bind_port = Some(9999);
        let endpoint = route.bind_endpoint().unwrap().unwrap();
        assert_eq!(endpoint.port, 6446);
    }

    #[test]
    fn test_duplicate_bind_addresses() {
        let mut config = config_with(static_route());
        config
            .routes
            .insert("second".to_string(), static_route());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate IP or name found in bind_address"));
    }

    #[test]
    fn test_wildcard_port_collision() {
        let mut config = config_with(static_route());
        let mut wildcard = static_route();
        wildcard.bind_address = Some("0.0.0.0".to_string());
        config.routes.insert("wild".to_string(), wildcard);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate IP or name found in bind_address"));
    }

    #[test]
    fn test_empty_destination_entry() {
        let mut route = static_route();
        route.destinations = Some("10.0.0.1:3306,".to_string());
        let err = config_with(route).validate().unwrap_err();
        assert!(err
            .to_string()
            .starts_with("option destinations in [routes.test] has an empty address"));
    }

    #[test]
    fn test_destination_default_port_follows_protocol() {
        let route = {
            let mut r = static_route();
            r.destinations = Some("10.0.0.1".to_string());
            r
        };
        match route.destination_spec(RouteProtocol::Classic).unwrap() {
            DestinationSpec::Static(endpoints) => assert_eq!(endpoints[0].port, 3306),
            other => panic!("unexpected spec: {:?}", other),
        }
        match route.destination_spec(RouteProtocol::X).unwrap() {
            DestinationSpec::Static(endpoints) => assert_eq!(endpoints[0].port, 33060),
            other => panic!("unexpected spec: {:?}", other),
        }
    }

    #[test]
    fn test_bind_address_cannot_be_a_destination() {
        let mut route = static_route();
        route.bind_address = Some("10.0.0.1".to_string());
        route.bind_port = Some(3306);
        let err = config_with(route).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "in [routes.test]: Bind Address can not be part of destinations"
        );
    }

    #[test]
    fn test_metadata_destination_requires_cache_section() {
        let mut route = static_route();
        route.destinations =
            Some("metadata-cache://mycluster/default?role=SECONDARY".to_string());
        let err = config_with(route).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Routing needs Metadata Cache, but none was found in configuration"
        );
    }

    #[test]
    fn test_metadata_destination_missing_role() {
        let mut route = static_route();
        route.destinations = Some("metadata-cache://mycluster/default".to_string());
        let err = config_with(route).validate().unwrap_err();
        assert!(err.to_string().contains("missing 'role'"));
    }

    fn metadata_section() -> MetadataCacheConfig {
        MetadataCacheConfig {
            bootstrap_server_addresses: Some("mysql://meta1:3306,meta2".to_string()),
            user: Some("router".to_string()),
            metadata_cluster: Some("mycluster".to_string()),
            ttl: 300,
            ssl_mode: "PREFERRED".to_string(),
            ssl_ca: None,
            ssl_capath: None,
            ssl_crl: None,
            ssl_crlpath: None,
            ssl_cipher: None,
            tls_version: None,
        }
    }

    #[test]
    fn test_metadata_cache_user_is_required() {
        let mut config = config_with(static_route());
        let mut section = metadata_section();
        section.user = None;
        config.metadata_cache = Some(section);
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "option user in [metadata_cache] is required");
    }

    #[test]
    fn test_bootstrap_endpoints_parse_and_default_port() {
        let section = metadata_section();
        let endpoints = section.bootstrap_endpoints().unwrap();
        assert_eq!(endpoints[0], Endpoint::new("meta1", 3306));
        assert_eq!(endpoints[1], Endpoint::new("meta2", DEFAULT_METADATA_PORT));
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = config_with(static_route());
        let mut section = metadata_section();
        section.ssl_mode = "MAYBE".to_string();
        config.metadata_cache = Some(section);
        let err = config.validate().unwrap_err();
        assert!(err
            .to_string()
            .starts_with("option ssl_mode in [metadata_cache] needs to be one of"));
    }

    #[test]
    fn test_config_file_round_trip() {
        let mut config = config_with(static_route());
        config.metadata_cache = Some(metadata_section());

        let file = NamedTempFile::new().unwrap();
        config.save_to_file(file.path()).unwrap();
        let loaded = Config::load_from_file(file.path()).unwrap();
        assert_eq!(loaded.routes.len(), 1);
        assert!(loaded.metadata_cache.is_some());
    }

    #[test]
    fn test_example_configs_validate() {
        for kind in ["static", "metadata"] {
            let file = NamedTempFile::new().unwrap();
            Config::create_example_config(file.path(), kind).unwrap();
            let loaded = Config::load_from_file(file.path()).unwrap();
            assert!(!loaded.routes.is_empty(), "example '{}' has routes", kind);
        }
    }

    #[test]
    fn test_load_from_toml_text() {
        let toml_text = r#"
[logging]
level = "debug"

[routes.cluster_rw]
bind_address = "127.0.0.1"
bind_port = 6446
destinations = "10.0.0.1:3306,10.0.0.2:3306"
mode = "read-write"
max_connections = 128
"#;
        let config: Config = toml::from_str(toml_text).unwrap();
        config.validate().unwrap();
        let route = &config.routes["cluster_rw"];
        assert_eq!(route.max_connections, 128);
        // untouched options keep their defaults
        assert_eq!(route.connect_timeout, 1);
        assert_eq!(route.client_connect_timeout, 9);
        assert_eq!(route.max_connect_errors, 100);
    }
}
