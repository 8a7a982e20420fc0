//! Configuration module for streamd.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::addr::{AddrConf, AddrTableError, BoundAddr, ListeningPort};
use crate::runtime::event_loop::WorkerSettings;
use crate::runtime::phase::{AccessAction, AccessRule, AccessRules, ConnLimit, Network};
use crate::runtime::server::{ServerConf, DEFAULT_BUFFER_SIZE};
use crate::runtime::tls::{load_server_config, TlsError};
use clap::Parser;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the stream server
#[derive(Parser, Debug)]
#[command(name = "streamd")]
#[command(version = "0.1.0")]
#[command(about = "A multi-address TCP/TLS stream server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Plain listen address used when the file configures no server
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum connections per worker
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
}

/// Worker-related configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Events taken per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_connections: default_max_connections(),
            batch_size: default_batch_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

/// One `[[server]]` table
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default)]
    pub listen: Vec<ListenConfig>,
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    #[serde(default)]
    pub so_keepalive: bool,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Maximum concurrent connections to this server
    pub limit_conn: Option<usize>,
    #[serde(default)]
    pub access: Vec<AccessRuleConfig>,
    pub tls: Option<TlsConfig>,
}

/// A listen address; `addr` is `ip:port` or a bare port
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    pub addr: String,
    #[serde(default)]
    pub ssl: bool,
}

/// `{ allow = "..." }` or `{ deny = "..." }`; the value is `all`, an address
/// or a CIDR block
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessRuleConfig {
    Allow(String),
    Deny(String),
}

/// Certificate material for `ssl` listeners
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

fn default_max_connections() -> usize {
    1024
}

fn default_batch_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_name() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_handshake_timeout_ms() -> u64 {
    60_000
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker threads; 0 means one per CPU
    pub workers: usize,
    pub settings: WorkerSettings,
    pub log_level: String,
    pub servers: Vec<ServerConfig>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::from_parts(cli, toml_config))
    }

    fn from_parts(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let mut servers = toml_config.servers;
        if servers.is_empty() {
            servers.push(ServerConfig {
                name: default_server_name(),
                listen: vec![ListenConfig {
                    addr: cli.listen.unwrap_or_else(default_listen),
                    ssl: false,
                }],
                tcp_nodelay: true,
                so_keepalive: false,
                buffer_size: default_buffer_size(),
                handshake_timeout_ms: default_handshake_timeout_ms(),
                limit_conn: None,
                access: Vec::new(),
                tls: None,
            });
        }

        Config {
            workers: cli.workers.or(toml_config.runtime.workers).unwrap_or(0),
            settings: WorkerSettings {
                max_connections: cli
                    .max_connections
                    .unwrap_or(toml_config.runtime.max_connections),
                batch_size: toml_config.runtime.batch_size,
                ..WorkerSettings::default()
            },
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            servers,
        }
    }

    /// Build the virtual servers and group their addresses into listening
    /// ports. Certificates are loaded here, so a bad path fails startup.
    pub fn build_ports(&self) -> Result<Vec<ListeningPort>, ConfigError> {
        let mut bound = Vec::new();

        for server in &self.servers {
            let conf = Arc::new(build_server(server)?);

            for listen in &server.listen {
                let addr = parse_listen(&listen.addr).ok_or_else(|| ConfigError::InvalidListen {
                    server: server.name.clone(),
                    addr: listen.addr.clone(),
                })?;
                if listen.ssl && conf.tls.is_none() {
                    return Err(ConfigError::MissingCertificate {
                        server: server.name.clone(),
                        addr: listen.addr.clone(),
                    });
                }
                bound.push(BoundAddr {
                    addr,
                    conf: AddrConf {
                        server: Arc::clone(&conf),
                        addr_text: addr.to_string().into(),
                        ssl: listen.ssl,
                    },
                });
            }
        }

        if bound.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        Ok(ListeningPort::group(bound)?)
    }
}

fn build_server(server: &ServerConfig) -> Result<ServerConf, ConfigError> {
    if server.buffer_size == 0 {
        return Err(ConfigError::InvalidBufferSize(server.name.clone()));
    }

    let mut conf = ServerConf::new(server.name.clone());
    conf.tcp_nodelay = server.tcp_nodelay;
    conf.so_keepalive = server.so_keepalive;
    conf.buffer_size = server.buffer_size;
    conf.handshake_timeout = Duration::from_millis(server.handshake_timeout_ms);

    if let Some(tls) = &server.tls {
        conf.tls = Some(
            load_server_config(&tls.certificate, &tls.key).map_err(|source| ConfigError::Tls {
                server: server.name.clone(),
                source,
            })?,
        );
    }

    if let Some(max) = server.limit_conn {
        conf.limit_conn = Some(Box::new(ConnLimit::new(max)));
    }

    if !server.access.is_empty() {
        let rules = server
            .access
            .iter()
            .map(|rule| {
                let (action, network) = match rule {
                    AccessRuleConfig::Allow(n) => (AccessAction::Allow, n),
                    AccessRuleConfig::Deny(n) => (AccessAction::Deny, n),
                };
                Network::parse(network)
                    .map(|network| AccessRule { action, network })
                    .map_err(|reason| ConfigError::InvalidAccessRule {
                        server: server.name.clone(),
                        reason,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        conf.access = Some(Box::new(AccessRules::new(rules)));
    }

    Ok(conf)
}

/// `ip:port`, `[ip6]:port`, or a bare port on all IPv4 addresses.
fn parse_listen(addr: &str) -> Option<SocketAddr> {
    let addr = addr.trim();
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Some(sa);
    }
    addr.parse::<u16>()
        .ok()
        .map(|port| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("server '{server}': invalid listen address '{addr}'")]
    InvalidListen { server: String, addr: String },
    #[error("server '{0}': buffer_size must be greater than zero")]
    InvalidBufferSize(String),
    #[error("server '{server}': no [server.tls] certificate for ssl listener '{addr}'")]
    MissingCertificate { server: String, addr: String },
    #[error("server '{server}': {source}")]
    Tls {
        server: String,
        #[source]
        source: TlsError,
    },
    #[error("server '{server}': invalid access rule: {reason}")]
    InvalidAccessRule { server: String, reason: String },
    #[error(transparent)]
    AddrTable(#[from] AddrTableError),
    #[error("no listen addresses configured")]
    NoListeners,
}
