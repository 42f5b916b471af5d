//! Configuration loading and validation.
//!
//! The daemon is configured from a single TOML document. Every section has
//! serde defaults so a minimal config only needs `[server]` and one
//! listener; `validate` runs after load and refuses to start on anything
//! that would misbehave at runtime (bad SID, weak cloak secret, duplicate
//! listeners).

use lattice_proto::ident::ServerId;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

mod triggers;
pub use triggers::{ActionConfig, ConditionConfig, TriggerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub server_listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub motd: MotdConfig,
    #[serde(default)]
    pub opers: Vec<OperConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

/// `[server]` — identity of this server on the network.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// FQDN of this server (must contain a dot).
    pub name: String,
    /// Three-character TS6 server id.
    pub sid: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub admin_name: String,
    #[serde(default)]
    pub admin_email: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// One listening socket, client-facing or S2S.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub address: String,
    pub port: u16,
    /// Whether the transport below us terminates TLS on this port. The
    /// daemon itself never does; the flag only marks sessions as secure.
    #[serde(default)]
    pub tls: bool,
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.address, self.port).parse()
    }
}

/// `[[links]]` — a configured peer server.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// Remote server name (FQDN, matched against its SERVER line).
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Password we send in our PASS line.
    pub send_password: String,
    /// Password we expect in the peer's PASS line.
    pub receive_password: String,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default)]
    pub use_tls: bool,
    /// Pin for the peer's client certificate, if the transport provides one.
    #[serde(default)]
    pub certificate_fingerprint: Option<String>,
}

/// `[security]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub require_tls: bool,
    /// STS policy duration in seconds, advertised when nonzero.
    pub sts_duration: u64,
    /// HMAC key for hostmask cloaking. Must be strong; see `validate`.
    pub cloak_secret: String,
    /// Suffix label appended to cloaked hosts.
    pub cloak_suffix: String,
    pub rate_limit: RateLimitConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_tls: false,
            sts_duration: 0,
            cloak_secret: String::new(),
            cloak_suffix: "lattice".to_string(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// `[security.rate_limit]` — token bucket parameters (§ flood control).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Refill rate of the per-source-IP connection bucket.
    pub connections_per_second: u32,
    /// Capacity of the connection bucket.
    pub connection_burst: u32,
    /// Refill rate of the per-connection command bucket.
    pub commands_per_second: u32,
    /// Capacity of the command bucket.
    pub command_burst: u32,
    /// Consecutive starved commands before the connection is dropped with
    /// `ERROR :Excess Flood`.
    pub flood_threshold: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connections_per_second: 2,
            connection_burst: 6,
            commands_per_second: 4,
            command_burst: 10,
            flood_threshold: 16,
        }
    }
}

/// `[limits]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_nick_length: usize,
    pub max_channel_length: usize,
    pub max_topic_length: usize,
    /// Channels a single user may occupy.
    pub max_channels: usize,
    /// Targets per PRIVMSG/NOTICE.
    pub max_targets: usize,
    /// Seconds of silence before we PING.
    pub ping_interval: u64,
    /// Seconds to wait for the PONG.
    pub ping_timeout: u64,
    /// Seconds an unregistered connection may linger.
    pub registration_timeout: u64,
    /// Outbound queue depth per connection (Sendq).
    pub sendq_lines: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_nick_length: 30,
            max_channel_length: 50,
            max_topic_length: 390,
            max_channels: 50,
            max_targets: 4,
            ping_interval: 90,
            ping_timeout: 60,
            registration_timeout: 60,
            sendq_lines: 512,
        }
    }
}

/// `[database]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub message_retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "latticed.db".to_string(),
            message_retention_days: 30,
        }
    }
}

/// `[motd]`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MotdConfig {
    pub file: Option<String>,
    #[serde(default)]
    pub lines: Vec<String>,
}

impl MotdConfig {
    /// Resolve the MOTD: file wins over inline lines.
    pub fn load_lines(&self) -> Vec<String> {
        if let Some(path) = &self.file {
            match std::fs::read_to_string(path) {
                Ok(content) => return content.lines().map(str::to_string).collect(),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to read MOTD file");
                }
            }
        }
        if !self.lines.is_empty() {
            return self.lines.clone();
        }
        vec![
            "Welcome to latticed.".to_string(),
            "A TS6-style federated IRC server.".to_string(),
        ]
    }
}

/// `[[opers]]` — an operator block.
#[derive(Debug, Clone, Deserialize)]
pub struct OperConfig {
    pub name: String,
    /// Argon2 PHC-format hash of the operator password.
    pub password_hash: String,
    /// Hostmask the connection must match to use this block.
    #[serde(default = "default_oper_mask")]
    pub mask: String,
    /// Privilege names mapped onto the `OperPrivileges` bitflags.
    #[serde(default = "default_oper_privileges")]
    pub privileges: Vec<String>,
}

fn default_description() -> String {
    "Lattice IRC server".to_string()
}

fn default_network() -> String {
    "LatticeNet".to_string()
}

fn default_oper_mask() -> String {
    "*!*@*".to_string()
}

fn default_oper_privileges() -> Vec<String> {
    vec!["kill".into(), "kline".into(), "rehash".into(), "wallops".into()]
}

impl Config {
    /// Load and parse a config file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(Path::new(path)).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Validate a loaded configuration. Returns every problem found, so the
/// operator can fix them in one pass.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if ServerId::parse(&config.server.sid).is_err() {
        errors.push(format!(
            "server.sid must be 3 uppercase alphanumerics, got {:?}",
            config.server.sid
        ));
    }
    if !config.server.name.contains('.') {
        errors.push("server.name must be a fully qualified domain name".to_string());
    }
    if config.listeners.is_empty() {
        errors.push("at least one [[listeners]] block is required".to_string());
    }
    let mut seen = std::collections::HashSet::new();
    for listener in config.listeners.iter().chain(&config.server_listeners) {
        match listener.socket_addr() {
            Ok(addr) => {
                if !seen.insert(addr) {
                    errors.push(format!("duplicate listener {}", addr));
                }
            }
            Err(_) => errors.push(format!(
                "bad listener address {}:{}",
                listener.address, listener.port
            )),
        }
    }
    if crate::security::cloak::is_weak_secret(&config.security.cloak_secret) {
        errors.push(
            "security.cloak_secret is missing or weak; generate one with `openssl rand -hex 32`"
                .to_string(),
        );
    }
    for link in &config.links {
        if link.send_password.is_empty() || link.receive_password.is_empty() {
            errors.push(format!("link {} has an empty password", link.name));
        }
        if link.auto_connect && link.host.is_empty() {
            errors.push(format!("link {} has auto_connect but no host", link.name));
        }
    }
    for trigger in &config.triggers {
        if let Err(e) = trigger.check() {
            errors.push(format!("trigger {}: {}", trigger.id, e));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
