// Environment-driven configuration for the relay server and client node
//
// Invalid or unparsable values are fatal at startup; everything has a
// development default so a bare `olaf server` comes up on localhost.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: String, value: String },
    #[error("neighbour address '{0}' is not host:port")]
    BadNeighbourAddress(String),
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn env_bool(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "true" | "1" | "t"
    )
}

/// Split a comma-separated `host:port` list.
pub fn parse_neighbour_addresses(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut addresses = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((host, port)) = part.rsplit_once(':') else {
            return Err(ConfigError::BadNeighbourAddress(part.to_string()));
        };
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(ConfigError::BadNeighbourAddress(part.to_string()));
        }
        addresses.push(part.to_string());
    }
    Ok(addresses)
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface the three listeners bind to.
    pub bind_address: String,
    /// Client-facing WebSocket port.
    pub client_ws_port: u16,
    /// Peer-facing WebSocket port.
    pub server_ws_port: u16,
    /// HTTP port for the file store.
    pub http_port: u16,
    /// Neighbour `host:port` addresses (their peer WebSocket ports).
    pub neighbour_addresses: Vec<String>,
    /// Hostname other parties reach this server by; used in the canonical
    /// address and in minted file URLs.
    pub external_address: String,
    /// Log sanitized copies of every frame.
    pub log_messages: bool,

    /// Server key pair location.
    pub config_dir: PathBuf,
    /// One `<host>_<port>_public_key.pem` per neighbour.
    pub neighbours_dir: PathBuf,
    /// Persisted client public keys.
    pub clients_dir: PathBuf,
    /// Uploaded files.
    pub files_dir: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0"),
            client_ws_port: env_parse("CLIENT_WS_PORT", 8765)?,
            server_ws_port: env_parse("SERVER_WS_PORT", 8766)?,
            http_port: env_parse("HTTP_PORT", 8081)?,
            neighbour_addresses: parse_neighbour_addresses(&env_or("NEIGHBOUR_ADDRESSES", ""))?,
            external_address: env_or("EXTERNAL_ADDRESS", "127.0.0.1"),
            log_messages: env_bool("LOG_MESSAGES"),
            config_dir: env_or("CONFIG_DIR", "config").into(),
            neighbours_dir: env_or("NEIGHBOURS_DIR", "neighbours").into(),
            clients_dir: env_or("CLIENTS_DIR", "clients").into(),
            files_dir: env_or("FILES_DIR", "files").into(),
        })
    }

    /// The address this server is known by in the neighbourhood — what
    /// peers dial and what `destination_servers` entries are matched
    /// against.
    pub fn canonical_address(&self) -> String {
        format!("{}:{}", self.external_address, self.server_ws_port)
    }
}

/// Client node configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Home server host.
    pub server_address: String,
    /// Home server client WebSocket port.
    pub server_port: u16,
    /// Home server HTTP (file store) port.
    pub http_port: u16,
    /// Display name; never authoritative, never leaves the facade.
    pub client_name: String,
    /// Seconds to keep received messages. -1 keeps forever, 0 drops
    /// immediately.
    pub message_expiry: i64,
    /// Port the local HTTP facade listens on.
    pub facade_port: u16,

    /// Client key pair location.
    pub config_dir: PathBuf,
    /// messages.jsonl location.
    pub chat_data_dir: PathBuf,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server_address: env_or("SERVER_ADDRESS", "127.0.0.1"),
            server_port: env_parse("SERVER_PORT", 8765)?,
            http_port: env_parse("HTTP_PORT", 8081)?,
            client_name: env_or("CLIENT_NAME", "anonymous"),
            message_expiry: env_parse("MESSAGE_EXPIRY_TIME", -1)?,
            facade_port: env_parse("FACADE_PORT", 5000)?,
            config_dir: env_or("CONFIG_DIR", "config").into(),
            chat_data_dir: env_or("CHAT_DATA_DIR", "chat_data").into(),
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.server_address, self.server_port)
    }

    pub fn upload_url(&self) -> String {
        format!("http://{}:{}/api/upload", self.server_address, self.http_port)
    }
}
