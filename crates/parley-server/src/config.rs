//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use parley_shared::constants::DEFAULT_NICKNAME;

/// Where rooms, users and messages are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend: {other}")),
        }
    }
}

/// A peer listed in `PEERS` as `public_key_hex@address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub public_key: String,
    pub address: String,
}

impl FromStr for BootstrapPeer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, address) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| format!("expected public_key@address, got {s}"))?;
        if key.len() != 64 || hex::decode(key).is_err() {
            return Err(format!("invalid peer public key: {key}"));
        }
        Ok(Self {
            public_key: key.to_ascii_lowercase(),
            address: address.to_string(),
        })
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Directory holding the database and identity files.
    /// Env: `DATA_DIR`
    /// Default: the platform data directory, else `./data`.
    pub data_dir: PathBuf,

    /// Env: `STORAGE` (`sqlite` | `memory`)
    /// Default: `sqlite`
    pub storage: StorageBackend,

    /// Nickname of this node's own identity.
    /// Env: `NODE_NICKNAME`
    pub node_nickname: String,

    // -- Connection hub --

    /// Frames buffered per connection before it is considered too slow.
    /// Env: `OUTBOUND_QUEUE_CAPACITY`
    pub outbound_queue_capacity: usize,

    /// Env: `PING_INTERVAL_SECS`
    pub ping_interval: Duration,

    /// A connection that has not answered a ping for this long is closed.
    /// Env: `LIVENESS_TIMEOUT_SECS`
    pub liveness_timeout: Duration,

    /// Env: `WRITE_TIMEOUT_SECS`
    pub write_timeout: Duration,

    /// Largest inbound WebSocket message accepted.
    /// Env: `MAX_FRAME_BYTES`
    pub max_frame_bytes: usize,

    /// `send_message` calls allowed per user per minute.
    /// Env: `RATE_LIMIT_PER_MINUTE`
    pub send_rate_per_minute: u32,

    // -- Peer node --

    /// Env: `HEARTBEAT_INTERVAL_SECS`
    pub heartbeat_interval: Duration,

    /// Env: `I2P_ENABLED` (true/false)
    pub i2p_enabled: bool,

    /// Env: `SAM_ADDRESS`
    pub sam_address: String,

    /// Env: `PEERS` (comma separated `public_key_hex@address`)
    pub peers: Vec<BootstrapPeer>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            data_dir: default_data_dir(),
            storage: StorageBackend::Sqlite,
            node_nickname: DEFAULT_NICKNAME.to_string(),
            outbound_queue_capacity: 256,
            ping_interval: Duration::from_secs(54),
            liveness_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_frame_bytes: 16 * 1024,
            send_rate_per_minute: 60,
            heartbeat_interval: Duration::from_secs(30),
            i2p_enabled: false,
            sam_address: "127.0.0.1:7656".to_string(),
            peers: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);
        parse_into(&lookup, "STORAGE", &mut config.storage);
        parse_into(&lookup, "OUTBOUND_QUEUE_CAPACITY", &mut config.outbound_queue_capacity);
        parse_into(&lookup, "MAX_FRAME_BYTES", &mut config.max_frame_bytes);
        parse_into(&lookup, "RATE_LIMIT_PER_MINUTE", &mut config.send_rate_per_minute);

        secs_into(&lookup, "PING_INTERVAL_SECS", &mut config.ping_interval);
        secs_into(&lookup, "LIVENESS_TIMEOUT_SECS", &mut config.liveness_timeout);
        secs_into(&lookup, "WRITE_TIMEOUT_SECS", &mut config.write_timeout);
        secs_into(&lookup, "HEARTBEAT_INTERVAL_SECS", &mut config.heartbeat_interval);

        if let Some(dir) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(name) = lookup("NODE_NICKNAME") {
            if !name.trim().is_empty() {
                config.node_nickname = name.trim().to_string();
            }
        }

        if let Some(val) = lookup("I2P_ENABLED") {
            config.i2p_enabled = val == "true" || val == "1";
        }

        if let Some(addr) = lookup("SAM_ADDRESS") {
            config.sam_address = addr;
        }

        if let Some(list) = lookup("PEERS") {
            for entry in list.split(',').filter(|e| !e.trim().is_empty()) {
                match entry.parse::<BootstrapPeer>() {
                    Ok(peer) => config.peers.push(peer),
                    Err(e) => tracing::warn!(error = %e, "Ignoring invalid PEERS entry"),
                }
            }
        }

        if config.outbound_queue_capacity == 0 {
            tracing::warn!("OUTBOUND_QUEUE_CAPACITY must be positive, using 1");
            config.outbound_queue_capacity = 1;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(e) => tracing::warn!(key, value = %raw, error = %e, "Invalid setting, using default"),
    }
}

fn secs_into(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    let mut secs = target.as_secs();
    parse_into(lookup, key, &mut secs);
    if secs == 0 {
        tracing::warn!(key, "Interval must be positive, using default");
        return;
    }
    *target = Duration::from_secs(secs);
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("org", "parley", "parley")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.liveness_timeout, Duration::from_secs(60));
        assert_eq!(config.storage, StorageBackend::Sqlite);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let key = "ab".repeat(32);
        let peers = format!("{key}@peer.i2p, nonsense");
        let config = config_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("STORAGE", "memory"),
            ("OUTBOUND_QUEUE_CAPACITY", "lots"),
            ("PING_INTERVAL_SECS", "5"),
            ("LIVENESS_TIMEOUT_SECS", "0"),
            ("I2P_ENABLED", "true"),
            ("PEERS", peers.as_str()),
        ]);

        assert_eq!(config.http_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.liveness_timeout, Duration::from_secs(60));
        assert!(config.i2p_enabled);
        assert_eq!(
            config.peers,
            vec![BootstrapPeer {
                public_key: key,
                address: "peer.i2p".into()
            }]
        );
    }
}
