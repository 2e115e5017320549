use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;

// Node configuration sourced from environment variables, with an optional
// YAML override file for ops-managed deployments.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Node identity registered with discovery and stamped on bus envelopes.
    pub node_id: String,
    // TCP listener bind host/port.
    pub host: String,
    pub tcp_port: u16,
    // Hard cap on concurrent connections.
    pub max_conn: usize,
    // Dispatcher worker count.
    pub worker_pool_size: usize,
    // Per-worker (and per-session outbound) queue depth.
    pub max_msg_chan_len: usize,
    // Frames larger than this close the connection.
    pub max_packet_size: usize,
    pub heartbeat: HeartbeatConfig,
    pub mysql: MySqlConfig,
    // TTL applied to offline queues, history logs, and relations, seconds.
    pub message_expiration_secs: u64,
    pub auth: AuthSettings,
    pub sharding: ShardingConfig,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct MySqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
}

impl MySqlConfig {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub jwt_expires_in_secs: u64,
    pub jwt_issuer: String,
    pub signature_secret: String,
    pub signature_check_enabled: bool,
    pub timestamp_tolerance_secs: i64,
    pub nonce_expiration_secs: u64,
    pub session_expiration_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ShardingConfig {
    pub enabled: bool,
    pub shard_count: u32,
}

const DEFAULT_CONFIG_PATH: &str = "/usr/local/parley/chatd.yml";
const DEFAULT_TCP_PORT: u16 = 9000;
const DEFAULT_MAX_CONN: usize = 12_000;
const DEFAULT_WORKER_POOL_SIZE: usize = 10;
const DEFAULT_MAX_MSG_CHAN_LEN: usize = 1024;
const DEFAULT_MAX_PACKET_SIZE: usize = 4096;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 180;
const DEFAULT_MESSAGE_EXPIRATION_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_JWT_EXPIRES_IN_SECS: u64 = 86_400;
const DEFAULT_TIMESTAMP_TOLERANCE_SECS: i64 = 300;
const DEFAULT_NONCE_EXPIRATION_SECS: u64 = 600;
const DEFAULT_SESSION_EXPIRATION_SECS: u64 = 86_400;
const DEFAULT_SHARD_COUNT: u32 = 4;

#[derive(Debug, Deserialize)]
struct ConfigOverride {
    node_id: Option<String>,
    host: Option<String>,
    tcp_port: Option<u16>,
    max_conn: Option<usize>,
    worker_pool_size: Option<usize>,
    max_msg_chan_len: Option<usize>,
    max_packet_size: Option<usize>,
    heartbeat: Option<HeartbeatOverride>,
    mysql: Option<MySqlOverride>,
    message_expiration_secs: Option<u64>,
    auth: Option<AuthOverride>,
    sharding: Option<ShardingOverride>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatOverride {
    enabled: Option<bool>,
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MySqlOverride {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    max_open_conns: Option<u32>,
    max_idle_conns: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AuthOverride {
    jwt_secret: Option<String>,
    jwt_expires_in_secs: Option<u64>,
    jwt_issuer: Option<String>,
    signature_secret: Option<String>,
    signature_check_enabled: Option<bool>,
    timestamp_tolerance_secs: Option<i64>,
    nonce_expiration_secs: Option<u64>,
    session_expiration_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ShardingOverride {
    enabled: Option<bool>,
    shard_count: Option<u32>,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let node_id = std::env::var("CHATD_NODE_ID").unwrap_or_else(|_| {
            let suffix: u32 = std::process::id();
            format!("chatd-{suffix}")
        });
        Ok(Self {
            node_id,
            host: env_string("CHATD_HOST", "0.0.0.0"),
            tcp_port: env_parse("CHATD_TCP_PORT", DEFAULT_TCP_PORT),
            max_conn: env_parse("CHATD_MAX_CONN", DEFAULT_MAX_CONN),
            worker_pool_size: env_parse("CHATD_WORKER_POOL_SIZE", DEFAULT_WORKER_POOL_SIZE).max(1),
            max_msg_chan_len: env_parse("CHATD_MAX_MSG_CHAN_LEN", DEFAULT_MAX_MSG_CHAN_LEN).max(1),
            max_packet_size: env_parse("CHATD_MAX_PACKET_SIZE", DEFAULT_MAX_PACKET_SIZE).max(1),
            heartbeat: HeartbeatConfig {
                enabled: env_bool("CHATD_HEARTBEAT_ENABLED", true),
                interval_secs: env_parse(
                    "CHATD_HEARTBEAT_INTERVAL_SECS",
                    DEFAULT_HEARTBEAT_INTERVAL_SECS,
                ),
                timeout_secs: env_parse(
                    "CHATD_HEARTBEAT_TIMEOUT_SECS",
                    DEFAULT_HEARTBEAT_TIMEOUT_SECS,
                ),
            },
            mysql: MySqlConfig {
                host: env_string("CHATD_MYSQL_HOST", "127.0.0.1"),
                port: env_parse("CHATD_MYSQL_PORT", 3306),
                user: env_string("CHATD_MYSQL_USER", "parley"),
                password: env_string("CHATD_MYSQL_PASSWORD", ""),
                database: env_string("CHATD_MYSQL_DATABASE", "parley"),
                max_open_conns: env_parse("CHATD_MYSQL_MAX_OPEN_CONNS", 50),
                max_idle_conns: env_parse("CHATD_MYSQL_MAX_IDLE_CONNS", 10),
            },
            message_expiration_secs: env_parse(
                "CHATD_MESSAGE_EXPIRATION_SECS",
                DEFAULT_MESSAGE_EXPIRATION_SECS,
            ),
            auth: AuthSettings {
                jwt_secret: env_string("CHATD_JWT_SECRET", "change-me-in-production"),
                jwt_expires_in_secs: env_parse(
                    "CHATD_JWT_EXPIRES_IN_SECS",
                    DEFAULT_JWT_EXPIRES_IN_SECS,
                ),
                jwt_issuer: env_string("CHATD_JWT_ISSUER", "parley"),
                signature_secret: env_string("CHATD_SIGNATURE_SECRET", ""),
                signature_check_enabled: env_bool("CHATD_SIGNATURE_CHECK_ENABLED", false),
                timestamp_tolerance_secs: env_parse(
                    "CHATD_TIMESTAMP_TOLERANCE_SECS",
                    DEFAULT_TIMESTAMP_TOLERANCE_SECS,
                ),
                nonce_expiration_secs: env_parse(
                    "CHATD_NONCE_EXPIRATION_SECS",
                    DEFAULT_NONCE_EXPIRATION_SECS,
                ),
                session_expiration_secs: env_parse(
                    "CHATD_SESSION_EXPIRATION_SECS",
                    DEFAULT_SESSION_EXPIRATION_SECS,
                ),
            },
            sharding: ShardingConfig {
                enabled: env_bool("CHATD_SHARDING_ENABLED", false),
                shard_count: env_parse("CHATD_SHARD_COUNT", DEFAULT_SHARD_COUNT).max(1),
            },
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("CHATD_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound && override_path.is_none() => None,
            Err(err) => {
                return Err(err).with_context(|| format!("read chatd config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            let overrides: ConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse chatd config yaml")?;
            config.apply(overrides);
        }
        Ok(config)
    }

    fn apply(&mut self, overrides: ConfigOverride) {
        if let Some(value) = overrides.node_id {
            self.node_id = value;
        }
        if let Some(value) = overrides.host {
            self.host = value;
        }
        if let Some(value) = overrides.tcp_port {
            self.tcp_port = value;
        }
        if let Some(value) = overrides.max_conn {
            self.max_conn = value;
        }
        if let Some(value) = overrides.worker_pool_size
            && value > 0
        {
            self.worker_pool_size = value;
        }
        if let Some(value) = overrides.max_msg_chan_len
            && value > 0
        {
            self.max_msg_chan_len = value;
        }
        if let Some(value) = overrides.max_packet_size
            && value > 0
        {
            self.max_packet_size = value;
        }
        if let Some(heartbeat) = overrides.heartbeat {
            if let Some(value) = heartbeat.enabled {
                self.heartbeat.enabled = value;
            }
            if let Some(value) = heartbeat.interval_secs
                && value > 0
            {
                self.heartbeat.interval_secs = value;
            }
            if let Some(value) = heartbeat.timeout_secs
                && value > 0
            {
                self.heartbeat.timeout_secs = value;
            }
        }
        if let Some(mysql) = overrides.mysql {
            if let Some(value) = mysql.host {
                self.mysql.host = value;
            }
            if let Some(value) = mysql.port {
                self.mysql.port = value;
            }
            if let Some(value) = mysql.user {
                self.mysql.user = value;
            }
            if let Some(value) = mysql.password {
                self.mysql.password = value;
            }
            if let Some(value) = mysql.database {
                self.mysql.database = value;
            }
            if let Some(value) = mysql.max_open_conns {
                self.mysql.max_open_conns = value;
            }
            if let Some(value) = mysql.max_idle_conns {
                self.mysql.max_idle_conns = value;
            }
        }
        if let Some(value) = overrides.message_expiration_secs
            && value > 0
        {
            self.message_expiration_secs = value;
        }
        if let Some(auth) = overrides.auth {
            if let Some(value) = auth.jwt_secret {
                self.auth.jwt_secret = value;
            }
            if let Some(value) = auth.jwt_expires_in_secs
                && value > 0
            {
                self.auth.jwt_expires_in_secs = value;
            }
            if let Some(value) = auth.jwt_issuer {
                self.auth.jwt_issuer = value;
            }
            if let Some(value) = auth.signature_secret {
                self.auth.signature_secret = value;
            }
            if let Some(value) = auth.signature_check_enabled {
                self.auth.signature_check_enabled = value;
            }
            if let Some(value) = auth.timestamp_tolerance_secs {
                self.auth.timestamp_tolerance_secs = value;
            }
            if let Some(value) = auth.nonce_expiration_secs {
                self.auth.nonce_expiration_secs = value;
            }
            if let Some(value) = auth.session_expiration_secs {
                self.auth.session_expiration_secs = value;
            }
        }
        if let Some(sharding) = overrides.sharding {
            if let Some(value) = sharding.enabled {
                self.sharding.enabled = value;
            }
            if let Some(value) = sharding.shard_count
                && value > 0
            {
                self.sharding.shard_count = value;
            }
        }
    }

    /// Defaults suitable for tests: ephemeral port, fast heartbeat knobs
    /// left at production values unless a test overrides them.
    pub fn for_tests() -> Self {
        let mut config = Self::from_env().expect("env config");
        config.host = "127.0.0.1".to_string();
        config.tcp_port = 0;
        config
    }
}
