//! Configuration loading: a hand-rolled `key = value` line parser with
//! `#` comments and recursive `include <path>`, matching the existing
//! fleet's config-file format exactly rather than adopting a generic format
//! like TOML/YAML.
//!
//! Grounded on the gateway's own config keys (§6) and the distilled-from
//! `dinio` config loader's one known bug: a `dispatch_threads < 1`
//! misconfiguration clamping `worker_threads` instead of `dispatch_threads`.
//! That bug is fixed here (see DESIGN.md).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::pool::PoolConfig;

pub const MAX_SERVER_NUM: usize = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("{path}:{line}: malformed line {text:?}")]
    MalformedLine { path: PathBuf, line: usize, text: String },
    #[error("{path}:{line}: invalid value for {key}: {text:?}")]
    InvalidValue { path: PathBuf, line: usize, key: String, text: String },
    #[error("server file lists more than {MAX_SERVER_NUM} backends")]
    TooManyServers,
    #[error("server_file is required but was not set")]
    MissingServerFile,
}

/// Fully-populated, immutably-shared gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port_no: u16,
    pub backlog: u32,
    pub worker_threads: usize,
    pub dispatch_threads: usize,
    pub daemon: bool,
    pub username: Option<String>,
    pub error_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub trace_flag: bool,
    pub datastore_timeout: Duration,
    pub lock_wait_time: Duration,
    pub active_check_interval: Duration,
    pub auto_detach: bool,
    pub pool: PoolConfig,
    pub server_file: Option<PathBuf>,
    pub replications: usize,
    pub replication_threads: usize,
    pub replication_delay_time: Duration,
    pub informed_port: u16,
    pub friend_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port_no: 11211,
            backlog: 100,
            worker_threads: 8,
            dispatch_threads: 20,
            daemon: false,
            username: None,
            error_file: None,
            output_file: None,
            trace_flag: false,
            datastore_timeout: Duration::from_millis(3000),
            lock_wait_time: Duration::from_secs(180),
            active_check_interval: Duration::from_secs(60),
            auto_detach: false,
            pool: PoolConfig {
                init_conns: 10,
                ext_conns: 20,
                ext_release_time: Duration::from_secs(180),
                wait_time: Duration::from_secs(10),
                connect_timeout: Duration::from_secs(3),
            },
            server_file: None,
            replications: 2,
            replication_threads: 3,
            replication_delay_time: Duration::from_millis(0),
            informed_port: 15432,
            friend_file: None,
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

/// Parses `path`, following `include` directives recursively, and folds
/// every `key = value` line into a flat map (later assignments win, matching
/// the original loader's last-one-wins semantics).
fn load_raw(path: &Path, out: &mut HashMap<String, String>) -> Result<(), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("include ") {
            let included = resolve_relative(path, rest.trim());
            load_raw(&included, out)?;
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::MalformedLine { path: path.to_path_buf(), line: idx + 1, text: line.to_string() });
        };
        out.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(())
}

fn resolve_relative(base: &Path, candidate: &str) -> PathBuf {
    let candidate_path = Path::new(candidate);
    if candidate_path.is_absolute() {
        return candidate_path.to_path_buf();
    }
    base.parent().map(|dir| dir.join(candidate_path)).unwrap_or_else(|| candidate_path.to_path_buf())
}

fn get_duration_ms(raw: &HashMap<String, String>, path: &Path, key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    match raw.get(key) {
        None => Ok(Duration::from_millis(default_ms)),
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue { path: path.to_path_buf(), line: 0, key: key.to_string(), text: v.clone() }),
    }
}

fn get_duration_secs(raw: &HashMap<String, String>, path: &Path, key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    match raw.get(key) {
        None => Ok(Duration::from_secs(default_secs)),
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue { path: path.to_path_buf(), line: 0, key: key.to_string(), text: v.clone() }),
    }
}

fn get_num<T: std::str::FromStr>(raw: &HashMap<String, String>, path: &Path, key: &str, default: T) -> Result<T, ConfigError> {
    match raw.get(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue { path: path.to_path_buf(), line: 0, key: key.to_string(), text: v.clone() }),
    }
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let mut raw = HashMap::new();
    load_raw(path, &mut raw)?;

    let mut cfg = Config {
        port_no: get_num(&raw, path, "port_no", Config::default().port_no)?,
        backlog: get_num(&raw, path, "backlog", Config::default().backlog)?,
        worker_threads: get_num(&raw, path, "worker_threads", Config::default().worker_threads)?,
        dispatch_threads: get_num(&raw, path, "dispatch_threads", Config::default().dispatch_threads)?,
        daemon: raw.get("daemon").map(|v| parse_bool(v).unwrap_or(false)).unwrap_or(false),
        username: raw.get("username").cloned(),
        error_file: raw.get("error_file").map(PathBuf::from),
        output_file: raw.get("output_file").map(PathBuf::from),
        trace_flag: raw.get("trace_flag").map(|v| parse_bool(v).unwrap_or(false)).unwrap_or(false),
        datastore_timeout: get_duration_ms(&raw, path, "datastore_timeout", 3000)?,
        lock_wait_time: get_duration_secs(&raw, path, "lock_wait_time", 180)?,
        active_check_interval: get_duration_secs(&raw, path, "active_check_interval", 60)?,
        auto_detach: raw.get("auto_detach").map(|v| parse_bool(v).unwrap_or(false)).unwrap_or(false),
        pool: PoolConfig {
            init_conns: get_num(&raw, path, "pool_init_conns", 10)?,
            ext_conns: get_num(&raw, path, "pool_ext_conns", 20)?,
            ext_release_time: get_duration_secs(&raw, path, "pool_ext_release_time", 180)?,
            wait_time: get_duration_secs(&raw, path, "pool_wait_time", 10)?,
            connect_timeout: Duration::from_secs(3),
        },
        server_file: raw.get("server_file").map(PathBuf::from),
        replications: get_num(&raw, path, "replications", 2)?,
        replication_threads: get_num(&raw, path, "replication_threads", 3)?,
        replication_delay_time: get_duration_ms(&raw, path, "replication_delay_time", 0)?,
        informed_port: get_num(&raw, path, "informed_port", 15432)?,
        friend_file: raw.get("friend_file").map(PathBuf::from),
    };

    // Fixed copy-paste bug from the original loader: a misconfigured
    // dispatch_threads clamps itself, not worker_threads.
    if cfg.dispatch_threads < 1 {
        cfg.dispatch_threads = 1;
    }

    Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerDef {
    pub ip: String,
    pub port: u16,
    pub scale_factor: u32,
}

/// Parses a server-definition file: one `ip port scale_factor` line per
/// backend, `#` comments, capped at `MAX_SERVER_NUM`.
pub fn load_server_file(path: &Path) -> Result<Vec<ServerDef>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let mut servers = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 3 {
            return Err(ConfigError::MalformedLine { path: path.to_path_buf(), line: idx + 1, text: line.to_string() });
        }
        let port: u16 = tokens[1]
            .parse()
            .map_err(|_| ConfigError::InvalidValue { path: path.to_path_buf(), line: idx + 1, key: "port".into(), text: tokens[1].into() })?;
        let scale_factor: u32 = tokens[2]
            .parse()
            .map_err(|_| ConfigError::InvalidValue { path: path.to_path_buf(), line: idx + 1, key: "scale_factor".into(), text: tokens[2].into() })?;
        servers.push(ServerDef { ip: tokens[0].to_string(), port, scale_factor });
        if servers.len() > MAX_SERVER_NUM {
            return Err(ConfigError::TooManyServers);
        }
    }
    Ok(servers)
}

#[derive(Debug, Clone)]
pub struct FriendDef {
    pub ip: String,
    pub port: u16,
}

/// Parses a friend-definition file: one `ip port` line per peer gateway.
pub fn load_friend_file(path: &Path) -> Result<Vec<FriendDef>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let mut peers = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 2 {
            return Err(ConfigError::MalformedLine { path: path.to_path_buf(), line: idx + 1, text: line.to_string() });
        }
        let port: u16 = tokens[1]
            .parse()
            .map_err(|_| ConfigError::InvalidValue { path: path.to_path_buf(), line: idx + 1, key: "port".into(), text: tokens[1].into() })?;
        peers.push(FriendDef { ip: tokens[0].to_string(), port });
    }
    Ok(peers)
}
