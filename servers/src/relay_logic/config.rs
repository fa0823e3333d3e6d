use anyhow::{Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_common::connections::cache_redis::DEFAULT_CHANNEL;
use lib_common::markets::kraken::{DEFAULT_REST_URL, DEFAULT_WS_URL};

pub const DEFAULT_CONFIG_FILE: &str = "server_relay.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Market data relay: one upstream feed, many downstream consumers", version)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[clap(long, env = "RELAY_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RELAY_UPSTREAM_URL", help = "Upstream WebSocket feed URL.")]
    pub upstream_ws_url: Option<String>,

    #[clap(long, env = "RELAY_REST_API_URL", help = "Base URL of the provider REST API.")]
    pub rest_api_url: Option<String>,

    #[clap(long, env = "RELAY_SHARED_SECRET", help = "Shared secret required by privileged endpoints.")]
    pub shared_secret: Option<String>,

    #[clap(long, env = "RELAY_HISTORY_CACHE_TTL_SECONDS", help = "Lifetime of cached historical candles.")]
    pub history_cache_ttl_seconds: Option<u64>,

    #[clap(long, env = "RELAY_COMPUTE_CACHE_TTL_SECONDS", help = "Lifetime of cached indicator responses.")]
    pub compute_cache_ttl_seconds: Option<u64>,

    #[clap(long, env = "RELAY_BROADCAST_URL", help = "Redis URL for cross-process event broadcast.")]
    pub broadcast_url: Option<String>,

    #[clap(long, env = "RELAY_BROADCAST_CHANNEL", help = "Pub/sub channel for normalized events.")]
    pub broadcast_channel: Option<String>,

    #[clap(long, env = "RELAY_RATE_LIMIT_PER_MINUTE", help = "REST requests allowed per client per minute.")]
    pub rate_limit_per_minute: Option<u32>,

    #[clap(long, env = "RELAY_HISTORY_TIMEOUT_MS", help = "Timeout for historical candle requests.")]
    pub history_timeout_ms: Option<u64>,

    #[clap(long, env = "RELAY_SYMBOL_CACHE_PATH", help = "Where the pair catalog is cached on disk.")]
    pub symbol_cache_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_DEFAULT_INTERVAL", help = "Candle interval in minutes when a request names none.")]
    pub default_interval: Option<u32>,

    #[clap(long, env = "RELAY_IDLE_TIMEOUT_SECONDS", help = "Seconds without upstream frames before reconnecting.")]
    pub idle_timeout_seconds: Option<u64>,

    #[clap(long, env = "RELAY_CATALOG_TIMEOUT_MS", help = "Timeout for fetching the pair catalog.")]
    pub catalog_timeout_ms: Option<u64>,

    #[clap(
        long,
        env = "RELAY_TRUST_FORWARDED_FOR",
        help = "Key the rate limiter on X-Forwarded-For (only behind a trusted proxy)."
    )]
    pub trust_forwarded_for: Option<bool>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            upstream_ws_url: other.upstream_ws_url.or(self.upstream_ws_url),
            rest_api_url: other.rest_api_url.or(self.rest_api_url),
            shared_secret: other.shared_secret.or(self.shared_secret),
            history_cache_ttl_seconds: other.history_cache_ttl_seconds.or(self.history_cache_ttl_seconds),
            compute_cache_ttl_seconds: other.compute_cache_ttl_seconds.or(self.compute_cache_ttl_seconds),
            broadcast_url: other.broadcast_url.or(self.broadcast_url),
            broadcast_channel: other.broadcast_channel.or(self.broadcast_channel),
            rate_limit_per_minute: other.rate_limit_per_minute.or(self.rate_limit_per_minute),
            history_timeout_ms: other.history_timeout_ms.or(self.history_timeout_ms),
            symbol_cache_path: other.symbol_cache_path.or(self.symbol_cache_path),
            default_interval: other.default_interval.or(self.default_interval),
            idle_timeout_seconds: other.idle_timeout_seconds.or(self.idle_timeout_seconds),
            catalog_timeout_ms: other.catalog_timeout_ms.or(self.catalog_timeout_ms),
            trust_forwarded_for: other.trust_forwarded_for.or(self.trust_forwarded_for),
        }
    }

    pub fn defaults() -> Config {
        Config {
            port: Some(9003),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            upstream_ws_url: Some(DEFAULT_WS_URL.to_string()),
            rest_api_url: Some(DEFAULT_REST_URL.to_string()),
            history_cache_ttl_seconds: Some(30),
            compute_cache_ttl_seconds: Some(15),
            broadcast_channel: Some(DEFAULT_CHANNEL.to_string()),
            rate_limit_per_minute: Some(300),
            history_timeout_ms: Some(8000),
            symbol_cache_path: Some(PathBuf::from("./cache/kraken_pairs.json")),
            default_interval: Some(1),
            idle_timeout_seconds: Some(60),
            catalog_timeout_ms: Some(10_000),
            trust_forwarded_for: Some(false),
            ..Default::default()
        }
    }

    /// Fills every remaining gap and validates the result.
    pub fn resolve(self) -> Result<Settings> {
        let c = Config::defaults().merge(self);
        let port = c.port.unwrap_or(9003);
        let rate_limit_per_minute = c.rate_limit_per_minute.unwrap_or(300);
        if rate_limit_per_minute == 0 {
            bail!("rate_limit_per_minute must be at least 1");
        }
        let default_interval = c.default_interval.unwrap_or(1);
        if default_interval == 0 {
            bail!("default_interval must be at least 1 minute");
        }

        Ok(Settings {
            port,
            log_dir: c.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: c.log_level.unwrap_or_else(|| "info".to_string()),
            upstream_ws_url: c.upstream_ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            rest_api_url: c.rest_api_url.unwrap_or_else(|| DEFAULT_REST_URL.to_string()),
            shared_secret: c.shared_secret.filter(|s| !s.is_empty()),
            history_cache_ttl: Duration::from_secs(c.history_cache_ttl_seconds.unwrap_or(30)),
            compute_cache_ttl: Duration::from_secs(c.compute_cache_ttl_seconds.unwrap_or(15)),
            broadcast_url: c.broadcast_url.filter(|s| !s.is_empty()),
            broadcast_channel: c.broadcast_channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            rate_limit_per_minute,
            history_timeout: Duration::from_millis(c.history_timeout_ms.unwrap_or(8000)),
            symbol_cache_path: c.symbol_cache_path,
            default_interval,
            idle_timeout: Duration::from_secs(c.idle_timeout_seconds.unwrap_or(60)),
            catalog_timeout: Duration::from_millis(c.catalog_timeout_ms.unwrap_or(10_000)),
            trust_forwarded_for: c.trust_forwarded_for.unwrap_or(false),
        })
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub upstream_ws_url: String,
    pub rest_api_url: String,
    pub shared_secret: Option<String>,
    pub history_cache_ttl: Duration,
    pub compute_cache_ttl: Duration,
    pub broadcast_url: Option<String>,
    pub broadcast_channel: String,
    pub rate_limit_per_minute: u32,
    pub history_timeout: Duration,
    pub symbol_cache_path: Option<PathBuf>,
    pub default_interval: u32,
    pub idle_timeout: Duration,
    pub catalog_timeout: Duration,
    /// Rate-limit on the first `X-Forwarded-For` hop instead of the peer.
    pub trust_forwarded_for: bool,
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the JSON file, then CLI/env values (highest precedence).
pub fn load_config_from(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

pub fn load_config() -> Config {
    load_config_from(Config::parse())
}
