//! Environment-variable configuration, 12-factor style.
//!
//! Required variables missing at startup are a hard error — there is no
//! sensible default for an upstream credential. Everything else falls back
//! to the same defaults the gateway this config layer was modeled on ships.

use std::env;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Something was wrong with the process environment at startup.
#[derive(Debug)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

fn required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError(format!("missing required env var {key}")))
}

fn optional_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn optional_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "t" | "1" | "yes" | "y"),
        Err(_) => default,
    }
}

/// Upstream message-platform credentials and tuning.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_id: i32,
    pub api_hash: String,
    pub bot_token: String,
    pub workers: u32,
    pub multi_client: bool,
    pub sleep_threshold: u64,
    pub chunk_size: u64,
    pub connection_retries: u32,
    pub max_concurrent_downloads: u32,
    pub debug: bool,
    pub enable_thumbnails: bool,
}

/// HTTP listener and per-request tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_address: IpAddr,
    pub fqdn: String,
    pub has_ssl: bool,
    pub no_port: bool,
    pub request_timeout: Duration,
    pub rate_limit: u64,
    pub burst_limit: u64,
    pub max_clients: u32,
    pub cache_size: usize,
    pub cache_ttl: Duration,
    pub rate_limit_whitelist: Vec<String>,
}

impl ServerConfig {
    /// The externally-visible base URL, e.g. `http://0.0.0.0:8080/`.
    pub fn public_url(&self) -> String {
        format!(
            "http{}://{}{}/",
            if self.has_ssl { "s" } else { "" },
            self.fqdn,
            if self.no_port {
                String::new()
            } else {
                format!(":{}", self.port)
            },
        )
    }
}

/// Deployment mode: a primary instance owns the bot/control-plane
/// lifecycle; a secondary is a read-only streaming replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Primary,
    Secondary,
}

/// Metadata-store connection details.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub session_name: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from the process environment. Fails fast on any
    /// missing required variable so a misconfigured deployment never
    /// starts serving with a half-built config.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address: IpAddr = optional_parsed("BIND_ADDRESS", "0.0.0.0".parse().unwrap());

        let telegram = TelegramConfig {
            api_id: required("API_ID")?
                .parse()
                .map_err(|_| ConfigError("API_ID must be an integer".into()))?,
            api_hash: required("API_HASH")?,
            bot_token: required("BOT_TOKEN")?,
            workers: optional_parsed("WORKERS", 12),
            multi_client: optional_bool("MULTI_CLIENT", true),
            sleep_threshold: optional_parsed("SLEEP_THRESHOLD", 60),
            chunk_size: optional_parsed("CHUNK_SIZE", 524_288),
            connection_retries: optional_parsed("CONNECTION_RETRIES", 3),
            max_concurrent_downloads: optional_parsed("MAX_CONCURRENT_DOWNLOADS", 20),
            debug: optional_bool("DEBUG", false),
            enable_thumbnails: optional_bool("ENABLE_THUMBNAILS", false),
        };

        let port = optional_parsed("PORT", 8080u16);
        let fqdn = env::var("FQDN").unwrap_or_else(|_| bind_address.to_string());
        let server = ServerConfig {
            port,
            bind_address,
            fqdn,
            has_ssl: optional_bool("HAS_SSL", false),
            no_port: optional_bool("NO_PORT", false),
            request_timeout: Duration::from_secs(optional_parsed("REQUEST_TIMEOUT", 300)),
            rate_limit: optional_parsed("RATE_LIMIT", 30),
            burst_limit: optional_parsed("BURST_LIMIT", 10),
            max_clients: optional_parsed("MAX_CLIENTS", 10_000),
            cache_size: optional_parsed("CACHE_SIZE", 1000),
            cache_ttl: Duration::from_secs(optional_parsed("CACHE_TTL", 3600)),
            rate_limit_whitelist: env::var("RATE_LIMIT_WHITELIST")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
        };

        let database = DatabaseConfig {
            database_url: required("DATABASE_URL")?,
            session_name: env::var("SESSION_NAME").unwrap_or_else(|_| "FileStream".to_string()),
        };

        let mode = match env::var("MODE").unwrap_or_else(|_| "primary".to_string()).to_lowercase().as_str() {
            "secondary" => Mode::Secondary,
            _ => Mode::Primary,
        };

        Ok(Config {
            telegram,
            server,
            database,
            mode,
        })
    }

    /// Metadata cache capacity: 5x the response cache size, per the sizing
    /// guidance for the two-tier cache (metadata is expensive to
    /// recompute, responses are cheap to refuse).
    pub fn metadata_cache_capacity(&self) -> usize {
        self.server.cache_size * 5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "API_ID", "API_HASH", "BOT_TOKEN", "DATABASE_URL", "SESSION_NAME", "WORKERS",
            "MULTI_CLIENT", "CHUNK_SIZE", "PORT", "BIND_ADDRESS", "FQDN", "HAS_SSL", "NO_PORT",
            "REQUEST_TIMEOUT", "RATE_LIMIT", "BURST_LIMIT", "MAX_CLIENTS", "CACHE_SIZE",
            "CACHE_TTL", "MODE", "DEBUG", "ENABLE_THUMBNAILS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn missing_required_var_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn defaults_apply_when_optional_vars_are_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("API_ID", "12345");
        env::set_var("API_HASH", "abc");
        env::set_var("BOT_TOKEN", "tok");
        env::set_var("DATABASE_URL", "postgres://localhost/db");

        let config = Config::from_env().unwrap();
        assert_eq!(config.telegram.chunk_size, 524_288);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.rate_limit, 30);
        assert_eq!(config.mode, Mode::Primary);
        assert_eq!(config.metadata_cache_capacity(), 5000);
        clear_all();
    }

    #[test]
    fn public_url_respects_ssl_and_no_port() {
        let server = ServerConfig {
            port: 8080,
            bind_address: "0.0.0.0".parse().unwrap(),
            fqdn: "example.com".to_string(),
            has_ssl: true,
            no_port: true,
            request_timeout: Duration::from_secs(300),
            rate_limit: 30,
            burst_limit: 10,
            max_clients: 10_000,
            cache_size: 1000,
            cache_ttl: Duration::from_secs(3600),
            rate_limit_whitelist: Vec::new(),
        };
        assert_eq!(server.public_url(), "https://example.com/");
    }
}
