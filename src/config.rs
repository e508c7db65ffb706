use crate::error::{Result, ZartanError};
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Pool, health and provisioning tunables
    pub tunables: Tunables,
    /// Background job configuration
    pub jobs: JobsConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 3000)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// API keys accepted by `authenticate` and the v1 endpoints
    pub api_keys: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    /// SSL mode (disable, require, prefer)
    pub ssl_mode: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL (redis:// or rediss://)
    pub url: String,
    /// Prefix applied to every key
    pub namespace: String,
}

/// Knobs consumed by the pool, health tracker and provisioning code.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Failures within one report window that trigger a targeted analysis
    pub failure_threshold: u64,
    /// Proxies whose success ratio falls below this are evicted
    pub success_ratio_threshold: f64,
    /// Overrides the computed minimum sample size for eviction
    pub min_sample_size: Option<u64>,
    /// How long a newly created server may take to become ready
    pub server_ready_timeout: Duration,
    /// Delay between orphan searches while servers are building
    pub server_poll_interval: Duration,
    /// TTL of client lease reservations
    pub client_session_timeout: Duration,
    /// Length of the per-source recently decommissioned server list
    pub fog_recent_decommissions_length: usize,
    /// Hard expiration of a site's pool lock
    pub pool_lock_expiration: Duration,
    /// How long a caller waits for a site's pool lock
    pub pool_lock_wait: Duration,
    /// Retry interval handed to clients when no proxy is available
    pub default_retry_interval: Duration,
    /// Bound of the persistent per-source error log
    pub max_source_errors: usize,
    /// How often every site is re-analyzed
    pub global_analysis_interval: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_ratio_threshold: 0.5,
            min_sample_size: None,
            server_ready_timeout: Duration::from_secs(60),
            server_poll_interval: Duration::from_secs(10),
            client_session_timeout: Duration::from_secs(300),
            fog_recent_decommissions_length: 50,
            pool_lock_expiration: Duration::from_secs(60),
            pool_lock_wait: Duration::from_millis(5000),
            default_retry_interval: Duration::from_secs(5),
            max_source_errors: 20,
            global_analysis_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Maximum number of jobs executing at once
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            api: ApiServerConfig {
                port: parse_env("API_PORT", "3000")?,
                host: get_env_or("API_HOST", "0.0.0.0"),
                api_keys: get_env_or("API_KEYS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            database: DatabaseConfig {
                host: get_env_or("DB_HOST", "localhost"),
                port: parse_env("DB_PORT", "5432")?,
                user: get_env_or("DB_USER", "zartan"),
                password: get_env_or("DB_PASSWORD", "zartan_password"),
                name: get_env_or("DB_NAME", "zartan"),
                ssl_mode: get_env_or("DB_SSLMODE", "disable"),
                max_connections: parse_env("DB_MAX_CONNECTIONS", "20")?,
                min_connections: parse_env("DB_MIN_CONNECTIONS", "2")?,
            },
            redis: RedisConfig {
                url: parse_redis_url()?,
                namespace: get_env_or("REDIS_NAMESPACE", "zartan"),
            },
            tunables: parse_tunables()?,
            jobs: JobsConfig {
                workers: parse_env::<usize>("JOB_WORKERS", "4")?.max(1),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Get the database connection URL
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.database.user,
            self.database.password,
            self.database.host,
            self.database.port,
            self.database.name,
            self.database.ssl_mode
        )
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

fn parse_tunables() -> Result<Tunables> {
    let success_ratio_threshold: f64 = parse_env("SUCCESS_RATIO_THRESHOLD", "0.5")?;
    if !(0.0..=1.0).contains(&success_ratio_threshold) {
        return Err(ZartanError::InvalidConfig(
            "SUCCESS_RATIO_THRESHOLD must be between 0 and 1".into(),
        ));
    }

    let min_sample_size = match env::var("MIN_SAMPLE_SIZE") {
        Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse().map_err(|_| {
            ZartanError::InvalidConfig("MIN_SAMPLE_SIZE must be a valid number".into())
        })?),
        _ => None,
    };

    Ok(Tunables {
        failure_threshold: parse_env("FAILURE_THRESHOLD", "10")?,
        success_ratio_threshold,
        min_sample_size,
        server_ready_timeout: Duration::from_secs(parse_env("SERVER_READY_TIMEOUT", "60")?),
        server_poll_interval: Duration::from_secs(
            parse_env::<u64>("SERVER_POLL_INTERVAL", "10")?.max(1),
        ),
        client_session_timeout: Duration::from_secs(parse_env("CLIENT_SESSION_TIMEOUT", "300")?),
        fog_recent_decommissions_length: parse_env("FOG_RECENT_DECOMMISSIONS_LENGTH", "50")?,
        pool_lock_expiration: Duration::from_secs(parse_env("POOL_LOCK_EXPIRATION", "60")?),
        pool_lock_wait: Duration::from_millis(parse_env("POOL_LOCK_WAIT", "5000")?),
        default_retry_interval: Duration::from_secs(parse_env("DEFAULT_RETRY_INTERVAL", "5")?),
        max_source_errors: parse_env("MAX_SOURCE_ERRORS", "20")?,
        global_analysis_interval: Duration::from_secs(
            parse_env::<u64>("GLOBAL_ANALYSIS_INTERVAL", "300")?.max(1),
        ),
    })
}

fn parse_redis_url() -> Result<String> {
    let raw = get_env_or("REDIS_URL", "redis://127.0.0.1:6379/0");
    let url = Url::parse(raw.trim()).map_err(|e| {
        ZartanError::InvalidConfig(format!("REDIS_URL must be a valid URL: {}", e))
    })?;

    match url.scheme() {
        "redis" | "rediss" => {}
        other => {
            return Err(ZartanError::InvalidConfig(format!(
                "REDIS_URL has unsupported scheme: {}",
                other
            )))
        }
    }

    if url.host_str().is_none() {
        return Err(ZartanError::InvalidConfig(
            "REDIS_URL must include a host".into(),
        ));
    }

    Ok(url.to_string())
}

/// Parse an environment variable, falling back to a default
fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| ZartanError::InvalidConfig(format!("{} must be a valid number", key)))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
