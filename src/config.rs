//! Environment-sourced runtime configuration.
//!
//! Mirrors the bit-exact environment contract in the specification (§6):
//! every value has a documented default so a host can boot with zero
//! configuration in development, and every value is overridable per
//! deployment.

use std::time::Duration;

/// Runtime configuration for one host process.
///
/// Construct with [`Config::from_env`] (strict, errors on malformed values)
/// or [`Config::from_env_or_default`] (best-effort, logs and falls back).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of sessions this host will claim concurrently.
    pub max_workers_per_container: usize,
    /// KV (Redis) connection endpoint.
    pub redis: RedisEndpoint,
    /// Sessions idle longer than this are reaped (`status=terminated`).
    pub idle_timeout_ms: u64,
    /// TTL of a session lease; a host silent longer than this implicitly
    /// relinquishes its claimed sessions.
    pub session_lease_ttl_ms: u64,
    /// Interval between idle-reaper sweeps.
    pub idle_reap_interval_ms: u64,
    /// Cursor-scan batch size used by the idle reaper.
    pub idle_reap_batch_size: usize,
}

/// Redis connection parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisEndpoint {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl RedisEndpoint {
    /// Render as a `redis://[:password@]host:port` connection string.
    pub fn connection_string(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{password}@{}:{}", self.host, self.port)
            }
            _ => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

impl Default for RedisEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
        }
    }
}

/// An environment variable couldn't be parsed into the expected type.
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers_per_container: 5,
            redis: RedisEndpoint::default(),
            idle_timeout_ms: 1_800_000,
            session_lease_ttl_ms: 30_000,
            idle_reap_interval_ms: 300_000,
            idle_reap_batch_size: 100,
        }
    }
}

impl Config {
    /// Load configuration from the process environment, loading a `.env`
    /// file first if present. Returns an error on the first malformed
    /// (present-but-unparsable) value; missing values fall back to
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let max_workers_per_container = parse_env_or(
            "MAX_WORKERS_PER_CONTAINER",
            defaults.max_workers_per_container,
        )?;
        let idle_timeout_ms = parse_env_or("IDLE_TIMEOUT_MS", defaults.idle_timeout_ms)?;
        let session_lease_ttl_ms =
            parse_env_or("SESSION_LEASE_TTL_MS", defaults.session_lease_ttl_ms)?;
        let idle_reap_interval_ms =
            parse_env_or("IDLE_REAP_INTERVAL_MS", defaults.idle_reap_interval_ms)?;
        let idle_reap_batch_size =
            parse_env_or("IDLE_REAP_BATCH_SIZE", defaults.idle_reap_batch_size)?;

        let redis = RedisEndpoint {
            host: std::env::var("REDIS_HOST").unwrap_or(defaults.redis.host),
            port: parse_env_or("REDIS_PORT", defaults.redis.port)?,
            password: std::env::var("REDIS_PASSWORD").ok(),
        };

        Ok(Self {
            max_workers_per_container,
            redis,
            idle_timeout_ms,
            session_lease_ttl_ms,
            idle_reap_interval_ms,
            idle_reap_batch_size,
        })
    }

    /// Load from the environment, logging and falling back to defaults on
    /// any error. Convenient for `main()` entry points that would rather
    /// boot with defaults than fail outright.
    pub fn from_env_or_default() -> Self {
        match Self::from_env() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(target: "session_core::config", %err, "falling back to default configuration");
                Self::default()
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn session_lease_ttl(&self) -> Duration {
        Duration::from_millis(self.session_lease_ttl_ms)
    }

    pub fn idle_reap_interval(&self) -> Duration {
        Duration::from_millis(self.idle_reap_interval_ms)
    }
}

fn parse_env_or<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match std::env::var(var) {
        Ok(value) => value.parse::<T>().map_err(|_| ConfigError {
            var,
            value: value.clone(),
        }),
        Err(_) => Ok(default),
    }
}
