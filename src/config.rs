//! Typed runtime configuration, loaded from the environment with defaults.
//!
//! Mirrors `original_source/engine/config.py`'s field list one-for-one; see
//! spec.md §6 for the authoritative table.

use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required but was not set")]
    Missing(&'static str),
    #[error("{name} could not be parsed from {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub postgres_dsn: String,
    pub master_list_poll_interval: Duration,
    pub master_list_max_backoff: Duration,
    pub poll_interval_active: Duration,
    pub poll_interval_empty: Duration,
    pub poll_interval_offline: Duration,
    pub offline_failure_threshold: u32,
    pub server_query_timeout: Duration,
    pub worker_count: usize,
}

const MASTER_LIST_URL: &str = "http://master.bf1942.org/json";

impl Config {
    /// Loads configuration from the process environment, applying the
    /// defaults documented in spec.md §6. `POSTGRES_DSN` is the only
    /// required variable; its absence is reported as a `ConfigError`
    /// rather than panicking, so the supervisor can log and exit cleanly
    /// (spec.md §7, the `StoreFatalError`-equivalent startup failure).
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            postgres_dsn: required_var("POSTGRES_DSN")?,
            master_list_poll_interval: Duration::from_secs(env_num(
                "MASTER_LIST_POLL_INTERVAL_S",
                60,
            )?),
            master_list_max_backoff: Duration::from_secs(env_num(
                "MASTER_LIST_MAX_BACKOFF_S",
                300,
            )?),
            poll_interval_active: Duration::from_secs(env_num("POLL_INTERVAL_ACTIVE_S", 20)?),
            poll_interval_empty: Duration::from_secs(env_num("POLL_INTERVAL_EMPTY_S", 180)?),
            poll_interval_offline: Duration::from_secs(env_num("POLL_INTERVAL_OFFLINE_S", 900)?),
            offline_failure_threshold: env_num("OFFLINE_FAILURE_THRESHOLD", 3)?,
            server_query_timeout: env_duration_secs_f64("SERVER_QUERY_TIMEOUT_S", 4.0)?,
            worker_count: env_num("WORKER_COUNT", 200)?,
        })
    }

    pub fn master_list_url(&self) -> &'static str {
        MASTER_LIST_URL
    }
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn env_duration_secs_f64(name: &'static str, default: f64) -> Result<Duration, ConfigError> {
    let secs: f64 = env_num(name, default)?;
    Ok(Duration::from_secs_f64(secs))
}

fn env_num<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
    }
}
