use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// User agent sent with the reachability probe.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_14_1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/71.0.3578.53 Safari/537.36";

/// Rules registered per combined insert-or-fetch statement.
pub const DEFAULT_RULE_CHUNK_SIZE: usize = 4000;

/// Allowed-request rows inserted per statement.
pub const DEFAULT_ALLOWED_CHUNK_SIZE: usize = 1000;

/// Measurer configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MeasurerConfig {
    pub database_url: Option<String>,
    pub probe_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Added on top of the job's dwell time.
    pub driver_timeout: Duration,
    pub storage_timeout: Duration,
    pub user_agent: String,
    pub rule_chunk_size: usize,
    pub allowed_chunk_size: usize,
    pub type_cache_capacity: usize,
    pub poll_interval: Duration,
}

impl Default for MeasurerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            probe_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(30),
            driver_timeout: Duration::from_secs(120),
            storage_timeout: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rule_chunk_size: DEFAULT_RULE_CHUNK_SIZE,
            allowed_chunk_size: DEFAULT_ALLOWED_CHUNK_SIZE,
            type_cache_capacity: 256,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl MeasurerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            probe_timeout: secs_var("MEASURER_PROBE_TIMEOUT_SECS", defaults.probe_timeout)?,
            fetch_timeout: secs_var("MEASURER_FETCH_TIMEOUT_SECS", defaults.fetch_timeout)?,
            driver_timeout: secs_var("MEASURER_DRIVER_TIMEOUT_SECS", defaults.driver_timeout)?,
            storage_timeout: secs_var("MEASURER_STORAGE_TIMEOUT_SECS", defaults.storage_timeout)?,
            user_agent: env::var("MEASURER_USER_AGENT").unwrap_or(defaults.user_agent),
            rule_chunk_size: parsed_var("MEASURER_RULE_CHUNK_SIZE", defaults.rule_chunk_size)?
                .max(1),
            allowed_chunk_size: parsed_var(
                "MEASURER_ALLOWED_CHUNK_SIZE",
                defaults.allowed_chunk_size,
            )?
            .max(1),
            type_cache_capacity: parsed_var(
                "MEASURER_TYPE_CACHE_CAPACITY",
                defaults.type_cache_capacity,
            )?,
            poll_interval: Duration::from_millis(parsed_var(
                "MEASURER_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
        })
    }
}

fn parsed_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn secs_var(key: &str, default: Duration) -> Result<Duration> {
    parsed_var(key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MeasurerConfig::default();
        assert_eq!(config.probe_timeout, Duration::from_secs(10));
        assert_eq!(config.rule_chunk_size, 4000);
        assert_eq!(config.allowed_chunk_size, 1000);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn unset_variable_falls_back_to_default() {
        let value: usize = parsed_var("MEASURER_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
