//! Environment-based configuration for the reconciliation daemon.

use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

/// Runtime settings, loaded from the environment with dev-safe defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Postgres connection string (`DATABASE_URL`).
    pub database_url: String,
    /// Base URL of the search index (`SEARCH_URL`).
    pub search_url: String,
    /// Index name the projection documents live in (`SEARCH_INDEX`).
    pub search_index: String,
    /// Maximum tasks claimed per run (`SYNC_BATCH_SIZE`).
    pub batch_size: usize,
    /// Failure count at which a task is quarantined (`SYNC_MAX_RETRIES`).
    pub max_retries: u32,
    /// Seconds between runs (`SYNC_POLL_INTERVAL_SECS`).
    pub poll_interval_secs: u64,
    /// Postgres pool size (`SYNC_POOL_SIZE`).
    pub pool_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/openshelf".to_string(),
            search_url: "http://localhost:9200".to_string(),
            search_index: "content_index".to_string(),
            batch_size: 100,
            max_retries: 7,
            poll_interval_secs: 3,
            pool_size: 5,
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults (with a
    /// warning for the connection strings, which are dev-only defaults).
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            warn!("DATABASE_URL not set; using local dev default");
            defaults.database_url.clone()
        });
        let search_url = std::env::var("SEARCH_URL").unwrap_or_else(|_| {
            warn!("SEARCH_URL not set; using local dev default");
            defaults.search_url.clone()
        });
        let search_index =
            std::env::var("SEARCH_INDEX").unwrap_or_else(|_| defaults.search_index.clone());

        Self {
            database_url,
            search_url,
            search_index,
            batch_size: parse_value(
                "SYNC_BATCH_SIZE",
                std::env::var("SYNC_BATCH_SIZE").ok(),
                defaults.batch_size,
            ),
            max_retries: parse_value(
                "SYNC_MAX_RETRIES",
                std::env::var("SYNC_MAX_RETRIES").ok(),
                defaults.max_retries,
            ),
            poll_interval_secs: clamp_poll_interval(parse_value(
                "SYNC_POLL_INTERVAL_SECS",
                std::env::var("SYNC_POLL_INTERVAL_SECS").ok(),
                defaults.poll_interval_secs,
            )),
            pool_size: parse_value(
                "SYNC_POOL_SIZE",
                std::env::var("SYNC_POOL_SIZE").ok(),
                defaults.pool_size,
            ),
        }
    }
}

/// Parse an optional raw value, keeping the default (with a warning) when the
/// value is absent or malformed.
fn parse_value<T: FromStr + Display + Copy>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(%name, value = %raw, %default, "invalid setting; using default");
            default
        }),
    }
}

/// A zero interval would make the run loop's timer panic at startup.
fn clamp_poll_interval(secs: u64) -> u64 {
    if secs == 0 {
        warn!("SYNC_POLL_INTERVAL_SECS of 0 is not supported; using 1");
        1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_knobs() {
        let settings = Settings::default();
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.max_retries, 7);
        assert_eq!(settings.poll_interval_secs, 3);
        assert_eq!(settings.pool_size, 5);
    }

    #[test]
    fn absent_values_fall_back_to_defaults() {
        assert_eq!(parse_value("SYNC_BATCH_SIZE", None, 100usize), 100);
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        assert_eq!(
            parse_value("SYNC_MAX_RETRIES", Some("seven".to_string()), 7u32),
            7
        );
        assert_eq!(
            parse_value("SYNC_BATCH_SIZE", Some("".to_string()), 100usize),
            100
        );
    }

    #[test]
    fn zero_poll_interval_is_clamped_to_one_second() {
        assert_eq!(clamp_poll_interval(0), 1);
        assert_eq!(clamp_poll_interval(3), 3);
    }

    #[test]
    fn valid_values_are_parsed() {
        assert_eq!(
            parse_value("SYNC_BATCH_SIZE", Some("25".to_string()), 100usize),
            25
        );
    }
}
