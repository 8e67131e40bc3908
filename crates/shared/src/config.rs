//! Environment-driven configuration
//!
//! Every value has a default except `DATABASE_URL`. Call `dotenvy::dotenv()`
//! in the binary before `Config::from_env()` to pick up a local `.env` file.

use std::str::FromStr;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// A downstream endpoint that events of one type are forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRoute {
    pub event_type: String,
    pub url: String,
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    /// Handler invocations allowed per event before it is dead-lettered
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_poll_interval: Duration,
    pub retry_batch_size: usize,
    pub retry_concurrency: usize,

    /// Claims older than this are considered abandoned by a crashed worker
    pub processing_timeout: Duration,
    /// Rows left in `received` longer than this are claimed by the reconciliation sweep
    pub received_grace: Duration,
    pub metrics_window: Duration,

    pub forward_routes: Vec<ForwardRoute>,
    pub forward_signing_secret: Option<String>,
    pub forward_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let max_attempts: u32 = env_or("EVENT_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "EVENT_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let retry_batch_size: usize = env_or("RETRY_BATCH_SIZE", 50)?;
        let retry_concurrency: usize = env_or("RETRY_CONCURRENCY", 8)?;

        let forward_routes = match std::env::var("FORWARD_ROUTES") {
            Ok(raw) => parse_forward_routes(&raw)?,
            Err(_) => Vec::new(),
        };

        let forward_signing_secret = std::env::var("FORWARD_SIGNING_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        Ok(Self {
            database_url,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5)?,
            run_migrations: env_or("RUN_MIGRATIONS", true)?,
            max_attempts,
            retry_base_delay: Duration::from_millis(env_or("RETRY_BASE_DELAY_MS", 1000)?),
            retry_max_delay: Duration::from_secs(env_or("RETRY_MAX_DELAY_SECS", 3600)?),
            retry_poll_interval: Duration::from_millis(env_or("RETRY_POLL_INTERVAL_MS", 1000)?),
            retry_batch_size: retry_batch_size.max(1),
            retry_concurrency: retry_concurrency.max(1),
            processing_timeout: Duration::from_secs(env_or("PROCESSING_TIMEOUT_SECS", 1800)?),
            received_grace: Duration::from_secs(env_or("RECEIVED_GRACE_SECS", 300)?),
            metrics_window: Duration::from_secs(env_or::<u64>("METRICS_WINDOW_HOURS", 24)? * 3600),
            forward_routes,
            forward_signing_secret,
            forward_timeout: Duration::from_secs(env_or("FORWARD_TIMEOUT_SECS", 10)?),
        })
    }
}

/// Read and parse an optional variable, falling back to `default` when unset or empty
fn env_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::Invalid {
                    key,
                    value: value.clone(),
                    reason: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

/// Parse `type=url,type=url` into forward routes
pub fn parse_forward_routes(raw: &str) -> Result<Vec<ForwardRoute>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (event_type, url) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
                key: "FORWARD_ROUTES",
                value: entry.to_string(),
                reason: "expected <event_type>=<url>".to_string(),
            })?;
            let (event_type, url) = (event_type.trim(), url.trim());
            if event_type.is_empty() || !(url.starts_with("http://") || url.starts_with("https://"))
            {
                return Err(ConfigError::Invalid {
                    key: "FORWARD_ROUTES",
                    value: entry.to_string(),
                    reason: "event type must be non-empty and url must be http(s)".to_string(),
                });
            }
            Ok(ForwardRoute {
                event_type: event_type.to_string(),
                url: url.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "EVENT_MAX_ATTEMPTS",
        "RETRY_BASE_DELAY_MS",
        "RETRY_BATCH_SIZE",
        "FORWARD_ROUTES",
        "FORWARD_SIGNING_SECRET",
        "RUN_MIGRATIONS",
        "RECEIVED_GRACE_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_applied() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/eventgate");

        let config = Config::from_env().unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.processing_timeout, Duration::from_secs(1800));
        assert_eq!(config.received_grace, Duration::from_secs(300));
        assert_eq!(config.metrics_window, Duration::from_secs(24 * 3600));
        assert!(config.run_migrations);
        assert!(config.forward_routes.is_empty());
        assert!(config.forward_signing_secret.is_none());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        clear_env();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    #[serial]
    fn test_zero_max_attempts_rejected() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/eventgate");
        std::env::set_var("EVENT_MAX_ATTEMPTS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "EVENT_MAX_ATTEMPTS",
                ..
            }
        ));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparseable_value_rejected() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/eventgate");
        std::env::set_var("RETRY_BASE_DELAY_MS", "soon");

        assert!(Config::from_env().is_err());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_overrides_and_routes() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/eventgate");
        std::env::set_var("EVENT_MAX_ATTEMPTS", "5");
        std::env::set_var("RETRY_BATCH_SIZE", "0");
        std::env::set_var(
            "FORWARD_ROUTES",
            "invoice.paid=https://billing.internal/hooks, charge.refunded=http://ledger:8080/in",
        );
        std::env::set_var("FORWARD_SIGNING_SECRET", "s3cret");
        std::env::set_var("RUN_MIGRATIONS", "false");
        std::env::set_var("RECEIVED_GRACE_SECS", "60");

        let config = Config::from_env().unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_batch_size, 1, "batch size is clamped to 1");
        assert_eq!(config.forward_routes.len(), 2);
        assert_eq!(config.forward_routes[1].event_type, "charge.refunded");
        assert_eq!(config.forward_routes[1].url, "http://ledger:8080/in");
        assert_eq!(config.forward_signing_secret.as_deref(), Some("s3cret"));
        assert!(!config.run_migrations);
        assert_eq!(config.received_grace, Duration::from_secs(60));

        clear_env();
    }

    #[test]
    fn test_malformed_route_rejected() {
        assert!(parse_forward_routes("invoice.paid").is_err());
        assert!(parse_forward_routes("=https://x").is_err());
        assert!(parse_forward_routes("invoice.paid=ftp://x").is_err());
        assert!(parse_forward_routes(" , ").unwrap().is_empty());
    }
}
