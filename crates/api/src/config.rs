//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{ResilienceConfig, SagaConfig, ServicesConfig};

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for text
/// - `DATABASE_URL`: PostgreSQL connection string; the in-memory store is
///   used when unset
/// - `SAGA_*`: engine tuning, see [`Config::from_lookup`]
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub saga: SagaConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Absent, unparsable or
    /// out-of-range values keep their defaults. State budgets shorter than
    /// one fully retried downstream call are raised to its duration.
    ///
    /// Engine overrides:
    /// - `SAGA_TIMEOUT_DEFAULT_MS`, `SAGA_TIMEOUT_VERIFICATION_MS`,
    ///   `SAGA_TIMEOUT_RESERVATION_MS`, `SAGA_TIMEOUT_PAYMENT_MS`,
    ///   `SAGA_TIMEOUT_ORDER_MS`, `SAGA_SWEEP_INTERVAL_MS`
    /// - `SAGA_LOCK_RETRY_MAX_ATTEMPTS`, `SAGA_LOCK_RETRY_BACKOFF_MS`
    /// - `SAGA_RETRY_MAX_ATTEMPTS`, `SAGA_RETRY_BACKOFF_MS`, `SAGA_CALL_TIMEOUT_MS`
    /// - `SAGA_BREAKER_FAILURE_RATE`, `SAGA_BREAKER_WINDOW`,
    ///   `SAGA_BREAKER_MIN_CALLS`, `SAGA_BREAKER_OPEN_MS`
    /// - `SAGA_MAX_CONCURRENT_PER_KEY`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str| parse(key).map(Duration::from_millis);
        let count_u32 =
            |key: &str| parse(key).and_then(|n| u32::try_from(n).ok()).filter(|n| *n > 0);
        let count_usize =
            |key: &str| parse(key).and_then(|n| usize::try_from(n).ok()).filter(|n| *n > 0);

        let defaults = Self::default();
        let mut saga = defaults.saga;

        let timeouts = &mut saga.timeouts;
        if let Some(d) = millis("SAGA_TIMEOUT_DEFAULT_MS") {
            timeouts.default = d;
        }
        if let Some(d) = millis("SAGA_TIMEOUT_VERIFICATION_MS") {
            timeouts.stock_verification = d;
        }
        if let Some(d) = millis("SAGA_TIMEOUT_RESERVATION_MS") {
            timeouts.stock_reservation = d;
        }
        if let Some(d) = millis("SAGA_TIMEOUT_PAYMENT_MS") {
            timeouts.payment_processing = d;
        }
        if let Some(d) = millis("SAGA_TIMEOUT_ORDER_MS") {
            timeouts.order_confirmation = d;
        }
        if let Some(d) = millis("SAGA_SWEEP_INTERVAL_MS").filter(|d| !d.is_zero()) {
            timeouts.sweep_interval = d;
        }

        if let Some(n) = count_u32("SAGA_LOCK_RETRY_MAX_ATTEMPTS") {
            saga.optimistic_retry.max_attempts = n;
        }
        if let Some(d) = millis("SAGA_LOCK_RETRY_BACKOFF_MS") {
            saga.optimistic_retry.base_backoff = d;
        }

        let mut resilience = ResilienceConfig::default();
        if let Some(n) = count_u32("SAGA_RETRY_MAX_ATTEMPTS") {
            resilience.retry.max_attempts = n;
        }
        if let Some(d) = millis("SAGA_RETRY_BACKOFF_MS") {
            resilience.retry.initial_backoff = d;
        }
        if let Some(d) = millis("SAGA_CALL_TIMEOUT_MS").filter(|d| !d.is_zero()) {
            resilience.call_timeout = d;
        }
        if let Some(rate) = lookup("SAGA_BREAKER_FAILURE_RATE")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|r| (0.0..=1.0).contains(r))
        {
            resilience.circuit_breaker.failure_rate_threshold = rate;
        }
        if let Some(n) = count_usize("SAGA_BREAKER_WINDOW") {
            resilience.circuit_breaker.sliding_window_size = n;
        }
        if let Some(n) = count_usize("SAGA_BREAKER_MIN_CALLS") {
            resilience.circuit_breaker.minimum_calls = n;
        }
        if let Some(d) = millis("SAGA_BREAKER_OPEN_MS") {
            resilience.circuit_breaker.open_duration = d;
        }
        saga.services = ServicesConfig::uniform(resilience);

        if let Some(n) = count_usize("SAGA_MAX_CONCURRENT_PER_KEY") {
            saga.concurrency.max_concurrent_per_key = n;
        }

        let floor = saga.services.worst_case_call();
        for budget in saga.enforce_step_budgets() {
            tracing::warn!(
                budget,
                floor_ms = floor.as_millis() as u64,
                "saga timeout budget raised to outlast one protected call"
            );
        }

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT") {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            saga,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            saga: SagaConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert_eq!(config.saga, SagaConfig::default());
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_empty_lookup_matches_defaults() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.addr(), "0.0.0.0:3000");
        assert_eq!(config.saga, SagaConfig::default());
    }

    #[test]
    fn test_saga_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "8081"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/sagas"),
            ("SAGA_TIMEOUT_PAYMENT_MS", "90000"),
            ("SAGA_SWEEP_INTERVAL_MS", "5000"),
            ("SAGA_RETRY_MAX_ATTEMPTS", "5"),
            ("SAGA_BREAKER_FAILURE_RATE", "0.25"),
            ("SAGA_MAX_CONCURRENT_PER_KEY", "1"),
        ]));

        assert_eq!(config.port, 8081);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/sagas")
        );
        assert_eq!(
            config.saga.timeouts.payment_processing,
            Duration::from_secs(90)
        );
        assert_eq!(config.saga.timeouts.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.saga.services.payment.retry.max_attempts, 5);
        assert_eq!(config.saga.services.inventory.retry.max_attempts, 5);
        assert_eq!(
            config.saga.services.order.circuit_breaker.failure_rate_threshold,
            0.25
        );
        assert_eq!(config.saga.concurrency.max_concurrent_per_key, 1);
    }

    #[test]
    fn test_unparsable_values_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "http"),
            ("SAGA_TIMEOUT_PAYMENT_MS", "soon"),
            ("SAGA_BREAKER_FAILURE_RATE", "2.5"),
            ("SAGA_MAX_CONCURRENT_PER_KEY", "0"),
            ("DATABASE_URL", " "),
        ]));

        assert_eq!(config.port, 3000);
        assert_eq!(
            config.saga.timeouts.payment_processing,
            Duration::from_secs(60)
        );
        assert_eq!(
            config.saga.services.payment.circuit_breaker.failure_rate_threshold,
            0.5
        );
        assert_eq!(config.saga.concurrency.max_concurrent_per_key, 3);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_out_of_range_counts_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("SAGA_RETRY_MAX_ATTEMPTS", "4294967297"),
            ("SAGA_LOCK_RETRY_MAX_ATTEMPTS", "4294967296"),
        ]));

        assert_eq!(config.saga.services.payment.retry.max_attempts, 3);
        assert_eq!(config.saga.optimistic_retry.max_attempts, 3);
    }

    #[test]
    fn test_short_budgets_are_raised() {
        let config = Config::from_lookup(lookup(&[
            ("SAGA_TIMEOUT_PAYMENT_MS", "0"),
            ("SAGA_TIMEOUT_RESERVATION_MS", "45000"),
            ("SAGA_CALL_TIMEOUT_MS", "10000"),
        ]));

        // 3 attempts of 10s plus two backoffs capped at 2s.
        assert_eq!(
            config.saga.timeouts.payment_processing,
            Duration::from_secs(34)
        );
        assert_eq!(
            config.saga.timeouts.stock_reservation,
            Duration::from_secs(45)
        );
        assert_eq!(
            config.saga.timeouts.stock_verification,
            Duration::from_secs(34)
        );
    }
}
