//! CoCon client configuration.
//!
//! Configuration is built through [`ConfigBuilder`] or loaded from
//! environment variables; both paths validate before returning a [`Config`].

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default server port of the CoCon REST interface.
pub const DEFAULT_PORT: u16 = 8890;

/// Default URL prefix of the CoCon REST interface.
pub const DEFAULT_BASE_PATH: &str = "CoCon";

/// Default long-poll timeout.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default per-request timeout for connect, command and disconnect calls.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(7);

/// Default idle validity window of a session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(120);

/// Default period of the session expiry check.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default first retry delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Default retry delay ceiling.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Default consecutive poll failures tolerated before reconnecting.
pub const DEFAULT_POLL_FAILURE_CEILING: u32 = 5;

/// Default per-invocation handler timeout.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum number of pending commands.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default bound on the best-effort server-side release during close.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// CoCon client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Server host name or IP address.
    pub host: String,

    /// Server port (default: 8890).
    pub port: u16,

    /// URL prefix under which the endpoints live (default: "CoCon").
    pub base_path: String,

    /// Long-poll timeout; a poll outlasting it means no event was ready.
    pub poll_interval: Duration,

    /// Per-request timeout for connect, command and disconnect calls.
    pub session_timeout: Duration,

    /// Idle validity window, renewed on every successful exchange.
    pub session_ttl: Duration,

    /// Period of the session expiry check.
    pub keepalive_interval: Duration,

    /// Retries after the first attempt, for commands and connects.
    pub max_retries: u32,

    /// First retry delay.
    pub backoff_base: Duration,

    /// Upper bound on any retry delay.
    pub backoff_cap: Duration,

    /// Add up to one second of random jitter to each retry delay.
    pub backoff_jitter: bool,

    /// Consecutive poll transport failures before forcing a reconnect.
    pub poll_failure_ceiling: u32,

    /// Per-invocation handler timeout; `None` waits indefinitely.
    pub handler_timeout: Option<Duration>,

    /// Maximum number of pending commands.
    pub queue_capacity: usize,

    /// Value of the `details` flag sent with Subscribe.
    pub subscription_details: bool,

    /// Bound on the best-effort server-side release during close.
    pub disconnect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            base_path: DEFAULT_BASE_PATH.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            session_ttl: DEFAULT_SESSION_TTL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            backoff_jitter: false,
            poll_failure_ceiling: DEFAULT_POLL_FAILURE_CEILING,
            handler_timeout: Some(DEFAULT_HANDLER_TIMEOUT),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            subscription_details: true,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Start building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Base URL of the REST interface, e.g. `http://10.0.0.5:8890/CoCon`.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.host,
            self.port,
            self.base_path.trim_matches('/')
        )
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("host must not be empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "poll_interval must be greater than zero".into(),
            ));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "session_timeout must be greater than zero".into(),
            ));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "keepalive_interval must be greater than zero".into(),
            ));
        }
        if self.session_ttl <= self.poll_interval {
            return Err(ConfigError::InvalidValue(format!(
                "session_ttl ({:?}) must exceed poll_interval ({:?})",
                self.session_ttl, self.poll_interval
            )));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(ConfigError::InvalidValue(format!(
                "backoff_cap ({:?}) must not be below backoff_base ({:?})",
                self.backoff_cap, self.backoff_base
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable or inconsistent values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable or inconsistent values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(host) = vars.get("COCON_HOST") {
            builder = builder.host(host.clone());
        }
        if let Some(port) = parse_var::<u16>(vars, "COCON_PORT")? {
            builder = builder.port(port);
        }
        if let Some(base_path) = vars.get("COCON_BASE_PATH") {
            builder = builder.base_path(base_path.clone());
        }
        if let Some(secs) = parse_var::<u64>(vars, "COCON_POLL_INTERVAL_SECS")? {
            builder = builder.poll_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(vars, "COCON_SESSION_TIMEOUT_SECS")? {
            builder = builder.session_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(vars, "COCON_SESSION_TTL_SECS")? {
            builder = builder.session_ttl(Duration::from_secs(secs));
        }
        if let Some(retries) = parse_var::<u32>(vars, "COCON_MAX_RETRIES")? {
            builder = builder.max_retries(retries);
        }
        if let Some(ms) = parse_var::<u64>(vars, "COCON_BACKOFF_BASE_MS")? {
            builder = builder.backoff_base(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64>(vars, "COCON_BACKOFF_CAP_MS")? {
            builder = builder.backoff_cap(Duration::from_millis(ms));
        }
        if let Some(jitter) = parse_var::<bool>(vars, "COCON_BACKOFF_JITTER")? {
            builder = builder.backoff_jitter(jitter);
        }
        if let Some(ceiling) = parse_var::<u32>(vars, "COCON_POLL_FAILURE_CEILING")? {
            builder = builder.poll_failure_ceiling(ceiling);
        }
        if let Some(ms) = parse_var::<u64>(vars, "COCON_HANDLER_TIMEOUT_MS")? {
            // 0 disables the per-invocation timeout
            let timeout = (ms > 0).then(|| Duration::from_millis(ms));
            builder = builder.handler_timeout(timeout);
        }
        if let Some(capacity) = parse_var::<usize>(vars, "COCON_QUEUE_CAPACITY")? {
            builder = builder.queue_capacity(capacity);
        }
        if let Some(details) = parse_var::<bool>(vars, "COCON_SUBSCRIPTION_DETAILS")? {
            builder = builder.subscription_details(details);
        }

        builder.build()
    }
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw:?} is not valid"))),
    }
}

/// Builder for [`Config`]; `build` validates the result.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use]
    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.config.base_path = base_path.into();
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn session_timeout(mut self, session_timeout: Duration) -> Self {
        self.config.session_timeout = session_timeout;
        self
    }

    #[must_use]
    pub fn session_ttl(mut self, session_ttl: Duration) -> Self {
        self.config.session_ttl = session_ttl;
        self
    }

    #[must_use]
    pub fn keepalive_interval(mut self, keepalive_interval: Duration) -> Self {
        self.config.keepalive_interval = keepalive_interval;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn backoff_base(mut self, backoff_base: Duration) -> Self {
        self.config.backoff_base = backoff_base;
        self
    }

    #[must_use]
    pub fn backoff_cap(mut self, backoff_cap: Duration) -> Self {
        self.config.backoff_cap = backoff_cap;
        self
    }

    #[must_use]
    pub fn backoff_jitter(mut self, jitter: bool) -> Self {
        self.config.backoff_jitter = jitter;
        self
    }

    #[must_use]
    pub fn poll_failure_ceiling(mut self, ceiling: u32) -> Self {
        self.config.poll_failure_ceiling = ceiling;
        self
    }

    #[must_use]
    pub fn handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.handler_timeout = timeout;
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn subscription_details(mut self, details: bool) -> Self {
        self.config.subscription_details = details;
        self
    }

    #[must_use]
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.config.disconnect_timeout = timeout;
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any constraint is violated.
    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.backoff_base, Duration::from_millis(500));
        assert_eq!(config.session_timeout, Duration::from_secs(7));
        assert_eq!(config.handler_timeout, Some(DEFAULT_HANDLER_TIMEOUT));
    }

    #[test]
    fn test_base_url() {
        let config = Config::builder()
            .host("10.0.0.5")
            .base_path("/CoCon/")
            .build()
            .unwrap();
        assert_eq!(config.base_url(), "http://10.0.0.5:8890/CoCon");
    }

    #[test]
    fn test_builder_rejects_cap_below_base() {
        let result = Config::builder()
            .backoff_base(Duration::from_secs(5))
            .backoff_cap(Duration::from_secs(1))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("backoff_cap")));
    }

    #[test]
    fn test_builder_rejects_zero_poll_interval() {
        let result = Config::builder().poll_interval(Duration::ZERO).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_ttl_not_exceeding_poll_interval() {
        let result = Config::builder()
            .poll_interval(Duration::from_secs(30))
            .session_ttl(Duration::from_secs(30))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("session_ttl")));
    }

    #[test]
    fn test_builder_rejects_empty_host_and_zero_capacity() {
        assert!(Config::builder().host("  ").build().is_err());
        assert!(Config::builder().queue_capacity(0).build().is_err());
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_vars_custom_values() {
        let vars = HashMap::from([
            ("COCON_HOST".to_string(), "cocon.local".to_string()),
            ("COCON_PORT".to_string(), "9000".to_string()),
            ("COCON_POLL_INTERVAL_SECS".to_string(), "20".to_string()),
            ("COCON_SESSION_TTL_SECS".to_string(), "60".to_string()),
            ("COCON_MAX_RETRIES".to_string(), "3".to_string()),
            ("COCON_BACKOFF_BASE_MS".to_string(), "1000".to_string()),
            ("COCON_BACKOFF_CAP_MS".to_string(), "10000".to_string()),
            ("COCON_BACKOFF_JITTER".to_string(), "true".to_string()),
            ("COCON_HANDLER_TIMEOUT_MS".to_string(), "0".to_string()),
            ("COCON_SUBSCRIPTION_DETAILS".to_string(), "false".to_string()),
        ]);

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.host, "cocon.local");
        assert_eq!(config.port, 9000);
        assert_eq!(config.poll_interval, Duration::from_secs(20));
        assert_eq!(config.session_ttl, Duration::from_secs(60));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_cap, Duration::from_secs(10));
        assert!(config.backoff_jitter);
        assert_eq!(config.handler_timeout, None);
        assert!(!config.subscription_details);
    }

    #[test]
    fn test_from_vars_rejects_garbage() {
        let vars = HashMap::from([("COCON_MAX_RETRIES".to_string(), "many".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("COCON_MAX_RETRIES"))
        );
    }
}
