//! Broker connection and pool configuration.

use std::fmt;
use std::time::Duration;

use rand::Rng;

use crate::error::PoolError;

/// Default broker host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default AMQP port.
pub const DEFAULT_PORT: u16 = 5672;

/// Default broker user.
pub const DEFAULT_USER: &str = "admin";

/// Default broker password.
pub const DEFAULT_PASSWORD: &str = "admin";

/// Environment variable names read by [`ConnectionConfig::from_env`].
pub mod env {
    /// Broker hostname.
    pub const HOST: &str = "RABBITMQ_HOST";
    /// Broker port.
    pub const PORT: &str = "RABBITMQ_PORT";
    /// Broker user.
    pub const USER: &str = "RABBITMQ_USER";
    /// Broker password.
    pub const PASSWORD: &str = "RABBITMQ_PASSWORD";
    /// Broker virtual host.
    pub const VHOST: &str = "RABBITMQ_VHOST";
}

/// Username/password pair used to authenticate against the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Broker user.
    pub username: String,
    /// Broker password.
    pub password: String,
}

impl Credentials {
    /// Create a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new(DEFAULT_USER, DEFAULT_PASSWORD)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parameters for establishing a single broker connection.
///
/// Built once and handed to the pool; the pool never mutates it. This struct
/// is marked `#[non_exhaustive]`; use [`ConnectionConfig::new()`],
/// [`ConnectionConfig::from_env()`] and the builder methods to construct it.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// Broker hostname or IP address.
    pub host: String,

    /// Broker port (default: 5672).
    pub port: u16,

    /// Authentication credentials.
    pub credentials: Credentials,

    /// AMQP virtual host (default: `/`).
    pub virtual_host: String,

    /// Heartbeat interval negotiated with the broker (default: 600s).
    pub heartbeat: Duration,

    /// Timeout for a single connection attempt (default: 30s).
    pub connection_timeout: Duration,

    /// Transport-level attempts per connect call (default: 1).
    pub connection_attempts: u32,

    /// Delay between transport-level attempts (default: 5s).
    pub retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            credentials: Credentials::default(),
            virtual_host: "/".to_string(),
            heartbeat: Duration::from_secs(600),
            connection_timeout: Duration::from_secs(30),
            connection_attempts: 1,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the process environment.
    ///
    /// Reads `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USER`,
    /// `RABBITMQ_PASSWORD` and `RABBITMQ_VHOST`; unset variables keep their
    /// defaults.
    pub fn from_env() -> Result<Self, PoolError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, PoolError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup(env::HOST) {
            config.host = host;
        }
        if let Some(port) = lookup(env::PORT) {
            config.port = port.trim().parse().map_err(|_| {
                PoolError::Configuration(format!("invalid {}: {port}", env::PORT))
            })?;
        }
        if let Some(user) = lookup(env::USER) {
            config.credentials.username = user;
        }
        if let Some(password) = lookup(env::PASSWORD) {
            config.credentials.password = password;
        }
        if let Some(vhost) = lookup(env::VHOST) {
            config.virtual_host = vhost;
        }

        Ok(config)
    }

    /// Set the broker host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the broker port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Credentials::new(username, password);
        self
    }

    /// Set the virtual host.
    #[must_use]
    pub fn virtual_host(mut self, vhost: impl Into<String>) -> Self {
        self.virtual_host = vhost.into();
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    /// Set the per-attempt connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the number of transport-level attempts per connect call.
    #[must_use]
    pub fn connection_attempts(mut self, attempts: u32) -> Self {
        self.connection_attempts = attempts;
        self
    }

    /// Set the delay between transport-level attempts.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// `host:port`, for log fields.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.host.trim().is_empty() {
            return Err(PoolError::Configuration("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(PoolError::Configuration("port must be greater than 0".into()));
        }
        if self.credentials.username.is_empty() {
            return Err(PoolError::Configuration("username must not be empty".into()));
        }
        if self.connection_attempts == 0 {
            return Err(PoolError::Configuration(
                "connection_attempts must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Retry policy for the startup fill.
///
/// Delays grow exponentially from `initial_backoff`, are capped at
/// `max_backoff`, and are optionally spread by jitter. `max_retries` bounds
/// the total number of fill attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of fill attempts (default: 30).
    pub max_retries: u32,
    /// Delay before the second attempt (default: 5s).
    pub initial_backoff: Duration,
    /// Maximum delay between attempts (default: 60s).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff times (default: true).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 30,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A constant delay between attempts, without jitter.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_backoff: delay,
            max_backoff: delay,
            backoff_multiplier: 1.0,
            jitter: false,
            ..Self::default()
        }
    }

    /// Set the maximum number of fill attempts.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the initial backoff duration.
    #[must_use]
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the maximum backoff duration.
    #[must_use]
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the backoff multiplier for exponential backoff.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Calculate the delay to wait after the given (1-based) failed attempt.
    ///
    /// Jitter multiplies the capped delay by a factor in `[0.5, 1.5)`; the
    /// result never exceeds `max_backoff`.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max = self.max_backoff.as_secs_f64();
        let capped = if base.is_finite() { base.min(max) } else { max };

        let delay = if self.jitter {
            (capped * rand::rng().random_range(0.5..1.5)).min(max)
        } else {
            capped
        };

        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Configuration for the connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Number of connections opened at startup.
    pub pool_size: u32,

    /// Retry policy for the startup fill.
    pub retry: RetryPolicy,

    /// Interval for the background health monitor, if any.
    pub health_check_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            retry: RetryPolicy::default(),
            health_check_interval: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of pre-warmed connections.
    #[must_use]
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the bound on startup fill attempts.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.retry.max_retries = max;
        self
    }

    /// Use a fixed delay between startup fill attempts.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry = RetryPolicy::fixed(delay).max_retries(self.retry.max_retries);
        self
    }

    /// Replace the whole retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Run a background health check on the given interval.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.pool_size == 0 {
            return Err(PoolError::Configuration(
                "pool_size must be greater than 0".into(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(PoolError::Configuration(
                "max_retries must be greater than 0".into(),
            ));
        }
        if self.health_check_interval == Some(Duration::ZERO) {
            return Err(PoolError::Configuration(
                "health_check_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
