//! Configuration for the client pool, retry loops and call-site timeouts.

use crate::client::Credentials;
use crate::error::{SyncError, SyncResult};
use rand::Rng;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Budget for name-based lookups and searches.
pub const NAME_LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);
/// Budget for standard delete confirmation.
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for delete confirmation on backends that propagate deletions slowly.
pub const SLOW_DELETE_TIMEOUT: Duration = Duration::from_secs(180);
/// Budget for authorizing every client while pre-filling the pool.
pub const POOL_INIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for plain reads.
pub const READ_TIMEOUT: Duration = Duration::from_secs(300);
/// Budget for confirming a create became visible.
pub const CREATE_VERIFY_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for a versioned update including its read-back.
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default pool capacity.
pub const DEFAULT_POOL_CAPACITY: usize = 10;
/// Smallest allowed pool.
pub const MIN_POOL_CAPACITY: usize = 1;
/// Largest allowed pool.
pub const MAX_POOL_CAPACITY: usize = 50;

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_secs))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Configuration for retry behavior.
///
/// The nominal delay curve is capped exponential: `initial_delay *
/// multiplier^(n-1)` until it reaches `max_delay`. Jitter adds up to 25% on
/// top of the nominal delay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempt budget for attempt-bounded retries.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(rename = "initial_delay_ms", deserialize_with = "millis::deserialize")]
    pub initial_delay: Duration,
    /// Plateau of the delay curve.
    #[serde(rename = "max_delay_ms", deserialize_with = "millis::deserialize")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before retrying after `attempt` failed attempts, without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !base_delay.is_finite() || base_delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(base_delay.max(0.0)).min(self.max_delay)
    }

    /// Delay before retrying after `attempt` failed attempts, with jitter.
    ///
    /// Attempts are counted from 1; attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.add_jitter && !nominal.is_zero() {
            let jitter = rand::thread_rng().gen_range(0.0..=0.25);
            nominal.mul_f64(1.0 + jitter)
        } else {
            nominal
        }
    }

    /// Checks the curve is capped exponential.
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier > 1.0) {
            return Err(SyncError::InvalidConfig(format!(
                "backoff_multiplier must be greater than 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay.is_zero() || self.initial_delay > self.max_delay {
            return Err(SyncError::InvalidConfig(format!(
                "initial_delay ({:?}) must be non-zero and at most max_delay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Configuration for the client pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of client handles, fixed for the pool's lifetime.
    pub capacity: usize,
    /// Budget for authorizing every handle during prefill.
    #[serde(rename = "init_timeout_secs", deserialize_with = "secs::deserialize")]
    pub init_timeout: Duration,
    /// How long `acquire` waits before failing. `None` waits forever.
    #[serde(rename = "acquire_timeout_secs", deserialize_with = "opt_secs::deserialize")]
    pub acquire_timeout: Option<Duration>,
    /// Emit per-acquire/release debug logs.
    pub debug_logging: bool,
}

impl PoolConfig {
    /// Creates a pool configuration with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            init_timeout: POOL_INIT_TIMEOUT,
            acquire_timeout: None,
            debug_logging: false,
        }
    }

    /// Sets the prefill authorization timeout.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Sets the acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Enables debug logging.
    pub fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    /// Checks the capacity bounds.
    pub fn validate(&self) -> SyncResult<()> {
        if !(MIN_POOL_CAPACITY..=MAX_POOL_CAPACITY).contains(&self.capacity) {
            return Err(SyncError::InvalidConfig(format!(
                "pool capacity must be between {} and {}, got {}",
                MIN_POOL_CAPACITY, MAX_POOL_CAPACITY, self.capacity
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

/// Per-call-site retry budgets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Name-based lookup or search.
    #[serde(rename = "name_lookup_secs", deserialize_with = "secs::deserialize")]
    pub name_lookup: Duration,
    /// Standard delete confirmation.
    #[serde(rename = "delete_secs", deserialize_with = "secs::deserialize")]
    pub delete: Duration,
    /// Delete confirmation for slow-propagating backends.
    #[serde(rename = "slow_delete_secs", deserialize_with = "secs::deserialize")]
    pub slow_delete: Duration,
    /// Plain reads.
    #[serde(rename = "read_secs", deserialize_with = "secs::deserialize")]
    pub read: Duration,
    /// Post-create visibility check.
    #[serde(rename = "create_verify_secs", deserialize_with = "secs::deserialize")]
    pub create_verify: Duration,
    /// Versioned update plus read-back.
    #[serde(rename = "update_secs", deserialize_with = "secs::deserialize")]
    pub update: Duration,
}

impl Timeouts {
    /// Returns the table as `(name, duration)` rows.
    pub fn rows(&self) -> Vec<(&'static str, Duration)> {
        vec![
            ("name_lookup", self.name_lookup),
            ("delete", self.delete),
            ("slow_delete", self.slow_delete),
            ("read", self.read),
            ("create_verify", self.create_verify),
            ("update", self.update),
        ]
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            name_lookup: NAME_LOOKUP_TIMEOUT,
            delete: DELETE_TIMEOUT,
            slow_delete: SLOW_DELETE_TIMEOUT,
            read: READ_TIMEOUT,
            create_verify: CREATE_VERIFY_TIMEOUT,
            update: UPDATE_TIMEOUT,
        }
    }
}

/// Top-level configuration for a reconciliation session.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Backend base URL.
    pub base_url: String,
    /// Client credentials used by every pool handle.
    pub credentials: Credentials,
    /// Pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Call-site budgets.
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Per-request transport timeout.
    #[serde(
        default = "default_request_timeout",
        rename = "request_timeout_secs",
        deserialize_with = "secs::deserialize"
    )]
    pub request_timeout: Duration,
    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("resync/{}", env!("CARGO_PKG_VERSION"))
}

impl ProviderConfig {
    /// Creates a configuration with default pool, retry and timeout settings.
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            timeouts: Timeouts::default(),
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }

    /// Sets the pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the timeout table.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Parses a JSON configuration document.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Validates every section.
    pub fn validate(&self) -> SyncResult<()> {
        if self.base_url.is_empty() {
            return Err(SyncError::InvalidConfig("base_url is required".into()));
        }
        if self.credentials.client_id.is_empty() {
            return Err(SyncError::InvalidConfig("credentials.client_id is required".into()));
        }
        self.pool.validate()?;
        self.retry.validate()
    }
}
