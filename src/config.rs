//! Configuration for cordon's background machinery.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: a config passed to [`install`] before first use, or
//!    to the explicit constructors (`DelayScheduler::new`, `ErrorQueue::new`, ...)
//! 2. **Environment variables**: values from `CORDON_*` env vars
//! 3. **Defaults**: built-in defaults from [`CordonConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `CORDON_DELAY_POLL_CEILING_MS` | `u64` | `delay.poll_ceiling` |
//! | `CORDON_DELAY_MAX_WORKERS` | `usize` | `delay.max_workers` |
//! | `CORDON_EXECUTOR_MIN_THREADS` | `usize` | `executor.min_threads` |
//! | `CORDON_EXECUTOR_MAX_THREADS` | `usize` | `executor.max_threads` |
//! | `CORDON_ERROR_QUEUE_CAPACITY` | `usize` | `error_queue.capacity` |
//! | `CORDON_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |

use std::sync::OnceLock;
use std::time::Duration;

use crate::cache::StateCacheConfig;
use crate::error::ErrorQueueConfig;
use crate::runtime::WorkerPoolConfig;

/// Environment variable name for the delay scheduler polling ceiling.
pub const ENV_DELAY_POLL_CEILING_MS: &str = "CORDON_DELAY_POLL_CEILING_MS";
/// Environment variable name for the delay scheduler worker limit.
pub const ENV_DELAY_MAX_WORKERS: &str = "CORDON_DELAY_MAX_WORKERS";
/// Environment variable name for executor minimum threads.
pub const ENV_EXECUTOR_MIN_THREADS: &str = "CORDON_EXECUTOR_MIN_THREADS";
/// Environment variable name for executor maximum threads.
pub const ENV_EXECUTOR_MAX_THREADS: &str = "CORDON_EXECUTOR_MAX_THREADS";
/// Environment variable name for the default error queue capacity.
pub const ENV_ERROR_QUEUE_CAPACITY: &str = "CORDON_ERROR_QUEUE_CAPACITY";
/// Environment variable name for the thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "CORDON_THREAD_NAME_PREFIX";

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while resolving configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value of the wrong type.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Expected type description.
        expected: &'static str,
        /// The raw value.
        value: String,
    },
    /// A numeric setting must be strictly positive.
    #[error("{field} must be greater than zero")]
    Zero {
        /// Field name.
        field: &'static str,
    },
    /// [`install`] was called after the global config was already resolved.
    #[error("global configuration already initialised")]
    AlreadyInstalled,
}

/// Precise delay scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayConfig {
    /// Longest the scheduler thread sleeps before re-checking the map.
    pub poll_ceiling: Duration,
    /// Minimum number of gate-firing worker threads kept alive.
    pub min_workers: usize,
    /// Maximum number of gate-firing worker threads.
    pub max_workers: usize,
    /// Idle time before an excess worker retires.
    pub idle_timeout: Duration,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            poll_ceiling: Duration::from_millis(100),
            min_workers: 0,
            max_workers: 64,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl DelayConfig {
    /// Sets the polling ceiling.
    #[must_use]
    pub fn with_poll_ceiling(mut self, ceiling: Duration) -> Self {
        self.poll_ceiling = ceiling;
        self
    }

    /// Sets the worker thread bounds.
    #[must_use]
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Clamps inconsistent values.
    pub fn normalize(&mut self) {
        if self.poll_ceiling.is_zero() {
            self.poll_ceiling = Duration::from_millis(1);
        }
        self.max_workers = self.max_workers.max(1);
        if self.min_workers > self.max_workers {
            self.min_workers = self.max_workers;
        }
    }

    /// Returns the worker pool settings for the gate-firing pool.
    #[must_use]
    pub fn pool_config(&self, thread_name_prefix: &str) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_threads: self.min_workers,
            max_threads: self.max_workers,
            idle_timeout: self.idle_timeout,
            thread_name: format!("{thread_name_prefix}-delay"),
        }
    }
}

/// Task executor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Minimum number of executor threads kept alive.
    pub min_threads: usize,
    /// Maximum number of executor threads.
    pub max_threads: usize,
    /// Idle time before an excess thread retires.
    pub idle_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        Self {
            min_threads: 1,
            max_threads: parallelism * 4,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl ExecutorConfig {
    /// Clamps inconsistent values.
    pub fn normalize(&mut self) {
        self.max_threads = self.max_threads.max(1);
        if self.min_threads > self.max_threads {
            self.min_threads = self.max_threads;
        }
    }

    /// Returns the worker pool settings for the executor.
    #[must_use]
    pub fn pool_config(&self, thread_name_prefix: &str) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_threads: self.min_threads,
            max_threads: self.max_threads,
            idle_timeout: self.idle_timeout,
            thread_name: format!("{thread_name_prefix}-worker"),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CordonConfig {
    /// Prefix for every thread cordon spawns.
    pub thread_name_prefix: String,
    /// Delay scheduler settings.
    pub delay: DelayConfig,
    /// Executor settings.
    pub executor: ExecutorConfig,
    /// Default state cache settings.
    pub state_cache: StateCacheConfig,
    /// Default error queue settings.
    pub error_queue: ErrorQueueConfig,
}

impl Default for CordonConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "cordon".to_string(),
            delay: DelayConfig::default(),
            executor: ExecutorConfig::default(),
            state_cache: StateCacheConfig::default(),
            error_queue: ErrorQueueConfig::default(),
        }
    }
}

impl CordonConfig {
    /// Returns defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        config.normalize();
        Ok(config)
    }

    /// Sets the delay scheduler settings.
    #[must_use]
    pub fn with_delay(mut self, delay: DelayConfig) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the executor settings.
    #[must_use]
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the default state cache settings.
    #[must_use]
    pub fn with_state_cache(mut self, state_cache: StateCacheConfig) -> Self {
        self.state_cache = state_cache;
        self
    }

    /// Sets the default error queue settings.
    #[must_use]
    pub fn with_error_queue(mut self, error_queue: ErrorQueueConfig) -> Self {
        self.error_queue = error_queue;
        self
    }

    /// Sets the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Clamps inconsistent values in every section.
    pub fn normalize(&mut self) {
        self.delay.normalize();
        self.executor.normalize();
        self.state_cache.normalize();
        self.error_queue.normalize();
    }

    /// Checks that no setting is degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.error_queue.capacity == 0 {
            return Err(ConfigError::Zero {
                field: "error_queue.capacity",
            });
        }
        if self.executor.max_threads == 0 {
            return Err(ConfigError::Zero {
                field: "executor.max_threads",
            });
        }
        Ok(())
    }
}

static GLOBAL: OnceLock<CordonConfig> = OnceLock::new();

/// Returns the process-wide configuration, resolving it from the
/// environment on first use.
///
/// An unparseable environment variable is logged and defaults are used.
pub fn global() -> &'static CordonConfig {
    GLOBAL.get_or_init(|| match CordonConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "ignoring invalid cordon environment configuration");
            let mut config = CordonConfig::default();
            config.normalize();
            config
        }
    })
}

/// Installs a programmatic configuration for the process-wide singletons.
///
/// Must run before anything touches the executor, the delay scheduler or
/// [`global`].
pub fn install(mut config: CordonConfig) -> Result<(), ConfigError> {
    config.normalize();
    config.validate()?;
    GLOBAL.set(config).map_err(|_| ConfigError::AlreadyInstalled)
}

/// Apply environment variable overrides to a [`CordonConfig`].
///
/// Only variables that are set in the environment are applied.
pub fn apply_env_overrides(config: &mut CordonConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_DELAY_POLL_CEILING_MS) {
        config.delay.poll_ceiling =
            Duration::from_millis(parse_u64(ENV_DELAY_POLL_CEILING_MS, &val)?);
    }
    if let Some(val) = read_env(ENV_DELAY_MAX_WORKERS) {
        config.delay.max_workers = parse_usize(ENV_DELAY_MAX_WORKERS, &val)?;
    }
    if let Some(val) = read_env(ENV_EXECUTOR_MIN_THREADS) {
        config.executor.min_threads = parse_usize(ENV_EXECUTOR_MIN_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_EXECUTOR_MAX_THREADS) {
        config.executor.max_threads = parse_usize(ENV_EXECUTOR_MAX_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_ERROR_QUEUE_CAPACITY) {
        config.error_queue.capacity = parse_usize(ENV_ERROR_QUEUE_CAPACITY, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            expected: "u64",
            value: val.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{env_lock, init_test};

    fn clear_env() {
        for var in [
            ENV_DELAY_POLL_CEILING_MS,
            ENV_DELAY_MAX_WORKERS,
            ENV_EXECUTOR_MIN_THREADS,
            ENV_EXECUTOR_MAX_THREADS,
            ENV_ERROR_QUEUE_CAPACITY,
            ENV_THREAD_NAME_PREFIX,
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        init_test("defaults_match_documented_values");
        let config = CordonConfig::default();
        assert_eq!(config.delay.poll_ceiling, Duration::from_millis(100));
        assert_eq!(config.delay.max_workers, 64);
        assert_eq!(config.executor.min_threads, 1);
        assert_eq!(config.error_queue.capacity, 1000);
        assert!(config.error_queue.dedup);
        assert_eq!(config.thread_name_prefix, "cordon");
        crate::test_complete!("defaults_match_documented_values");
    }

    #[test]
    fn env_overrides_apply() {
        init_test("env_overrides_apply");
        let _guard = env_lock();
        clear_env();
        std::env::set_var(ENV_DELAY_POLL_CEILING_MS, "25");
        std::env::set_var(ENV_EXECUTOR_MAX_THREADS, " 3 ");
        std::env::set_var(ENV_THREAD_NAME_PREFIX, "svc");

        let config = CordonConfig::from_env().expect("valid env");
        clear_env();

        crate::assert_with_log!(
            config.delay.poll_ceiling == Duration::from_millis(25),
            "ceiling overridden",
            Duration::from_millis(25),
            config.delay.poll_ceiling
        );
        assert_eq!(config.executor.max_threads, 3);
        assert_eq!(config.thread_name_prefix, "svc");
        crate::test_complete!("env_overrides_apply");
    }

    #[test]
    fn invalid_env_value_is_reported() {
        init_test("invalid_env_value_is_reported");
        let _guard = env_lock();
        clear_env();
        std::env::set_var(ENV_DELAY_MAX_WORKERS, "lots");

        let err = CordonConfig::from_env().expect_err("should reject");
        clear_env();

        assert_eq!(
            err,
            ConfigError::InvalidValue {
                var: ENV_DELAY_MAX_WORKERS,
                expected: "unsigned integer",
                value: "lots".to_string(),
            }
        );
        let as_error: crate::Error = err.into();
        assert_eq!(as_error.kind(), crate::ErrorKind::Config);
        crate::test_complete!("invalid_env_value_is_reported");
    }

    #[test]
    fn normalize_clamps_worker_bounds() {
        init_test("normalize_clamps_worker_bounds");
        let mut delay = DelayConfig::default()
            .with_workers(10, 0)
            .with_poll_ceiling(Duration::ZERO);
        delay.normalize();
        assert_eq!(delay.max_workers, 1);
        assert_eq!(delay.min_workers, 1);
        assert_eq!(delay.poll_ceiling, Duration::from_millis(1));

        let mut config = CordonConfig::default();
        config.error_queue.capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "error_queue.capacity"
            })
        );
        crate::test_complete!("normalize_clamps_worker_bounds");
    }
}
