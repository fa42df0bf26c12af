//! Per-dependency settings
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial document
//! only overrides the keys it names.

use crate::errors::ConfigError;
use serde::Deserialize;

/// Where user code runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStrategy {
    /// On the caller's thread, bounded by a counting semaphore
    #[default]
    Semaphore,
    /// On the dependency's worker pool, bounded by its queue
    ThreadPool,
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// When false the breaker never opens and never records transitions
    pub enabled: bool,

    /// Minimum requests in the rolling window before the error rate is judged
    pub volume_threshold: u64,

    /// Error percentage (0-100) at or above which the circuit opens
    pub error_threshold_percentage: u32,

    /// Time the circuit stays open before a single probe is admitted
    pub sleep_window_ms: u64,

    /// Jitter factor for the sleep window (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: window * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,

    /// Reject every request regardless of health
    pub force_open: bool,

    /// Admit every request regardless of health; health is still recorded
    pub force_closed: bool,

    /// Discard rolling health when a probe closes the circuit
    pub reset_health_on_close: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume_threshold: 20,
            error_threshold_percentage: 50,
            sleep_window_ms: 5000,
            jitter_factor: 0.0,
            force_open: false,
            force_closed: false,
            reset_health_on_close: true,
        }
    }
}

/// Worker pool settings for [`IsolationStrategy::ThreadPool`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    pub core_size: usize,
    /// Queue capacity; 0 hands tasks straight to an idle worker
    pub max_queue_size: usize,
    /// Queue length at which new work is rejected, even below capacity
    pub queue_rejection_threshold: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            core_size: 10,
            max_queue_size: 0,
            queue_rejection_threshold: 5,
        }
    }
}

/// Metric window settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Length of the rolling window
    pub rolling_window_ms: u64,
    /// Buckets the window is divided into
    pub num_buckets: usize,
    /// Per-subscriber queue length on the event bus
    pub bus_capacity: usize,
}

impl MetricsConfig {
    pub fn bucket_duration_ms(&self) -> u64 {
        self.rolling_window_ms / self.num_buckets.max(1) as u64
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            rolling_window_ms: 1000,
            num_buckets: 10,
            bus_capacity: crate::bus::DEFAULT_BUS_CAPACITY,
        }
    }
}

/// Settings for one dependency
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub isolation: IsolationStrategy,

    /// Semaphore permits for user code
    pub max_concurrent: usize,

    /// Semaphore permits for fallbacks
    pub fallback_max_concurrent: usize,

    pub execution_timeout_ms: u64,
    pub timeout_enabled: bool,
    pub fallback_enabled: bool,

    pub circuit_breaker: CircuitBreakerConfig,
    pub thread_pool: ThreadPoolConfig,
    pub metrics: MetricsConfig,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationStrategy::Semaphore,
            max_concurrent: 10,
            fallback_max_concurrent: 10,
            execution_timeout_ms: 1000,
            timeout_enabled: true,
            fallback_enabled: true,
            circuit_breaker: CircuitBreakerConfig::default(),
            thread_pool: ThreadPoolConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl CommandConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent", "must be greater than 0"));
        }
        if self.fallback_max_concurrent == 0 {
            return Err(ConfigError::invalid(
                "fallback_max_concurrent",
                "must be greater than 0",
            ));
        }
        if self.timeout_enabled && self.execution_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "execution_timeout_ms",
                "must be greater than 0 when timeouts are enabled",
            ));
        }

        let breaker = &self.circuit_breaker;
        if breaker.error_threshold_percentage > 100 {
            return Err(ConfigError::invalid(
                "circuit_breaker.error_threshold_percentage",
                format!("{} is not a percentage", breaker.error_threshold_percentage),
            ));
        }
        if !(0.0..=1.0).contains(&breaker.jitter_factor) {
            return Err(ConfigError::invalid(
                "circuit_breaker.jitter_factor",
                "must be between 0.0 and 1.0",
            ));
        }
        if breaker.force_open && breaker.force_closed {
            return Err(ConfigError::invalid(
                "circuit_breaker.force_open",
                "cannot be combined with force_closed",
            ));
        }

        if self.isolation == IsolationStrategy::ThreadPool && self.thread_pool.core_size == 0 {
            return Err(ConfigError::invalid("thread_pool.core_size", "must be greater than 0"));
        }

        let metrics = &self.metrics;
        if metrics.num_buckets == 0 {
            return Err(ConfigError::invalid("metrics.num_buckets", "must be greater than 0"));
        }
        if metrics.rolling_window_ms == 0
            || metrics.rolling_window_ms % metrics.num_buckets as u64 != 0
        {
            return Err(ConfigError::invalid(
                "metrics.rolling_window_ms",
                format!(
                    "{}ms does not divide into {} buckets",
                    metrics.rolling_window_ms, metrics.num_buckets
                ),
            ));
        }
        if metrics.bus_capacity == 0 {
            return Err(ConfigError::invalid("metrics.bus_capacity", "must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CommandConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.metrics.bucket_duration_ms(), 100);
        assert_eq!(config.circuit_breaker.volume_threshold, 20);
        assert!(config.circuit_breaker.reset_health_on_close);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: CommandConfig = toml::from_str(
            r#"
            isolation = "thread_pool"
            execution_timeout_ms = 250

            [circuit_breaker]
            error_threshold_percentage = 25

            [thread_pool]
            core_size = 4
            max_queue_size = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.isolation, IsolationStrategy::ThreadPool);
        assert_eq!(config.execution_timeout_ms, 250);
        assert_eq!(config.circuit_breaker.error_threshold_percentage, 25);
        assert_eq!(config.circuit_breaker.sleep_window_ms, 5000);
        assert_eq!(config.thread_pool.core_size, 4);
        assert_eq!(config.thread_pool.queue_rejection_threshold, 5);
        assert_eq!(config.metrics.num_buckets, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CommandConfig::default();
        config.max_concurrent = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "max_concurrent"
        ));

        let mut config = CommandConfig::default();
        config.metrics.rolling_window_ms = 1001;
        assert!(config.validate().is_err());

        let mut config = CommandConfig::default();
        config.circuit_breaker.error_threshold_percentage = 101;
        assert!(config.validate().is_err());

        let mut config = CommandConfig::default();
        config.circuit_breaker.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = CommandConfig::default();
        config.isolation = IsolationStrategy::ThreadPool;
        config.thread_pool.core_size = 0;
        assert!(config.validate().is_err());
    }
}
