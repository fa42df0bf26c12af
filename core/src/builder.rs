//! Builder API for assembling a dependency

use crate::bulkhead::TryableSemaphore;
use crate::callbacks::{Callbacks, Transition};
use crate::circuit::{CircuitBreaker, HealthSource};
use crate::classifier::{DefaultClassifier, FailureClassifier};
use crate::clock::{Clock, SystemClock};
use crate::config::{CommandConfig, IsolationStrategy};
use crate::dependency::Dependency;
use crate::errors::BuildError;
use crate::metrics::CommandMetrics;
use crate::thread_pool::ThreadPool;
use crate::timer::SharedTimer;
use parking_lot::Mutex;
use std::sync::Arc;

/// Fluent builder for a [`Dependency`]
pub struct DependencyBuilder {
    key: String,
    config: CommandConfig,
    clock: Option<Arc<dyn Clock>>,
    timer: Option<Arc<SharedTimer>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    drive_metrics: Option<bool>,
}

impl DependencyBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            config: CommandConfig::default(),
            clock: None,
            timer: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
            drive_metrics: None,
        }
    }

    /// Replace every setting at once
    pub fn config(mut self, config: CommandConfig) -> Self {
        self.config = config;
        self
    }

    pub fn isolation(mut self, isolation: IsolationStrategy) -> Self {
        self.config.isolation = isolation;
        self
    }

    /// Semaphore permits for user code
    pub fn max_concurrent(mut self, limit: usize) -> Self {
        self.config.max_concurrent = limit;
        self
    }

    pub fn fallback_max_concurrent(mut self, limit: usize) -> Self {
        self.config.fallback_max_concurrent = limit;
        self
    }

    pub fn execution_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.execution_timeout_ms = timeout_ms;
        self
    }

    pub fn timeout_enabled(mut self, enabled: bool) -> Self {
        self.config.timeout_enabled = enabled;
        self
    }

    pub fn fallback_enabled(mut self, enabled: bool) -> Self {
        self.config.fallback_enabled = enabled;
        self
    }

    pub fn circuit_enabled(mut self, enabled: bool) -> Self {
        self.config.circuit_breaker.enabled = enabled;
        self
    }

    /// Minimum requests in the window before the error rate can trip the circuit
    pub fn volume_threshold(mut self, requests: u64) -> Self {
        self.config.circuit_breaker.volume_threshold = requests;
        self
    }

    pub fn error_threshold_percentage(mut self, percentage: u32) -> Self {
        self.config.circuit_breaker.error_threshold_percentage = percentage;
        self
    }

    pub fn sleep_window_ms(mut self, window_ms: u64) -> Self {
        self.config.circuit_breaker.sleep_window_ms = window_ms;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: window * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.circuit_breaker.jitter_factor = factor;
        self
    }

    pub fn force_open(mut self, forced: bool) -> Self {
        self.config.circuit_breaker.force_open = forced;
        self
    }

    pub fn force_closed(mut self, forced: bool) -> Self {
        self.config.circuit_breaker.force_closed = forced;
        self
    }

    pub fn reset_health_on_close(mut self, reset: bool) -> Self {
        self.config.circuit_breaker.reset_health_on_close = reset;
        self
    }

    /// Switch to thread isolation on a pool of `core_size` workers
    pub fn thread_pool(mut self, core_size: usize, max_queue_size: usize) -> Self {
        self.config.isolation = IsolationStrategy::ThreadPool;
        self.config.thread_pool.core_size = core_size;
        self.config.thread_pool.max_queue_size = max_queue_size;
        self
    }

    pub fn queue_rejection_threshold(mut self, threshold: usize) -> Self {
        self.config.thread_pool.queue_rejection_threshold = threshold;
        self
    }

    /// Rolling window length and the number of buckets it is cut into
    pub fn rolling_window(mut self, window_ms: u64, num_buckets: usize) -> Self {
        self.config.metrics.rolling_window_ms = window_ms;
        self.config.metrics.num_buckets = num_buckets;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share a timer instead of starting one for this dependency
    pub fn timer(mut self, timer: Arc<SharedTimer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Start a background thread that advances the metric buckets
    ///
    /// Defaults to on with the system clock and off when a clock is supplied,
    /// in which case [`Dependency::pump`] drives them.
    pub fn drive_metrics(mut self, enabled: bool) -> Self {
        self.drive_metrics = Some(enabled);
        self
    }

    /// Set a failure classifier to split dependency failures from bad requests
    ///
    /// # Examples
    ///
    /// ```rust
    /// use command_machines::{Dependency, FailureContext, PredicateClassifier};
    /// use std::sync::Arc;
    ///
    /// let dependency = Dependency::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx: &FailureContext<'_>| {
    ///         // Fast failures are the caller's fault
    ///         ctx.duration_ms > 5
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Called when the circuit opens
    pub fn on_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Transition<'_>) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(callback));
        self
    }

    /// Called when a probe closes the circuit
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Transition<'_>) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(callback));
        self
    }

    /// Called when a probe is admitted through the open circuit
    pub fn on_half_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Transition<'_>) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(callback));
        self
    }

    /// Validate the settings and start the dependency's threads
    pub fn build(self) -> Result<Arc<Dependency>, BuildError> {
        self.config.validate()?;

        let key = self.key;
        let config = self.config;
        let drive_metrics = self.drive_metrics.unwrap_or(self.clock.is_none());
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let timer = match self.timer {
            Some(timer) => timer,
            None => Arc::new(SharedTimer::new(format!("{key}-timer"))?),
        };

        let metrics = Arc::new(CommandMetrics::new(key.clone(), &config.metrics, clock.clone()));
        let breaker = CircuitBreaker::with_callbacks(
            key.clone(),
            config.circuit_breaker.clone(),
            metrics.clone() as Arc<dyn HealthSource>,
            clock.clone(),
            self.callbacks,
        );

        let pool = match config.isolation {
            IsolationStrategy::ThreadPool => Some(
                ThreadPool::new(key.clone(), config.thread_pool.clone()).map_err(|source| {
                    BuildError::Spawn {
                        command: key.clone(),
                        source,
                    }
                })?,
            ),
            IsolationStrategy::Semaphore => None,
        };

        let driver = if drive_metrics {
            Some(metrics.start_driver().map_err(|source| BuildError::Spawn {
                command: key.clone(),
                source,
            })?)
        } else {
            None
        };

        tracing::debug!(command = %key, isolation = ?config.isolation, "dependency built");
        Ok(Arc::new(Dependency {
            semaphore: Arc::new(TryableSemaphore::new(key.clone(), config.max_concurrent)),
            fallback_semaphore: Arc::new(TryableSemaphore::new(
                format!("{key}-fallback"),
                config.fallback_max_concurrent,
            )),
            classifier: self
                .failure_classifier
                .unwrap_or_else(|| Arc::new(DefaultClassifier)),
            driver: Mutex::new(driver),
            key,
            config,
            clock,
            timer,
            metrics,
            breaker,
            pool,
        }))
    }
}

impl std::fmt::Debug for DependencyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyBuilder")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .field("drive_metrics", &self.drive_metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::ConfigError;

    #[test]
    fn test_builder_applies_settings() {
        let dependency = DependencyBuilder::new("search")
            .max_concurrent(3)
            .execution_timeout_ms(250)
            .volume_threshold(5)
            .error_threshold_percentage(25)
            .sleep_window_ms(1_000)
            .rolling_window(2_000, 20)
            .clock(Arc::new(ManualClock::new()))
            .build()
            .unwrap();

        let config = dependency.config();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.execution_timeout_ms, 250);
        assert_eq!(config.circuit_breaker.volume_threshold, 5);
        assert_eq!(config.circuit_breaker.error_threshold_percentage, 25);
        assert_eq!(config.metrics.bucket_duration_ms(), 100);
        assert_eq!(dependency.semaphore().limit(), 3);
        assert!(dependency.thread_pool().is_none());
        assert!(!dependency.is_circuit_open());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = DependencyBuilder::new("broken").max_concurrent(0).build();
        assert!(matches!(
            result,
            Err(BuildError::Config(ConfigError::Invalid { .. }))
        ));
    }

    #[test]
    fn test_builder_thread_pool() {
        let dependency = DependencyBuilder::new("pooled")
            .thread_pool(2, 4)
            .queue_rejection_threshold(3)
            .build()
            .unwrap();

        let stats = dependency.thread_pool_stats().unwrap();
        assert_eq!(stats.core_size, 2);
        assert_eq!(dependency.config().thread_pool.max_queue_size, 4);
        dependency.shutdown();
    }

    #[test]
    fn test_driver_follows_clock_choice() {
        let system = DependencyBuilder::new("real-time").build().unwrap();
        assert!(system.driver.lock().is_some());

        let manual = DependencyBuilder::new("manual")
            .clock(Arc::new(ManualClock::new()))
            .build()
            .unwrap();
        assert!(manual.driver.lock().is_none());

        let opted_out = DependencyBuilder::new("opted-out")
            .drive_metrics(false)
            .build()
            .unwrap();
        assert!(opted_out.driver.lock().is_none());

        let opted_in = DependencyBuilder::new("opted-in")
            .clock(Arc::new(ManualClock::new()))
            .drive_metrics(true)
            .build()
            .unwrap();
        assert!(opted_in.driver.lock().is_some());
    }

    #[test]
    fn test_builder_callbacks() {
        let builder = DependencyBuilder::new("callbacks")
            .on_open(|t| println!("{} opened", t.command_key))
            .on_close(|t| println!("{} closed", t.command_key))
            .on_half_open(|t| println!("{} probing", t.command_key));

        assert!(builder.callbacks.on_open.is_some());
        assert!(builder.callbacks.on_close.is_some());
        assert!(builder.callbacks.on_half_open.is_some());
    }
}
