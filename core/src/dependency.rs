//! Everything shared by the commands of one dependency

use crate::builder::DependencyBuilder;
use crate::bulkhead::TryableSemaphore;
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::classifier::FailureClassifier;
use crate::clock::Clock;
use crate::command::{Command, CommandHandle};
use crate::config::CommandConfig;
use crate::errors::{BoxError, CommandError};
use crate::event::EventType;
use crate::metrics::{CommandMetrics, MetricsDriver};
use crate::stream::HealthCounts;
use crate::thread_pool::{ThreadPool, ThreadPoolStats};
use crate::timer::SharedTimer;
use parking_lot::Mutex;
use std::sync::Arc;

/// Circuit breaker, isolators, metrics and timer for one dependency key
pub struct Dependency {
    pub(crate) key: String,
    pub(crate) config: CommandConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) timer: Arc<SharedTimer>,
    pub(crate) metrics: Arc<CommandMetrics>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) semaphore: Arc<TryableSemaphore>,
    pub(crate) fallback_semaphore: Arc<TryableSemaphore>,
    pub(crate) pool: Option<ThreadPool>,
    pub(crate) classifier: Arc<dyn FailureClassifier>,
    pub(crate) driver: Mutex<Option<MetricsDriver>>,
}

impl Dependency {
    pub fn builder(key: impl Into<String>) -> DependencyBuilder {
        DependencyBuilder::new(key)
    }

    /// A command running `work`, to be submitted later
    pub fn command<T, W>(self: &Arc<Self>, work: W) -> Command<T>
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        Command::new(Arc::clone(self), work)
    }

    /// Run `work` under this dependency's protection, with `fallback`
    pub fn submit<T, W, F>(self: &Arc<Self>, work: W, fallback: F) -> Result<CommandHandle<T>, CommandError>
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, BoxError> + Send + 'static,
        F: FnOnce(&CommandError) -> Result<T, BoxError> + Send + 'static,
    {
        self.command(work).with_fallback(fallback).submit()
    }

    /// Run `work` without a fallback and wait for it
    pub fn execute<T, W>(self: &Arc<Self>, work: W) -> Result<T, CommandError>
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        self.command(work).execute()
    }

    pub fn health_counts(&self) -> HealthCounts {
        self.metrics.health_counts()
    }

    pub fn rolling_count(&self, event: EventType) -> u64 {
        self.metrics.rolling_count(event)
    }

    pub fn cumulative_count(&self, event: EventType) -> u64 {
        self.metrics.cumulative_count(event)
    }

    pub fn is_circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Drive the metric streams by hand; see [`CommandMetrics::pump`]
    pub fn pump(&self) -> usize {
        self.metrics.pump()
    }

    pub fn thread_pool_stats(&self) -> Option<ThreadPoolStats> {
        self.pool.as_ref().map(ThreadPool::stats)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<CommandMetrics> {
        &self.metrics
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn semaphore(&self) -> &Arc<TryableSemaphore> {
        &self.semaphore
    }

    pub fn fallback_semaphore(&self) -> &Arc<TryableSemaphore> {
        &self.fallback_semaphore
    }

    pub fn thread_pool(&self) -> Option<&ThreadPool> {
        self.pool.as_ref()
    }

    pub fn timer(&self) -> &SharedTimer {
        &self.timer
    }

    pub fn classifier(&self) -> &dyn FailureClassifier {
        self.classifier.as_ref()
    }

    /// Stop the metrics driver and the worker pool
    ///
    /// Commands already queued still run; new thread-isolated commands are
    /// rejected.
    pub fn shutdown(&self) {
        if let Some(mut driver) = self.driver.lock().take() {
            driver.stop();
        }
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
        tracing::debug!(command = %self.key, "dependency shut down");
    }
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependency")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .field("metrics", &self.metrics)
            .field("pool", &self.pool)
            .field("classifier", &self.classifier)
            .finish()
    }
}
