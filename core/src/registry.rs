//! Per-key dependency registry
//!
//! Every command key maps to exactly one [`Dependency`], so all commands for
//! a key share one circuit breaker, one bulkhead and one set of metric
//! streams. The registry owns the timer and clock its dependencies share.

use crate::clock::{Clock, SystemClock};
use crate::command::CommandHandle;
use crate::config::CommandConfig;
use crate::dependency::Dependency;
use crate::errors::{BoxError, BuildError, CommandError};
use crate::timer::SharedTimer;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

pub struct CommandRegistry {
    dependencies: DashMap<String, Arc<Dependency>>,
    timer: Arc<SharedTimer>,
    clock: Arc<dyn Clock>,
    drive_metrics: bool,
}

impl CommandRegistry {
    /// Registry on the system clock; each dependency gets a metrics driver
    pub fn new() -> Result<Self, BuildError> {
        Ok(Self {
            dependencies: DashMap::new(),
            timer: Arc::new(SharedTimer::new("command-registry-timer")?),
            clock: Arc::new(SystemClock::new()),
            drive_metrics: true,
        })
    }

    /// Registry on `clock`; metrics advance only through [`Dependency::pump`]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Result<Self, BuildError> {
        Ok(Self {
            dependencies: DashMap::new(),
            timer: Arc::new(SharedTimer::new("command-registry-timer")?),
            clock,
            drive_metrics: false,
        })
    }

    /// The dependency for `key`, built from `config` on first use
    ///
    /// Concurrent first calls build at most one dependency. Later calls
    /// return the existing one and ignore `config`.
    pub fn get_or_create(
        &self,
        key: &str,
        config: &CommandConfig,
    ) -> Result<Arc<Dependency>, BuildError> {
        if let Some(existing) = self.dependencies.get(key) {
            return Ok(Arc::clone(existing.value()));
        }

        match self.dependencies.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let dependency = Dependency::builder(key)
                    .config(config.clone())
                    .clock(Arc::clone(&self.clock))
                    .timer(Arc::clone(&self.timer))
                    .drive_metrics(self.drive_metrics)
                    .build()?;
                tracing::info!(command = %key, "registered dependency");
                entry.insert(Arc::clone(&dependency));
                Ok(dependency)
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Dependency>> {
        self.dependencies.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .dependencies
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Forget `key` and shut its dependency down
    ///
    /// Commands already holding the dependency keep working against it; the
    /// next `get_or_create` builds a fresh one.
    pub fn remove(&self, key: &str) -> Option<Arc<Dependency>> {
        let (_, dependency) = self.dependencies.remove(key)?;
        dependency.shutdown();
        Some(dependency)
    }

    /// Run `work` against the dependency for `key`
    pub fn submit<T, W, F>(
        &self,
        key: &str,
        config: &CommandConfig,
        work: W,
        fallback: F,
    ) -> Result<CommandHandle<T>, CommandError>
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, BoxError> + Send + 'static,
        F: FnOnce(&CommandError) -> Result<T, BoxError> + Send + 'static,
    {
        let dependency = self
            .get_or_create(key, config)
            .map_err(|error| error.into_command_error(key))?;
        dependency.submit(work, fallback)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn timer(&self) -> &Arc<SharedTimer> {
        &self.timer
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl Drop for CommandRegistry {
    fn drop(&mut self) {
        for entry in self.dependencies.iter() {
            entry.value().shutdown();
        }
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("keys", &self.keys())
            .field("timer", &self.timer)
            .field("drive_metrics", &self.drive_metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::ConfigError;
    use crate::event::EventType;
    use std::sync::Barrier;
    use std::thread;

    fn manual_registry() -> (CommandRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let registry = CommandRegistry::with_clock(clock.clone()).unwrap();
        (registry, clock)
    }

    #[test]
    fn test_same_key_same_dependency() {
        let (registry, _clock) = manual_registry();
        let config = CommandConfig::default();

        let first = registry.get_or_create("users", &config).unwrap();
        let second = registry.get_or_create("users", &config).unwrap();
        let other = registry.get_or_create("orders", &config).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.keys(), vec!["orders".to_string(), "users".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_get_or_create_builds_once() {
        let (registry, _clock) = manual_registry();
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry
                        .get_or_create("search", &CommandConfig::default())
                        .unwrap()
                })
            })
            .collect();
        let dependencies: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for dependency in &dependencies[1..] {
            assert!(Arc::ptr_eq(&dependencies[0], dependency));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_submit_shares_metrics_per_key() {
        let (registry, clock) = manual_registry();
        let config = CommandConfig::default();

        for i in 0..3 {
            let value = registry
                .submit("inventory", &config, move || Ok(i), |_| Ok(-1))
                .unwrap()
                .wait()
                .unwrap();
            assert_eq!(value, i);
        }

        let dependency = registry.get("inventory").unwrap();
        clock.advance(config.metrics.rolling_window_ms);
        dependency.pump();
        assert_eq!(dependency.rolling_count(EventType::Success), 3);
        assert_eq!(dependency.health_counts().total_requests(), 3);
    }

    #[test]
    fn test_invalid_config_surfaces_as_command_error() {
        let (registry, _clock) = manual_registry();
        let mut config = CommandConfig::default();
        config.max_concurrent = 0;

        let result = registry.submit("broken", &config, || Ok(1), |_| Ok(0));
        assert!(matches!(
            result,
            Err(CommandError::Config(ConfigError::Invalid { .. }))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_builds_fresh_dependency() {
        let (registry, _clock) = manual_registry();
        let config = CommandConfig::default();

        let first = registry.get_or_create("payments", &config).unwrap();
        let removed = registry.remove("payments").unwrap();
        assert!(Arc::ptr_eq(&first, &removed));
        assert!(registry.get("payments").is_none());

        let second = registry.get_or_create("payments", &config).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(registry.remove("missing").is_none());
    }
}
