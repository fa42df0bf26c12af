//! Circuit breaker driven by rolling health
//!
//! The breaker is a pair of atomics: an `open` flag and the timestamp of the
//! last opening or probe. Every transition is a compare-and-swap, so the
//! admission check on the request path never takes a lock.
//!
//! * Closed: requests flow. Once the rolling window holds at least
//!   `volume_threshold` requests and the error percentage reaches
//!   `error_threshold_percentage`, the first caller to notice flips the
//!   circuit open.
//! * Open: requests are short-circuited. After the sleep window one caller
//!   wins the right to probe by advancing the timestamp; everyone else keeps
//!   being rejected.
//! * A successful probe closes the circuit and (by default) discards the
//!   rolling health so stale errors do not re-open it immediately.

use crate::callbacks::{Callbacks, Transition};
use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::stream::HealthCounts;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Supplies the rolling health snapshot the breaker judges
pub trait HealthSource: Send + Sync {
    fn health_counts(&self) -> HealthCounts;

    /// Discard accumulated health and start a fresh window
    fn reset(&self);
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// Open, with a probe request admitted and not yet resolved
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

/// Per-dependency circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    health: Arc<dyn HealthSource>,
    clock: Arc<dyn Clock>,
    callbacks: Callbacks,
    open: AtomicBool,
    probing: AtomicBool,
    opened_or_last_tested: AtomicU64,
    sleep_window_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        health: Arc<dyn HealthSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_callbacks(name, config, health, clock, Callbacks::new())
    }

    pub(crate) fn with_callbacks(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        health: Arc<dyn HealthSource>,
        clock: Arc<dyn Clock>,
        callbacks: Callbacks,
    ) -> Self {
        let sleep_window_ms = AtomicU64::new(config.sleep_window_ms);
        Self {
            name: name.into(),
            config,
            health,
            clock,
            callbacks,
            open: AtomicBool::new(false),
            probing: AtomicBool::new(false),
            opened_or_last_tested: AtomicU64::new(0),
            sleep_window_ms,
        }
    }

    /// Whether a request may proceed right now
    ///
    /// Admits everything while closed, and exactly one probe per sleep window
    /// while open.
    pub fn allow_request(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        if self.config.force_open {
            return false;
        }
        if self.config.force_closed {
            // Still evaluate so transitions are observable while forced.
            let _ = self.is_open();
            return true;
        }
        !self.is_open() || self.allow_single_test()
    }

    /// Whether the circuit is open, tripping it if health warrants
    ///
    /// Never closes the circuit; only [`mark_success`](Self::mark_success)
    /// does that.
    pub fn is_open(&self) -> bool {
        if self.config.force_open {
            return true;
        }
        if self.open.load(Ordering::Acquire) {
            return true;
        }
        if !self.config.enabled {
            return false;
        }

        let health = self.health.health_counts();
        if health.total_requests() < self.config.volume_threshold {
            return false;
        }
        if health.error_percentage() < self.config.error_threshold_percentage {
            return false;
        }

        // Probes read these once `open` is set, so they are written first.
        let now = self.clock.now_millis();
        self.sleep_window_ms
            .store(self.jittered_sleep_window(), Ordering::Release);
        self.opened_or_last_tested.store(now, Ordering::Release);
        if self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!(
                command = %self.name,
                total = health.total_requests(),
                error_percentage = health.error_percentage(),
                "circuit opened"
            );
            self.callbacks.trigger_open(&Transition {
                command_key: &self.name,
                health,
                at_millis: now,
            });
        }
        // A CAS loser still sees the circuit open.
        true
    }

    /// Admit a single probe once the sleep window has elapsed
    pub fn allow_single_test(&self) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        let last = self.opened_or_last_tested.load(Ordering::Acquire);
        let now = self.clock.now_millis();
        if now <= last.saturating_add(self.sleep_window_ms.load(Ordering::Acquire)) {
            return false;
        }
        if self
            .opened_or_last_tested
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.probing.store(true, Ordering::Release);
        tracing::debug!(command = %self.name, "circuit admitted probe");
        self.callbacks.trigger_half_open(&Transition {
            command_key: &self.name,
            health: self.health.health_counts(),
            at_millis: now,
        });
        true
    }

    /// Record a successful execution; closes an open circuit
    pub fn mark_success(&self) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        if self
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.probing.store(false, Ordering::Release);
        if self.config.reset_health_on_close {
            self.health.reset();
        }
        tracing::info!(command = %self.name, "circuit closed");
        self.callbacks.trigger_close(&Transition {
            command_key: &self.name,
            health: self.health.health_counts(),
            at_millis: self.clock.now_millis(),
        });
    }

    /// Record a failed execution; a failed probe leaves the circuit open
    /// until the next sleep window
    pub fn mark_non_success(&self) {
        if self.open.load(Ordering::Acquire) {
            self.probing.store(false, Ordering::Release);
        }
    }

    pub fn state(&self) -> CircuitState {
        if !self.open.load(Ordering::Acquire) && !self.config.force_open {
            CircuitState::Closed
        } else if self.probing.load(Ordering::Acquire) {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Sleep window chosen at the last opening
    pub fn current_sleep_window_ms(&self) -> u64 {
        self.sleep_window_ms.load(Ordering::Acquire)
    }

    fn jittered_sleep_window(&self) -> u64 {
        let window = self.config.sleep_window_ms;
        if self.config.jitter_factor > 0.0 {
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: window,
                multiplier: 1.0,
                max_delay_ms: window,
            };
            policy.calculate_delay(1, self.config.jitter_factor) as u64
        } else {
            window
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Default)]
    struct FixedHealth {
        counts: Mutex<HealthCounts>,
        resets: AtomicUsize,
    }

    impl FixedHealth {
        fn set(&self, total: u64, errors: u64) {
            *self.counts.lock() = HealthCounts::new(total, errors);
        }
    }

    impl HealthSource for FixedHealth {
        fn health_counts(&self) -> HealthCounts {
            *self.counts.lock()
        }

        fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
            *self.counts.lock() = HealthCounts::empty();
        }
    }

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<FixedHealth>, Arc<ManualClock>) {
        let health = Arc::new(FixedHealth::default());
        let clock = Arc::new(ManualClock::starting_at(1_000));
        let breaker = CircuitBreaker::new("payments", config, health.clone(), clock.clone());
        (breaker, health, clock)
    }

    #[test]
    fn test_below_volume_threshold_never_trips() {
        let (breaker, health, _) = breaker(CircuitBreakerConfig::default());
        health.set(19, 19);
        assert!(!breaker.is_open());
        assert!(breaker.allow_request());
        assert!(breaker.is_closed());
    }

    #[test]
    fn test_trips_at_threshold() {
        let (breaker, health, _) = breaker(CircuitBreakerConfig::default());
        health.set(20, 9);
        assert!(!breaker.is_open());

        health.set(20, 11);
        assert!(breaker.is_open());
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state_name(), "Open");

        // Open is sticky even when health recovers.
        health.set(0, 0);
        assert!(breaker.is_open());
    }

    #[test]
    fn test_exactly_fifty_percent_trips() {
        let (breaker, health, _) = breaker(CircuitBreakerConfig::default());
        health.set(20, 10);
        assert!(breaker.is_open());
    }

    #[test]
    fn test_probe_after_sleep_window() {
        let (breaker, health, clock) = breaker(CircuitBreakerConfig::default());
        health.set(20, 11);
        assert!(breaker.is_open());

        clock.advance(5_000);
        assert!(!breaker.allow_request());

        clock.advance(1);
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_single_probe_under_contention() {
        let (breaker, health, clock) = breaker(CircuitBreakerConfig::default());
        health.set(20, 20);
        assert!(breaker.is_open());
        clock.advance(6_000);

        let breaker = Arc::new(breaker);
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    breaker.allow_request()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_successful_probe_closes_and_resets_health() {
        let (breaker, health, clock) = breaker(CircuitBreakerConfig::default());
        health.set(20, 11);
        assert!(breaker.is_open());

        clock.advance(5_001);
        assert!(breaker.allow_request());
        breaker.mark_success();

        assert!(breaker.is_closed());
        assert_eq!(health.resets.load(Ordering::SeqCst), 1);
        assert_eq!(health.health_counts().total_requests(), 0);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_failed_probe_waits_another_window() {
        let (breaker, health, clock) = breaker(CircuitBreakerConfig::default());
        health.set(20, 11);
        assert!(breaker.is_open());

        clock.advance(5_001);
        assert!(breaker.allow_request());
        breaker.mark_non_success();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(4_000);
        assert!(!breaker.allow_request());
        clock.advance(1_001);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_reset_on_close_can_be_disabled() {
        let config = CircuitBreakerConfig {
            reset_health_on_close: false,
            ..Default::default()
        };
        let (breaker, health, clock) = breaker(config);
        health.set(20, 11);
        assert!(breaker.is_open());
        clock.advance(5_001);
        assert!(breaker.allow_request());
        breaker.mark_success();

        assert!(breaker.is_closed());
        assert_eq!(health.resets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_forced_states() {
        let (forced_open, _, _) = breaker(CircuitBreakerConfig {
            force_open: true,
            ..Default::default()
        });
        assert!(!forced_open.allow_request());
        assert_eq!(forced_open.state(), CircuitState::Open);

        let (forced_closed, health, _) = breaker(CircuitBreakerConfig {
            force_closed: true,
            ..Default::default()
        });
        health.set(100, 100);
        assert!(forced_closed.allow_request());

        let (disabled, health, _) = breaker(CircuitBreakerConfig {
            enabled: false,
            ..Default::default()
        });
        health.set(100, 100);
        assert!(disabled.allow_request());
        assert!(!disabled.is_open());
    }

    #[test]
    fn test_callbacks_fire_on_transitions() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str| {
            let events = events.clone();
            Some(Arc::new(move |t: &Transition<'_>| {
                events.lock().push((label, t.command_key.to_string(), t.at_millis));
            }) as crate::callbacks::TransitionFn)
        };
        let callbacks = Callbacks {
            on_open: record("open"),
            on_close: record("close"),
            on_half_open: record("half_open"),
        };
        let health = Arc::new(FixedHealth::default());
        let clock = Arc::new(ManualClock::starting_at(0));
        let breaker = CircuitBreaker::with_callbacks(
            "search",
            CircuitBreakerConfig::default(),
            health.clone(),
            clock.clone(),
            callbacks,
        );

        health.set(20, 20);
        assert!(breaker.is_open());
        clock.advance(5_001);
        assert!(breaker.allow_request());
        breaker.mark_success();

        let events = events.lock();
        let labels: Vec<_> = events.iter().map(|(label, _, _)| *label).collect();
        assert_eq!(labels, vec!["open", "half_open", "close"]);
        assert!(events.iter().all(|(_, key, _)| key == "search"));
        assert_eq!(events[1].2, 5_001);
    }

    #[test]
    fn test_jitter_shortens_sleep_window() {
        let config = CircuitBreakerConfig {
            jitter_factor: 0.5,
            ..Default::default()
        };
        let (breaker, health, _) = breaker(config);
        health.set(20, 20);
        assert!(breaker.is_open());

        let window = breaker.current_sleep_window_ms();
        assert!((2_500..=5_000).contains(&window), "window {window} out of range");
    }

    #[test]
    fn test_trip_admits_nothing_before_sleep_window() {
        for _ in 0..200 {
            let health = Arc::new(FixedHealth::default());
            let clock = Arc::new(ManualClock::starting_at(60_000));
            let breaker = Arc::new(CircuitBreaker::new(
                "payments",
                CircuitBreakerConfig::default(),
                health.clone(),
                clock,
            ));
            health.set(20, 20);

            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let breaker = Arc::clone(&breaker);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        breaker.allow_request()
                    })
                })
                .collect();

            for handle in handles {
                assert!(!handle.join().unwrap());
            }
            assert_eq!(breaker.state(), CircuitState::Open);
        }
    }
}
