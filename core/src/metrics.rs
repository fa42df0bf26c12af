//! Per-dependency metrics
//!
//! A [`CommandMetrics`] owns the dependency's event bus and the single
//! bucketed stream over it. The health, rolling and cumulative streams are
//! all sinks of that one stream.

use crate::bus::{EventBus, Subscription};
use crate::circuit::HealthSource;
use crate::clock::Clock;
use crate::config::MetricsConfig;
use crate::event::{BucketCounts, EventType, RequestEvent};
use crate::result::ExecutionResult;
use crate::stream::{BucketedStream, CumulativeStream, HealthCounts, HealthStream, RollingStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type CountStream = RollingStream<BucketCounts, BucketCounts>;
type TotalStream = CumulativeStream<BucketCounts, BucketCounts>;

/// Outcome counters and health for one dependency
pub struct CommandMetrics {
    command_key: String,
    clock: Arc<dyn Clock>,
    events: EventBus<RequestEvent>,
    bucketed: BucketedStream<RequestEvent, BucketCounts>,
    health: Arc<HealthStream>,
    rolling: Arc<CountStream>,
    cumulative: Arc<TotalStream>,
    concurrent: AtomicU32,
}

impl CommandMetrics {
    /// `config` must already be validated
    pub fn new(command_key: impl Into<String>, config: &MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        let num_buckets = config.num_buckets;
        let events = EventBus::with_capacity(config.bus_capacity);
        let bucketed = BucketedStream::new(
            events.subscribe(),
            num_buckets,
            config.bucket_duration_ms(),
            Arc::new(|bucket: BucketCounts, event: &RequestEvent| bucket.append_event(event)),
            Arc::new(BucketCounts::new),
            clock.clone(),
        );

        let health = Arc::new(HealthStream::health(num_buckets));
        let rolling: Arc<CountStream> = Arc::new(RollingStream::new(
            num_buckets,
            Arc::new(|acc: BucketCounts, bucket: &BucketCounts| acc.merge(bucket)),
            Arc::new(BucketCounts::new),
        ));
        let cumulative: Arc<TotalStream> = Arc::new(CumulativeStream::new(
            num_buckets,
            Arc::new(|acc: BucketCounts, bucket: &BucketCounts| acc.merge(bucket)),
            Arc::new(BucketCounts::new),
        ));
        bucketed.add_sink(health.clone());
        bucketed.add_sink(rolling.clone());
        bucketed.add_sink(cumulative.clone());

        Self {
            command_key: command_key.into(),
            clock,
            events,
            bucketed,
            health,
            rolling,
            cumulative,
            concurrent: AtomicU32::new(0),
        }
    }

    pub fn command_key(&self) -> &str {
        &self.command_key
    }

    /// Publish a finished command, stamped with the current time
    pub fn mark_command_done(&self, result: ExecutionResult) {
        let event = RequestEvent::new(self.command_key.clone(), result, self.clock.now_millis());
        self.events.publish(event);
    }

    /// Advance the bucketed stream; returns the number of buckets closed
    pub fn pump(&self) -> usize {
        self.bucketed.pump()
    }

    /// Raw completion events published from now on
    pub fn observe_events(&self) -> Subscription<RequestEvent> {
        self.events.subscribe()
    }

    /// Rolling counter summaries, one per bucket tick
    pub fn observe_rolling(&self) -> Subscription<BucketCounts> {
        self.rolling.observe()
    }

    pub fn observe_cumulative(&self) -> Subscription<BucketCounts> {
        self.cumulative.observe()
    }

    pub fn observe_health(&self) -> Subscription<HealthCounts> {
        self.health.observe()
    }

    pub fn health_counts(&self) -> HealthCounts {
        self.health.latest_or_empty()
    }

    /// Count of `event` over the rolling window
    pub fn rolling_count(&self, event: EventType) -> u64 {
        self.rolling.latest_or_empty().get(event)
    }

    /// Count of `event` since the metrics were created
    pub fn cumulative_count(&self, event: EventType) -> u64 {
        self.cumulative.latest_or_empty().get(event)
    }

    pub fn reset_health(&self) {
        self.health.reset();
    }

    /// Commands currently running user code
    pub fn concurrent_execution_count(&self) -> u32 {
        self.concurrent.load(Ordering::Acquire)
    }

    pub(crate) fn increment_concurrent(&self) {
        self.concurrent.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_concurrent(&self) {
        let _ = self
            .concurrent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn late_event_count(&self) -> u64 {
        self.bucketed.late_event_count()
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.events.dropped_count()
    }

    /// Start a thread that pumps the bucketed stream at bucket boundaries
    ///
    /// The thread holds only a weak reference and exits once the metrics are
    /// dropped or the returned driver is stopped.
    pub fn start_driver(self: &Arc<Self>) -> std::io::Result<MetricsDriver> {
        let metrics = Arc::downgrade(self);
        let stop = Arc::new(AtomicBool::new(false));
        let max_sleep = self.bucketed.bucket_duration_ms();
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("metrics-{}", self.command_key))
            .spawn(move || drive(metrics, thread_stop, max_sleep))?;

        Ok(MetricsDriver {
            stop,
            handle: Some(handle),
        })
    }
}

fn drive(metrics: Weak<CommandMetrics>, stop: Arc<AtomicBool>, max_sleep: u64) {
    while !stop.load(Ordering::Acquire) {
        let Some(metrics) = metrics.upgrade() else {
            break;
        };
        metrics.pump();
        let wait = metrics.bucketed.millis_until_rollover().clamp(1, max_sleep);
        drop(metrics);
        thread::sleep(Duration::from_millis(wait));
    }
}

impl HealthSource for CommandMetrics {
    fn health_counts(&self) -> HealthCounts {
        CommandMetrics::health_counts(self)
    }

    fn reset(&self) {
        self.reset_health();
    }
}

impl std::fmt::Debug for CommandMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandMetrics")
            .field("command_key", &self.command_key)
            .field("bucketed", &self.bucketed)
            .field("concurrent", &self.concurrent_execution_count())
            .finish()
    }
}

/// Background pump for one dependency's metrics; stops on drop
#[derive(Debug)]
pub struct MetricsDriver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsDriver {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
