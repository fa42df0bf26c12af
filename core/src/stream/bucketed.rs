//! Time-bucketed aggregation of a bus subscription
//!
//! Time is cut into consecutive slices of `bucket_duration_ms`, aligned to
//! multiples of the duration on the stream's clock. An event folds into the
//! slice containing its timestamp. When a slice ends its bucket is handed to
//! every registered [`BucketSink`] exactly once, in time order.
//!
//! The stream is driven explicitly: [`BucketedStream::pump`] drains the
//! subscription and closes every slice that has ended. Events are drained
//! before slices close, so an event published before a deadline but pumped
//! after it still lands in its own bucket. An event whose slice has already
//! been emitted is dropped and counted rather than folded into a later bucket.

use crate::bus::Subscription;
use crate::clock::Clock;
use crate::event::Timestamped;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Folds one event into a bucket
pub type BucketReducer<E, B> = Arc<dyn Fn(B, &E) -> B + Send + Sync>;

/// Produces an empty bucket
pub type BucketFactory<B> = Arc<dyn Fn() -> B + Send + Sync>;

/// Downstream consumer of closed buckets
pub trait BucketSink<B>: Send + Sync {
    fn on_bucket(&self, bucket: &B);
}

struct BucketState<E, B> {
    source: Subscription<E>,
    current: B,
    current_start: u64,
}

/// Shared bucketing computation over one bus subscription
pub struct BucketedStream<E, B> {
    num_buckets: usize,
    bucket_duration_ms: u64,
    reduce: BucketReducer<E, B>,
    empty_bucket: BucketFactory<B>,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState<E, B>>,
    sinks: RwLock<Vec<Arc<dyn BucketSink<B>>>>,
    closed_buckets: AtomicU64,
    late_events: AtomicU64,
}

impl<E, B> BucketedStream<E, B>
where
    E: Timestamped,
{
    /// # Panics
    ///
    /// Panics if `num_buckets` or `bucket_duration_ms` is 0.
    pub fn new(
        source: Subscription<E>,
        num_buckets: usize,
        bucket_duration_ms: u64,
        reduce: BucketReducer<E, B>,
        empty_bucket: BucketFactory<B>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        assert!(num_buckets > 0, "Bucketed stream needs at least one bucket");
        assert!(bucket_duration_ms > 0, "Bucket duration must be greater than 0");

        let now = clock.now_millis();
        let current_start = now - now % bucket_duration_ms;
        let current = empty_bucket();

        Self {
            num_buckets,
            bucket_duration_ms,
            reduce,
            empty_bucket,
            clock,
            state: Mutex::new(BucketState {
                source,
                current,
                current_start,
            }),
            sinks: RwLock::new(Vec::new()),
            closed_buckets: AtomicU64::new(0),
            late_events: AtomicU64::new(0),
        }
    }

    /// Register a consumer; it sees buckets closed from now on
    pub fn add_sink(&self, sink: Arc<dyn BucketSink<B>>) {
        self.sinks.write().push(sink);
    }

    /// Drain pending events and close every slice that has ended
    ///
    /// Returns the number of buckets emitted.
    pub fn pump(&self) -> usize {
        let mut state = self.state.lock();
        let mut emitted = 0;

        while let Some(event) = state.source.try_next() {
            let timestamp = event.timestamp_millis();
            if timestamp < state.current_start {
                self.late_events.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    timestamp,
                    bucket_start = state.current_start,
                    "dropping event for closed bucket"
                );
                continue;
            }
            emitted += self.roll_forward(&mut state, timestamp);
            let bucket = std::mem::replace(&mut state.current, (self.empty_bucket)());
            state.current = (self.reduce)(bucket, &event);
        }

        emitted + self.roll_forward(&mut state, self.clock.now_millis())
    }

    /// Close slices until `now` falls inside the open one
    fn roll_forward(&self, state: &mut BucketState<E, B>, now: u64) -> usize {
        let end = state.current_start + self.bucket_duration_ms;
        if now < end {
            return 0;
        }

        let elapsed = (now - state.current_start) / self.bucket_duration_ms;
        let closed = std::mem::replace(&mut state.current, (self.empty_bucket)());
        self.emit(&closed);

        // Past a full window of empty slices, further empties change nothing
        // downstream.
        let empties = (elapsed - 1).min(self.num_buckets as u64);
        for _ in 0..empties {
            self.emit(&(self.empty_bucket)());
        }

        state.current_start += elapsed * self.bucket_duration_ms;
        tracing::trace!(
            bucket_start = state.current_start,
            emitted = empties + 1,
            "bucket rollover"
        );
        (empties + 1) as usize
    }

    fn emit(&self, bucket: &B) {
        self.closed_buckets.fetch_add(1, Ordering::Relaxed);
        for sink in self.sinks.read().iter() {
            sink.on_bucket(bucket);
        }
    }

    /// Milliseconds until the open slice ends
    pub fn millis_until_rollover(&self) -> u64 {
        let state = self.state.lock();
        (state.current_start + self.bucket_duration_ms).saturating_sub(self.clock.now_millis())
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    pub fn bucket_duration_ms(&self) -> u64 {
        self.bucket_duration_ms
    }

    /// Buckets emitted so far
    pub fn closed_bucket_count(&self) -> u64 {
        self.closed_buckets.load(Ordering::Relaxed)
    }

    /// Events dropped because their slice had already closed
    pub fn late_event_count(&self) -> u64 {
        self.late_events.load(Ordering::Relaxed)
    }
}

impl<E, B> std::fmt::Debug for BucketedStream<E, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketedStream")
            .field("num_buckets", &self.num_buckets)
            .field("bucket_duration_ms", &self.bucket_duration_ms)
            .field("sinks", &self.sinks.read().len())
            .field("closed_buckets", &self.closed_buckets.load(Ordering::Relaxed))
            .field("late_events", &self.late_events.load(Ordering::Relaxed))
            .finish()
    }
}
