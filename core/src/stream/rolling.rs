//! Sliding window over the last N closed buckets

use crate::bus::{EventBus, Subscription};
use crate::stream::bucketed::BucketSink;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Folds one bucket into the window summary
pub type OutputReducer<B, A> = Arc<dyn Fn(A, &B) -> A + Send + Sync>;

/// Produces the summary of an empty window
pub type OutputFactory<A> = Arc<dyn Fn() -> A + Send + Sync>;

/// Emits one summary per bucket tick over exactly the last `num_buckets`
/// buckets
///
/// The first `num_buckets - 1` ticks after construction or [`reset`] emit
/// nothing: the window is not full yet.
///
/// [`reset`]: RollingStream::reset
pub struct RollingStream<B, A> {
    num_buckets: usize,
    reduce: OutputReducer<B, A>,
    empty_output: OutputFactory<A>,
    window: Mutex<VecDeque<B>>,
    /// Readers load this without locking
    latest: ArcSwapOption<A>,
    outputs: EventBus<A>,
}

impl<B, A> RollingStream<B, A>
where
    B: Clone + Send + Sync,
    A: Clone + Send + Sync,
{
    /// # Panics
    ///
    /// Panics if `num_buckets` is 0.
    pub fn new(
        num_buckets: usize,
        reduce: OutputReducer<B, A>,
        empty_output: OutputFactory<A>,
    ) -> Self {
        assert!(num_buckets > 0, "Rolling window needs at least one bucket");
        Self {
            num_buckets,
            reduce,
            empty_output,
            window: Mutex::new(VecDeque::with_capacity(num_buckets)),
            latest: ArcSwapOption::empty(),
            outputs: EventBus::new(),
        }
    }

    /// Most recent summary, or `None` until the window first fills
    pub fn latest(&self) -> Option<A> {
        self.latest.load().as_deref().cloned()
    }

    /// Most recent summary, or the empty summary
    pub fn latest_or_empty(&self) -> A {
        self.latest().unwrap_or_else(|| (self.empty_output)())
    }

    /// Receive every summary emitted from now on
    pub fn observe(&self) -> Subscription<A> {
        self.outputs.subscribe()
    }

    /// Discard the window; output resumes once it refills
    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.clear();
        self.latest.store(None);
        tracing::debug!("rolling window reset");
    }

    /// Buckets currently held
    pub fn window_len(&self) -> usize {
        self.window.lock().len()
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    fn push(&self, bucket: &B) {
        let mut window = self.window.lock();
        window.push_back(bucket.clone());
        if window.len() > self.num_buckets {
            window.pop_front();
        }
        if window.len() < self.num_buckets {
            return;
        }

        let summary = window
            .iter()
            .fold((self.empty_output)(), |acc, bucket| (self.reduce)(acc, bucket));
        self.latest.store(Some(Arc::new(summary.clone())));
        drop(window);
        self.outputs.publish(summary);
    }
}

impl<B, A> BucketSink<B> for RollingStream<B, A>
where
    B: Clone + Send + Sync,
    A: Clone + Send + Sync,
{
    fn on_bucket(&self, bucket: &B) {
        self.push(bucket);
    }
}

impl<B, A> std::fmt::Debug for RollingStream<B, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingStream")
            .field("num_buckets", &self.num_buckets)
            .field("window_len", &self.window.lock().len())
            .finish()
    }
}
