//! Running total over every bucket since the stream started

use crate::bus::{EventBus, Subscription};
use crate::stream::bucketed::BucketSink;
use crate::stream::rolling::{OutputFactory, OutputReducer};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::Arc;

struct Accumulator<A> {
    total: A,
    folded: usize,
}

/// Folds every closed bucket into one accumulator that is never evicted
///
/// Like the rolling stream, nothing is published until `num_buckets`
/// buckets have been folded. There is no reset.
pub struct CumulativeStream<B, A> {
    num_buckets: usize,
    reduce: OutputReducer<B, A>,
    empty_output: OutputFactory<A>,
    state: Mutex<Accumulator<A>>,
    latest: ArcSwapOption<A>,
    outputs: EventBus<A>,
}

impl<B, A> CumulativeStream<B, A>
where
    B: Send + Sync,
    A: Clone + Send + Sync,
{
    pub fn new(
        num_buckets: usize,
        reduce: OutputReducer<B, A>,
        empty_output: OutputFactory<A>,
    ) -> Self {
        let total = empty_output();
        Self {
            num_buckets,
            reduce,
            empty_output,
            state: Mutex::new(Accumulator {
                total,
                folded: 0,
            }),
            latest: ArcSwapOption::empty(),
            outputs: EventBus::new(),
        }
    }

    pub fn latest(&self) -> Option<A> {
        self.latest.load().as_deref().cloned()
    }

    pub fn latest_or_empty(&self) -> A {
        self.latest().unwrap_or_else(|| (self.empty_output)())
    }

    pub fn observe(&self) -> Subscription<A> {
        self.outputs.subscribe()
    }

    fn fold(&self, bucket: &B) {
        let mut state = self.state.lock();
        let total = std::mem::replace(&mut state.total, (self.empty_output)());
        state.total = (self.reduce)(total, bucket);
        state.folded = state.folded.saturating_add(1);
        if state.folded < self.num_buckets {
            return;
        }

        let snapshot = state.total.clone();
        self.latest.store(Some(Arc::new(snapshot.clone())));
        drop(state);
        self.outputs.publish(snapshot);
    }
}

impl<B, A> BucketSink<B> for CumulativeStream<B, A>
where
    B: Send + Sync,
    A: Clone + Send + Sync,
{
    fn on_bucket(&self, bucket: &B) {
        self.fold(bucket);
    }
}

impl<B, A> std::fmt::Debug for CumulativeStream<B, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CumulativeStream")
            .field("num_buckets", &self.num_buckets)
            .field("folded", &self.state.lock().folded)
            .finish()
    }
}
