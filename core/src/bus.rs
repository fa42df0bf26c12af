//! Multicast event bus
//!
//! Every subscriber owns a bounded queue. `publish` never blocks: when a
//! subscriber's queue is full the new event is dropped for that subscriber
//! only (drop-newest) and counted, so a stalled consumer costs at most
//! `capacity` buffered events and never slows producers.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default per-subscriber queue length
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Subscriber<E> {
    id: u64,
    sender: Sender<E>,
}

/// Multi-producer, multi-consumer broadcast channel
#[derive(Debug)]
pub struct EventBus<E> {
    subscribers: RwLock<Vec<Subscriber<E>>>,
    capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Bus whose subscribers each buffer at most `capacity` events
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "Event bus capacity must be greater than 0");
        Self {
            subscribers: RwLock::new(Vec::new()),
            capacity,
            next_id: AtomicU64::new(0),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Deliver `event` to every current subscriber without blocking
    pub fn publish(&self, event: E) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut disconnected = Vec::new();
        {
            let subscribers = self.subscribers.read();
            let Some((last, rest)) = subscribers.split_last() else {
                return;
            };
            for subscriber in rest {
                self.offer(subscriber, event.clone(), &mut disconnected);
            }
            self.offer(last, event, &mut disconnected);
        }

        if !disconnected.is_empty() {
            self.subscribers
                .write()
                .retain(|s| !disconnected.contains(&s.id));
        }
    }

    fn offer(&self, subscriber: &Subscriber<E>, event: E, disconnected: &mut Vec<u64>) {
        match subscriber.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => disconnected.push(subscriber.id),
        }
    }

    /// Start receiving events published from now on
    pub fn subscribe(&self) -> Subscription<E> {
        let (sender, receiver) = crossbeam_channel::bounded(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Subscriber { id, sender });
        Subscription { receiver }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Events handed to `publish` so far
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Per-subscriber deliveries dropped because a queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the bus
///
/// Iterating blocks until the next event and ends once the bus is dropped.
/// Dropping the subscription unregisters it on the next publish.
#[derive(Debug)]
pub struct Subscription<E> {
    receiver: Receiver<E>,
}

impl<E> Subscription<E> {
    /// Next buffered event, without waiting
    pub fn try_next(&self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    /// Next event, waiting at most `timeout`
    pub fn next_timeout(&self, timeout: Duration) -> Option<E> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Events currently buffered
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl<E> Iterator for Subscription<E> {
    type Item = E;

    fn next(&mut self) -> Option<E> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(1);
        bus.publish(2);

        assert_eq!(a.try_next(), Some(1));
        assert_eq!(a.try_next(), Some(2));
        assert_eq!(b.try_next(), Some(1));
        assert_eq!(b.try_next(), Some(2));
        assert_eq!(a.try_next(), None);
    }

    #[test]
    fn test_late_subscriber_misses_past_events() {
        let bus = EventBus::new();
        bus.publish("early");

        let late = bus.subscribe();
        bus.publish("late");

        assert_eq!(late.try_next(), Some("late"));
        assert_eq!(late.try_next(), None);
    }

    #[test]
    fn test_slow_subscriber_drops_newest() {
        let bus = EventBus::with_capacity(2);
        let slow = bus.subscribe();

        for i in 0..5 {
            bus.publish(i);
        }

        assert_eq!(slow.pending(), 2);
        assert_eq!(slow.try_next(), Some(0));
        assert_eq!(slow.try_next(), Some(1));
        assert_eq!(bus.dropped_count(), 3);
        assert_eq!(bus.published_count(), 5);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        let gone = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(gone);
        bus.publish(7);

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.try_next(), Some(7));
    }

    #[test]
    fn test_concurrent_publishers() {
        let bus = Arc::new(EventBus::with_capacity(10_000));
        let sub = bus.subscribe();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let bus = Arc::clone(&bus);
                thread::spawn(move || {
                    for i in 0..250 {
                        bus.publish(t * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(sub.pending(), 1000);
        assert_eq!(bus.dropped_count(), 0);
    }

    #[test]
    fn test_iterator_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        bus.publish(1);
        drop(bus);

        let events: Vec<_> = sub.collect();
        assert_eq!(events, vec![1]);
    }
}
