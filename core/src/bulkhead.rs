//! Non-blocking counting semaphore for semaphore isolation and fallbacks
//!
//! `try_acquire` never waits: a saturated semaphore rejects immediately and
//! the caller records the rejection. Each successful acquire yields a
//! [`Permit`] that gives its slot back exactly once, whether released
//! explicitly, dropped, or both.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Fixed-capacity semaphore with a lock-free acquire
#[derive(Debug)]
pub struct TryableSemaphore {
    name: String,
    limit: usize,
    acquired: AtomicUsize,
}

impl TryableSemaphore {
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        assert!(limit > 0, "Semaphore limit must be greater than 0");
        Self {
            name: name.into(),
            limit,
            acquired: AtomicUsize::new(0),
        }
    }

    /// Take a permit if one is free
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut current = self.acquired.load(Ordering::Acquire);

        loop {
            if current >= self.limit {
                tracing::trace!(semaphore = %self.name, limit = self.limit, "semaphore saturated");
                return None;
            }

            match self.acquired.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Permit {
                        semaphore: Arc::clone(self),
                        released: AtomicBool::new(false),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Permits currently held
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.acquired())
    }

    fn release_one(&self) {
        let _ = self
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// One held slot of a [`TryableSemaphore`]
#[derive(Debug)]
pub struct Permit {
    semaphore: Arc<TryableSemaphore>,
    released: AtomicBool,
}

impl Permit {
    /// Give the slot back; later calls and the eventual drop are no-ops
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.semaphore.release_one();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_eleventh_acquire_fails() {
        let semaphore = Arc::new(TryableSemaphore::new("svc", 10));
        let permits: Vec<_> = (0..10).map(|_| semaphore.try_acquire()).collect();
        assert!(permits.iter().all(Option::is_some));
        assert_eq!(semaphore.available(), 0);

        assert!(semaphore.try_acquire().is_none());
        assert_eq!(semaphore.acquired(), 10);
    }

    #[test]
    fn test_release_frees_exactly_one_slot() {
        let semaphore = Arc::new(TryableSemaphore::new("svc", 10));
        let mut permits: Vec<_> = (0..10).filter_map(|_| semaphore.try_acquire()).collect();

        let released = permits.pop();
        drop(released);

        let semaphore_ref = &semaphore;
        let winners = thread::scope(|scope| {
            let barrier = Arc::new(Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let barrier = barrier.clone();
                    scope.spawn(move || {
                        barrier.wait();
                        semaphore_ref.try_acquire()
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(winners.len(), 1);
        assert_eq!(semaphore.acquired(), 10);
    }

    #[test]
    fn test_release_is_idempotent() {
        let semaphore = Arc::new(TryableSemaphore::new("svc", 2));
        let _held = semaphore.try_acquire().unwrap();
        let permit = semaphore.try_acquire().unwrap();

        permit.release();
        permit.release();
        assert!(permit.is_released());
        assert_eq!(semaphore.acquired(), 1);

        drop(permit);
        assert_eq!(semaphore.acquired(), 1);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_limit() {
        let semaphore = Arc::new(TryableSemaphore::new("svc", 5));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let semaphore = Arc::clone(&semaphore);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if let Some(_permit) = semaphore.try_acquire() {
                            peak.fetch_max(semaphore.acquired(), Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(semaphore.acquired(), 0);
    }

    #[test]
    #[should_panic(expected = "Semaphore limit must be greater than 0")]
    fn test_zero_limit_panics() {
        let _ = TryableSemaphore::new("svc", 0);
    }
}
