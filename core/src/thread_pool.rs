//! Bounded worker pool for thread isolation
//!
//! A fixed set of `core_size` workers drains a bounded queue. Admission is
//! decided synchronously at submit time: a task is accepted only if a worker
//! is idle or the queue has room, and never when the queue has reached
//! `queue_rejection_threshold`. With `max_queue_size == 0` there is no queue
//! and a task is accepted only when it can be handed straight to an idle
//! worker.

use crate::config::ThreadPoolConfig;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use thiserror::Error;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Why the pool refused a task
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectedExecution {
    #[error("thread pool '{pool}' is at capacity")]
    Saturated { pool: String },

    #[error("thread pool '{pool}' queue reached its rejection threshold ({threshold})")]
    QueueThreshold { pool: String, threshold: usize },

    #[error("thread pool '{pool}' is shut down")]
    Shutdown { pool: String },
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadPoolStats {
    pub core_size: usize,
    pub active_count: usize,
    pub queue_size: usize,
    pub completed_task_count: u64,
    pub rejected_task_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    outstanding: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
}

/// Fixed-size pool of named worker threads
pub struct ThreadPool {
    name: String,
    config: ThreadPoolConfig,
    sender: RwLock<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl ThreadPool {
    /// Spawn `core_size` workers
    pub fn new(name: impl Into<String>, config: ThreadPoolConfig) -> std::io::Result<Self> {
        let name = name.into();
        let capacity = config.core_size + config.max_queue_size;
        let (sender, receiver) = crossbeam_channel::bounded::<Task>(capacity.max(1));
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(config.core_size);
        for index in 0..config.core_size {
            let receiver = receiver.clone();
            let counters = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || work(receiver, counters))?;
            workers.push(handle);
        }

        tracing::debug!(pool = %name, core_size = config.core_size, max_queue_size = config.max_queue_size, "thread pool started");
        Ok(Self {
            name,
            config,
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
        })
    }

    /// Whether the queue is below its rejection threshold
    pub fn is_queue_space_available(&self) -> bool {
        if self.config.max_queue_size == 0 {
            return true;
        }
        self.queue_size() < self.config.queue_rejection_threshold
    }

    /// Hand `task` to a worker, or reject it without blocking
    pub fn execute(&self, task: Task) -> Result<(), RejectedExecution> {
        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            return Err(self.reject(RejectedExecution::Shutdown {
                pool: self.name.clone(),
            }));
        };

        if !self.is_queue_space_available() {
            return Err(self.reject(RejectedExecution::QueueThreshold {
                pool: self.name.clone(),
                threshold: self.config.queue_rejection_threshold,
            }));
        }

        let capacity = self.config.core_size + self.config.max_queue_size;
        let reserved = self
            .counters
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(self.reject(RejectedExecution::Saturated {
                pool: self.name.clone(),
            }));
        }

        // Reservations never exceed the channel capacity.
        if sender.try_send(task).is_err() {
            self.counters.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(self.reject(RejectedExecution::Shutdown {
                pool: self.name.clone(),
            }));
        }
        Ok(())
    }

    fn reject(&self, error: RejectedExecution) -> RejectedExecution {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(pool = %self.name, error = %error, "task rejected");
        error
    }

    /// Tasks waiting for a worker
    pub fn queue_size(&self) -> usize {
        let outstanding = self.counters.outstanding.load(Ordering::Acquire);
        let active = self.counters.active.load(Ordering::Acquire);
        outstanding.saturating_sub(active)
    }

    pub fn stats(&self) -> ThreadPoolStats {
        ThreadPoolStats {
            core_size: self.config.core_size,
            active_count: self.counters.active.load(Ordering::Acquire),
            queue_size: self.queue_size(),
            completed_task_count: self.counters.completed.load(Ordering::Relaxed),
            rejected_task_count: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.config
    }

    /// Stop accepting work, let queued tasks finish, and join the workers
    ///
    /// Safe to call from a worker: that worker is not joined.
    pub fn shutdown(&self) {
        self.sender.write().take();
        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::debug!(pool = %self.name, "thread pool shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.read().is_none()
    }
}

fn work(receiver: Receiver<Task>, counters: Arc<Counters>) {
    for task in receiver.iter() {
        counters.active.fetch_add(1, Ordering::AcqRel);
        // Tasks catch their own panics; this keeps the worker alive regardless.
        let _ = panic::catch_unwind(AssertUnwindSafe(task));
        counters.active.fetch_sub(1, Ordering::AcqRel);
        counters.outstanding.fetch_sub(1, Ordering::AcqRel);
        counters.completed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Workers exit once the queue drains.
        self.sender.write().take();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(core_size: usize, max_queue_size: usize, threshold: usize) -> ThreadPool {
        ThreadPool::new(
            "test-pool",
            ThreadPoolConfig {
                core_size,
                max_queue_size,
                queue_rejection_threshold: threshold,
            },
        )
        .unwrap()
    }

    fn blocker(gate: &Receiver<()>, started: &Sender<()>) -> Task {
        let gate = gate.clone();
        let started = started.clone();
        Box::new(move || {
            let _ = started.send(());
            let _ = gate.recv();
        })
    }

    #[test]
    fn test_direct_handoff_rejects_when_all_busy() {
        let pool = pool(2, 0, 5);
        let (release, gate) = crossbeam_channel::unbounded();
        let (started_tx, started) = crossbeam_channel::unbounded();

        pool.execute(blocker(&gate, &started_tx)).unwrap();
        pool.execute(blocker(&gate, &started_tx)).unwrap();
        let third = pool.execute(Box::new(|| {}));
        assert!(matches!(third, Err(RejectedExecution::Saturated { .. })));

        started.recv_timeout(Duration::from_secs(2)).unwrap();
        started.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(pool.stats().active_count, 2);
        assert_eq!(pool.stats().rejected_task_count, 1);

        release.send(()).unwrap();
        release.send(()).unwrap();
        pool.shutdown();
        assert_eq!(pool.stats().completed_task_count, 2);
    }

    #[test]
    fn test_queue_rejection_threshold() {
        let pool = pool(1, 10, 2);
        let (release, gate) = crossbeam_channel::unbounded();
        let (started_tx, started) = crossbeam_channel::unbounded();

        pool.execute(blocker(&gate, &started_tx)).unwrap();
        started.recv_timeout(Duration::from_secs(2)).unwrap();

        pool.execute(Box::new(|| {})).unwrap();
        pool.execute(Box::new(|| {})).unwrap();
        assert_eq!(pool.queue_size(), 2);
        assert!(!pool.is_queue_space_available());

        let rejected = pool.execute(Box::new(|| {}));
        assert!(matches!(
            rejected,
            Err(RejectedExecution::QueueThreshold { threshold: 2, .. })
        ));

        release.send(()).unwrap();
        pool.shutdown();
        assert_eq!(pool.stats().completed_task_count, 3);
        assert_eq!(pool.stats().queue_size, 0);
    }

    #[test]
    fn test_panicking_task_keeps_worker() {
        fn explode() {
            panic!("task blew up");
        }

        let pool = pool(1, 0, 5);
        pool.execute(Box::new(explode)).unwrap();

        let (done_tx, done) = crossbeam_channel::bounded(1);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let done_tx = done_tx.clone();
            if pool.execute(Box::new(move || {
                let _ = done_tx.send(());
            })).is_ok()
            {
                break;
            }
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        done.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_execute_after_shutdown_is_rejected() {
        let pool = pool(1, 0, 5);
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.execute(Box::new(|| {})),
            Err(RejectedExecution::Shutdown { .. })
        ));
    }
}
