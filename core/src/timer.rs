//! Shared timeout timer
//!
//! One background thread serves every command of every dependency that
//! shares the timer. Registrations live in an arena of slots; a
//! [`TimerHandle`] is a token (slot index plus generation) into it. Each slot
//! carries an atomic state word, and firing races cancelling through a single
//! compare-and-swap on it, so a listener runs at most once and never after a
//! successful cancel.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Work run by the timer thread when a registration comes due
pub trait TimerListener: Send + Sync {
    fn tick(&self);
}

impl<F> TimerListener for F
where
    F: Fn() + Send + Sync,
{
    fn tick(&self) {
        self()
    }
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("timer '{name}' is shut down")]
    Shutdown { name: String },

    #[error("failed to spawn timer thread")]
    Spawn(#[from] std::io::Error),
}

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Arena position of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerToken {
    index: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    state: Arc<AtomicU8>,
    listener: Option<Arc<dyn TimerListener>>,
}

#[derive(Default)]
struct Schedule {
    slots: Vec<Slot>,
    free: Vec<usize>,
    deadlines: BinaryHeap<Reverse<(Instant, TimerToken)>>,
}

impl Schedule {
    fn allocate(&mut self, listener: Arc<dyn TimerListener>) -> (TimerToken, Arc<AtomicU8>) {
        let state = Arc::new(AtomicU8::new(ARMED));
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.state = Arc::clone(&state);
                slot.listener = Some(listener);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: Arc::clone(&state),
                    listener: Some(listener),
                });
                self.slots.len() - 1
            }
        };
        let generation = self.slots[index].generation;
        (TimerToken { index, generation }, state)
    }

    /// Return a slot to the free list; stale tokens stop matching it
    fn release(&mut self, token: TimerToken) -> Option<Arc<dyn TimerListener>> {
        let slot = self.slots.get_mut(token.index)?;
        if slot.generation != token.generation {
            return None;
        }
        slot.generation += 1;
        self.free.push(token.index);
        slot.listener.take()
    }

    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

struct TimerCore {
    name: String,
    schedule: Mutex<Schedule>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

impl TimerCore {
    fn run(&self) {
        let mut schedule = self.schedule.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let Some(&Reverse((deadline, token))) = schedule.deadlines.peek() else {
                self.wakeup.wait(&mut schedule);
                continue;
            };
            if deadline > Instant::now() {
                let _ = self.wakeup.wait_until(&mut schedule, deadline);
                continue;
            }
            schedule.deadlines.pop();

            let Some(slot) = schedule.slots.get(token.index) else {
                continue;
            };
            if slot.generation != token.generation {
                // Cancelled and already recycled.
                continue;
            }
            let won = slot
                .state
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            let listener = schedule.release(token);

            if won && let Some(listener) = listener {
                drop(schedule);
                if panic::catch_unwind(AssertUnwindSafe(|| listener.tick())).is_err() {
                    tracing::warn!(timer = %self.name, "timer listener panicked");
                }
                schedule = self.schedule.lock();
            }
        }
    }
}

/// Single-threaded deadline scheduler shared by many commands
pub struct SharedTimer {
    core: Arc<TimerCore>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SharedTimer {
    pub fn new(name: impl Into<String>) -> Result<Self, TimerError> {
        let core = Arc::new(TimerCore {
            name: name.into(),
            schedule: Mutex::new(Schedule::default()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let thread_core = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name(core.name.clone())
            .spawn(move || thread_core.run())?;

        Ok(Self {
            core,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `listener` once, `delay_ms` from now, unless cancelled first
    pub fn register(
        &self,
        listener: Arc<dyn TimerListener>,
        delay_ms: u64,
    ) -> Result<TimerHandle, TimerError> {
        if self.core.shutdown.load(Ordering::Acquire) {
            return Err(TimerError::Shutdown {
                name: self.core.name.clone(),
            });
        }

        let deadline = Instant::now() + Duration::from_millis(delay_ms);
        let mut schedule = self.core.schedule.lock();
        let (token, state) = schedule.allocate(listener);
        let earliest = schedule
            .deadlines
            .peek()
            .is_none_or(|Reverse((next, _))| deadline < *next);
        schedule.deadlines.push(Reverse((deadline, token)));
        drop(schedule);

        if earliest {
            self.core.wakeup.notify_one();
        }
        Ok(TimerHandle {
            core: Arc::clone(&self.core),
            token,
            state,
        })
    }

    /// Registrations neither fired nor cancelled
    pub fn pending(&self) -> usize {
        self.core.schedule.lock().live()
    }

    /// Stop the timer thread; pending registrations never fire
    pub fn shutdown(&self) {
        self.core.shutdown.store(true, Ordering::Release);
        {
            let _schedule = self.core.schedule.lock();
            self.core.wakeup.notify_all();
        }
        if let Some(handle) = self.thread.lock().take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for SharedTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SharedTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTimer")
            .field("name", &self.core.name)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Cancellation token for one registration
pub struct TimerHandle {
    core: Arc<TimerCore>,
    token: TimerToken,
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    /// Prevent the listener from running
    ///
    /// Returns `true` only for the call that actually disarmed it. Calling
    /// again, or after the listener fired, is a no-op.
    pub fn cancel(&self) -> bool {
        if self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let listener = self.core.schedule.lock().release(self.token);
        drop(listener);
        true
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn token(&self) -> TimerToken {
        self.token
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("token", &self.token)
            .field("fired", &self.has_fired())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
