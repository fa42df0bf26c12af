//! One-shot command execution
//!
//! A [`Command`] wraps one call to a dependency. Submitting it runs the
//! pipeline: circuit check, isolation (semaphore permit or thread-pool
//! slot), timeout registration, user code, outcome classification, fallback,
//! and cleanup. Cleanup (cancel the timer, release the permit, stamp the
//! caller-visible latency, publish the completion event) runs exactly once,
//! on whichever path reaches a terminal state first: normal completion,
//! timeout, or cancellation.
//!
//! ```rust
//! use command_machines::{Dependency, ManualClock};
//! use std::sync::Arc;
//!
//! let dependency = Dependency::builder("inventory")
//!     .clock(Arc::new(ManualClock::new()))
//!     .build()
//!     .unwrap();
//!
//! let stock = dependency
//!     .submit(|| Ok(42), |_cause| Ok(0))
//!     .unwrap()
//!     .wait();
//! assert_eq!(stock.unwrap(), 42);
//! ```

mod lifecycle;

pub use lifecycle::{ThreadState, TimedOutStatus};

use crate::classifier::FailureContext;
use crate::dependency::Dependency;
use crate::errors::{BoxError, CommandError, Panicked, RejectionKind, SharedError};
use crate::event::EventType;
use crate::result::ExecutionResult;
use crate::thread_pool::ThreadPool;
use crate::timer::{TimerHandle, TimerListener};
use lifecycle::{AtomicState, CommandLifecycle, LifecycleContext, StateWord};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// User code
pub type Work<T> = Box<dyn FnOnce() -> Result<T, BoxError> + Send + 'static>;

/// Alternate result, given the error that triggered it
pub type Fallback<T> = Box<dyn FnOnce(&CommandError) -> Result<T, BoxError> + Send + 'static>;

/// A single-use unit of work against one dependency
pub struct Command<T> {
    core: Arc<CommandCore<T>>,
}

impl<T: Send + 'static> Command<T> {
    pub fn new<W>(dependency: Arc<Dependency>, work: W) -> Self
    where
        W: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        Self {
            core: Arc::new(CommandCore::new(dependency, Box::new(work))),
        }
    }

    /// Attach the fallback run on failure, timeout, rejection or short-circuit
    pub fn with_fallback<F>(self, fallback: F) -> Self
    where
        F: FnOnce(&CommandError) -> Result<T, BoxError> + Send + 'static,
    {
        *self.core.fallback.lock() = Some(Box::new(fallback));
        self
    }

    /// Start execution
    ///
    /// With semaphore isolation user code runs on the calling thread before
    /// this returns; with thread isolation it is queued on the dependency's
    /// pool. A command can be submitted once; later calls fail with
    /// [`CommandError::InvalidState`] and change nothing.
    pub fn submit(&self) -> Result<CommandHandle<T>, CommandError> {
        self.core.submit()
    }

    /// Submit and block for the outcome
    pub fn execute(&self) -> Result<T, CommandError> {
        self.submit()?.wait()
    }

    pub fn command_key(&self) -> &str {
        self.core.dependency.key()
    }

    /// Snapshot of the result record so far
    pub fn execution_result(&self) -> ExecutionResult {
        self.core.result.lock().clone()
    }

    pub fn state_name(&self) -> &'static str {
        self.core.lifecycle.state_name()
    }

    pub fn timed_out_status(&self) -> TimedOutStatus {
        self.core.timed_out.get()
    }

    pub fn thread_state(&self) -> ThreadState {
        self.core.thread_state.get()
    }
}

impl<T> std::fmt::Debug for Command<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("command_key", &self.core.dependency.key())
            .field("lifecycle", &self.core.lifecycle)
            .finish()
    }
}

/// Caller's side of a submitted command
pub struct CommandHandle<T> {
    core: Arc<CommandCore<T>>,
}

impl<T: Send + 'static> CommandHandle<T> {
    /// Block until the command reaches a terminal state
    pub fn wait(self) -> Result<T, CommandError> {
        match self.core.completion.take(None) {
            Some(outcome) => outcome,
            None => Err(self.consumed()),
        }
    }

    /// Wait at most `timeout`; `None` if the command is still running
    ///
    /// Once an outcome has been returned the handle is spent.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T, CommandError>> {
        let deadline = Instant::now() + timeout;
        if self.core.completion.is_consumed() {
            return Some(Err(self.consumed()));
        }
        self.core.completion.take(Some(deadline))
    }

    pub fn is_done(&self) -> bool {
        self.core.completion.is_done()
    }

    /// Abandon the command
    ///
    /// Records `Cancelled`, runs cleanup and completes the handle with
    /// [`CommandError::Cancelled`]. Returns `false` if the command already
    /// finished.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    pub fn execution_result(&self) -> ExecutionResult {
        self.core.result.lock().clone()
    }

    pub fn command_key(&self) -> &str {
        self.core.dependency.key()
    }

    fn consumed(&self) -> CommandError {
        CommandError::InvalidState {
            command: self.core.dependency.key().to_string(),
            state: "Consumed",
        }
    }
}

impl<T> std::fmt::Debug for CommandHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("command_key", &self.core.dependency.key())
            .field("lifecycle", &self.core.lifecycle)
            .finish()
    }
}

enum Outcome<T> {
    Pending,
    Ready(Result<T, CommandError>),
    Consumed,
}

/// Write-once outcome slot
struct Completion<T> {
    slot: Mutex<Outcome<T>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Outcome::Pending),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, outcome: Result<T, CommandError>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Outcome::Pending) {
            return false;
        }
        *slot = Outcome::Ready(outcome);
        self.ready.notify_all();
        true
    }

    fn is_done(&self) -> bool {
        !matches!(*self.slot.lock(), Outcome::Pending)
    }

    fn is_consumed(&self) -> bool {
        matches!(*self.slot.lock(), Outcome::Consumed)
    }

    /// `None` on timeout or when already consumed
    fn take(&self, deadline: Option<Instant>) -> Option<Result<T, CommandError>> {
        let mut slot = self.slot.lock();
        while matches!(*slot, Outcome::Pending) {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out()
                        && matches!(*slot, Outcome::Pending)
                    {
                        return None;
                    }
                }
                None => self.ready.wait(&mut slot),
            }
        }
        match std::mem::replace(&mut *slot, Outcome::Consumed) {
            Outcome::Ready(outcome) => Some(outcome),
            Outcome::Pending | Outcome::Consumed => None,
        }
    }
}

struct CommandCore<T> {
    dependency: Arc<Dependency>,
    lifecycle: CommandLifecycle,
    thread_state: AtomicState<ThreadState>,
    timed_out: AtomicState<TimedOutStatus>,
    result: Mutex<ExecutionResult>,
    permit: Mutex<Option<crate::bulkhead::Permit>>,
    timer: Mutex<Option<TimerHandle>>,
    gauge_held: AtomicBool,
    invoked_at: AtomicU64,
    work: Mutex<Option<Work<T>>>,
    fallback: Mutex<Option<Fallback<T>>>,
    completion: Completion<T>,
}

impl<T: Send + 'static> CommandCore<T> {
    fn new(dependency: Arc<Dependency>, work: Work<T>) -> Self {
        let timed_out_word = Arc::new(AtomicU8::new(TimedOutStatus::NotExecuted.to_word()));
        let lifecycle = CommandLifecycle::new(LifecycleContext {
            command_key: dependency.key().to_string(),
            timed_out: Arc::clone(&timed_out_word),
        });

        Self {
            dependency,
            lifecycle,
            thread_state: AtomicState::new(ThreadState::NotUsingThread),
            timed_out: AtomicState::shared(timed_out_word),
            result: Mutex::new(ExecutionResult::empty()),
            permit: Mutex::new(None),
            timer: Mutex::new(None),
            gauge_held: AtomicBool::new(false),
            invoked_at: AtomicU64::new(0),
            work: Mutex::new(Some(work)),
            fallback: Mutex::new(None),
            completion: Completion::new(),
        }
    }

    fn key(&self) -> &str {
        self.dependency.key()
    }

    fn now(&self) -> u64 {
        self.dependency.clock().now_millis()
    }

    /// Replace the result record and return the new snapshot
    fn update(&self, f: impl FnOnce(&ExecutionResult) -> ExecutionResult) -> ExecutionResult {
        let mut result = self.result.lock();
        *result = f(&result);
        result.clone()
    }

    fn submit(self: &Arc<Self>) -> Result<CommandHandle<T>, CommandError> {
        if let Err(state) = self.lifecycle.create_chain() {
            return Err(CommandError::InvalidState {
                command: self.key().to_string(),
                state,
            });
        }
        self.invoked_at.store(self.now(), Ordering::Release);
        let handle = CommandHandle {
            core: Arc::clone(self),
        };

        if !self.dependency.breaker().allow_request() {
            tracing::warn!(command = %self.key(), "command short-circuited");
            self.update(|r| r.add_event(EventType::ShortCircuited));
            self.fail_to_fallback(CommandError::ShortCircuited {
                command: self.key().to_string(),
            });
            return Ok(handle);
        }

        match self.dependency.thread_pool() {
            Some(pool) => self.submit_to_pool(pool),
            None => self.run_with_semaphore(),
        }
        Ok(handle)
    }

    fn run_with_semaphore(self: &Arc<Self>) {
        let Some(permit) = self.dependency.semaphore().try_acquire() else {
            self.reject(RejectionKind::Semaphore);
            return;
        };
        *self.permit.lock() = Some(permit);
        self.begin_invocation();
        self.run_user_code(false);
    }

    fn submit_to_pool(self: &Arc<Self>, pool: &ThreadPool) {
        if !pool.is_queue_space_available() {
            self.reject(RejectionKind::ThreadPool);
            return;
        }
        self.begin_invocation();

        let core = Arc::clone(self);
        if let Err(error) = pool.execute(Box::new(move || core.run_user_code(true))) {
            // The timeout may already own the outcome.
            if self
                .timed_out
                .compare_and_set(TimedOutStatus::NotExecuted, TimedOutStatus::Completed)
            {
                self.cancel_timer();
                tracing::debug!(command = %self.key(), error = %error, "thread pool refused task");
                self.reject(RejectionKind::ThreadPool);
            }
        }
    }

    /// Stamp the invocation start and arm the timeout
    fn begin_invocation(self: &Arc<Self>) {
        let now = self.now();
        self.update(|r| r.with_invocation_start(now));

        let config = self.dependency.config();
        if !config.timeout_enabled {
            return;
        }
        let listener = Arc::new(TimeoutListener {
            core: Arc::downgrade(self),
        });
        match self
            .dependency
            .timer()
            .register(listener, config.execution_timeout_ms)
        {
            Ok(handle) => *self.timer.lock() = Some(handle),
            Err(error) => {
                tracing::warn!(command = %self.key(), error = %error, "running without timeout");
            }
        }
    }

    fn run_user_code(self: &Arc<Self>, on_pool_thread: bool) {
        let metrics = self.dependency.metrics();
        self.gauge_held.store(true, Ordering::Release);
        metrics.increment_concurrent();

        if !self.lifecycle.execute_user_code() {
            self.release_gauge();
            return;
        }
        self.update(|r| r.with_execution_occurred());
        if on_pool_thread
            && self
                .thread_state
                .compare_and_set(ThreadState::NotUsingThread, ThreadState::Started)
        {
            self.update(|r| r.with_executed_in_thread());
        }
        let Some(work) = self.work.lock().take() else {
            self.release_gauge();
            return;
        };

        let started = self.now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(work));
        let latency = self.now().saturating_sub(started);

        if !self
            .timed_out
            .compare_and_set(TimedOutStatus::NotExecuted, TimedOutStatus::Completed)
        {
            tracing::debug!(command = %self.key(), latency, "discarding late result");
            return;
        }
        self.cancel_timer();

        match outcome {
            Ok(Ok(value)) => {
                self.update(|r| r.add_event_with_latency(latency, EventType::Success));
                self.dependency.breaker().mark_success();
                self.finish(Ok(value));
            }
            Ok(Err(error)) => self.on_user_error(SharedError::from(error), latency),
            Err(payload) => {
                let panicked = Panicked::from_payload(payload);
                tracing::warn!(command = %self.key(), message = %panicked.message, "user code panicked");
                self.on_user_error(Arc::new(panicked), latency);
            }
        }
    }

    fn on_user_error(self: &Arc<Self>, error: SharedError, latency: u64) {
        let context = FailureContext {
            command_key: self.key(),
            error: &*error,
            duration_ms: latency,
        };
        if !self.dependency.classifier().should_trip(&context) {
            self.update(|r| {
                r.add_event_with_latency(latency, EventType::BadRequest)
                    .with_exception(Arc::clone(&error))
            });
            self.dependency.breaker().mark_non_success();
            self.finish(Err(CommandError::BadRequest {
                command: self.key().to_string(),
                source: error,
            }));
            return;
        }

        self.update(|r| {
            r.add_event_with_latency(latency, EventType::Failure)
                .with_exception(Arc::clone(&error))
        });
        self.dependency.breaker().mark_non_success();
        tracing::debug!(command = %self.key(), error = %error, "execution failed");
        self.fail_to_fallback(CommandError::ExecutionFailed {
            command: self.key().to_string(),
            source: error,
        });
    }

    fn on_timeout(self: &Arc<Self>) {
        if !self
            .timed_out
            .compare_and_set(TimedOutStatus::NotExecuted, TimedOutStatus::TimedOut)
        {
            return;
        }
        let latency = self
            .now()
            .saturating_sub(self.invoked_at.load(Ordering::Acquire));
        let timeout_ms = self.dependency.config().execution_timeout_ms;
        self.update(|r| r.add_event_with_latency(latency, EventType::Timeout));
        self.dependency.breaker().mark_non_success();
        tracing::warn!(command = %self.key(), timeout_ms, "command timed out");
        self.fail_to_fallback(CommandError::Timeout {
            command: self.key().to_string(),
            timeout_ms,
        });
    }

    fn reject(self: &Arc<Self>, kind: RejectionKind) {
        tracing::warn!(command = %self.key(), isolation = %kind, "command rejected");
        self.update(|r| r.add_event(kind.event_type()));
        self.dependency.breaker().mark_non_success();
        self.fail_to_fallback(CommandError::IsolationRejected {
            command: self.key().to_string(),
            kind,
        });
    }

    fn fail_to_fallback(self: &Arc<Self>, cause: CommandError) {
        let shared: SharedError = Arc::new(cause.clone());
        self.update(|r| r.with_execution_exception(shared));

        if !self.dependency.config().fallback_enabled {
            self.finish(Err(cause));
            return;
        }
        let Some(fallback) = self.fallback.lock().take() else {
            self.update(|r| r.add_event(EventType::FallbackMissing));
            self.finish(Err(cause));
            return;
        };
        let Some(_permit) = self.dependency.fallback_semaphore().try_acquire() else {
            tracing::warn!(command = %self.key(), "fallback rejected");
            self.update(|r| r.add_event(EventType::FallbackRejection));
            self.finish(Err(CommandError::FallbackRejected {
                command: self.key().to_string(),
                cause: Box::new(cause),
            }));
            return;
        };

        tracing::debug!(command = %self.key(), cause = %cause, "running fallback");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| fallback(&cause)));
        let failure: SharedError = match outcome {
            Ok(Ok(value)) => {
                self.update(|r| r.add_event(EventType::FallbackSuccess));
                self.finish(Ok(value));
                return;
            }
            Ok(Err(error)) => SharedError::from(error),
            Err(payload) => Arc::new(Panicked::from_payload(payload)),
        };

        tracing::debug!(command = %self.key(), error = %failure, "fallback failed");
        self.update(|r| r.add_event(EventType::FallbackFailure));
        self.finish(Err(CommandError::FallbackFailed {
            command: self.key().to_string(),
            cause: Box::new(cause),
            source: failure,
        }));
    }

    /// Terminate, clean up, then hand the outcome to the waiter
    fn finish(&self, outcome: Result<T, CommandError>) {
        if self.lifecycle.terminate() {
            self.cleanup(ThreadState::Terminal);
            self.completion.complete(outcome);
        } else {
            tracing::debug!(
                command = %self.key(),
                state = self.lifecycle.state_name(),
                "dropping outcome of finished command"
            );
        }
    }

    fn cancel(&self) -> bool {
        if !self.lifecycle.unsubscribe() {
            return false;
        }
        // User code still running loses the race and its result is dropped.
        self.timed_out
            .compare_and_set(TimedOutStatus::NotExecuted, TimedOutStatus::Completed);
        self.update(|r| r.add_event(EventType::Cancelled));
        self.dependency.breaker().mark_non_success();
        self.cleanup(ThreadState::Unsubscribed);
        self.completion.complete(Err(CommandError::Cancelled {
            command: self.key().to_string(),
        }));
        tracing::debug!(command = %self.key(), "command cancelled");
        true
    }

    /// Runs once, guarded by the lifecycle exit transition
    fn cleanup(&self, thread_state: ThreadState) {
        self.cancel_timer();
        if let Some(permit) = self.permit.lock().take() {
            permit.release();
        }
        self.release_gauge();
        if self.thread_state.get() == ThreadState::Started {
            self.thread_state.set(thread_state);
        }

        let latency = self
            .now()
            .saturating_sub(self.invoked_at.load(Ordering::Acquire));
        let snapshot = self.update(|r| r.mark_user_thread_completion(latency));
        tracing::debug!(
            command = %self.key(),
            events = ?snapshot.ordered_events(),
            latency,
            "command finished"
        );
        self.dependency.metrics().mark_command_done(snapshot);
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }

    fn release_gauge(&self) {
        if self.gauge_held.swap(false, Ordering::AcqRel) {
            self.dependency.metrics().decrement_concurrent();
        }
    }
}

/// Timer registration for one command; holds the command weakly
struct TimeoutListener<T> {
    core: Weak<CommandCore<T>>,
}

impl<T: Send + 'static> TimerListener for TimeoutListener<T> {
    fn tick(&self) {
        if let Some(core) = self.core.upgrade() {
            core.on_timeout();
        }
    }
}
