//! Command state words
//!
//! The command-level lifecycle is a `state_machines` dynamic machine behind a
//! mutex: every transition is checked against the declared graph, and the
//! exit transitions (`terminate`, `unsubscribe`) can each succeed only once
//! between them, which is what makes cleanup run exactly once. The
//! thread-state and timed-out words are plain atomics raced with CAS.

use parking_lot::Mutex;
use state_machines::state_machine;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// An enum stored in an [`AtomicU8`]
pub(crate) trait StateWord: Copy + Eq {
    fn to_word(self) -> u8;
    fn from_word(word: u8) -> Self;
}

/// CAS-driven state word
#[derive(Debug)]
pub(crate) struct AtomicState<S> {
    word: Arc<AtomicU8>,
    _state: PhantomData<S>,
}

impl<S: StateWord> AtomicState<S> {
    pub(crate) fn new(initial: S) -> Self {
        Self::shared(Arc::new(AtomicU8::new(initial.to_word())))
    }

    pub(crate) fn shared(word: Arc<AtomicU8>) -> Self {
        Self {
            word,
            _state: PhantomData,
        }
    }

    pub(crate) fn get(&self) -> S {
        S::from_word(self.word.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: S) {
        self.word.store(state.to_word(), Ordering::Release);
    }

    /// Move `from -> to`; `false` if another thread got there first
    pub(crate) fn compare_and_set(&self, from: S, to: S) -> bool {
        self.word
            .compare_exchange(from.to_word(), to.to_word(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Race between user code finishing and the timeout firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedOutStatus {
    NotExecuted,
    Completed,
    TimedOut,
}

impl StateWord for TimedOutStatus {
    fn to_word(self) -> u8 {
        self as u8
    }

    fn from_word(word: u8) -> Self {
        match word {
            1 => TimedOutStatus::Completed,
            2 => TimedOutStatus::TimedOut,
            _ => TimedOutStatus::NotExecuted,
        }
    }
}

/// Whether user code has started on its executing thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    NotUsingThread,
    Started,
    Unsubscribed,
    Terminal,
}

impl StateWord for ThreadState {
    fn to_word(self) -> u8 {
        self as u8
    }

    fn from_word(word: u8) -> Self {
        match word {
            1 => ThreadState::Started,
            2 => ThreadState::Unsubscribed,
            3 => ThreadState::Terminal,
            _ => ThreadState::NotUsingThread,
        }
    }
}

/// Shared data the lifecycle guards read
#[derive(Debug, Clone, Default)]
pub struct LifecycleContext {
    pub command_key: String,
    pub timed_out: Arc<AtomicU8>,
}

state_machine! {
    name: Lifecycle,
    context: LifecycleContext,
    dynamic: true,

    initial: NotStarted,
    states: [
        NotStarted,
        ChainCreated,
        UserCodeExecuted,
        Unsubscribed,
        Terminal,
    ],
    events {
        create_chain {
            transition: { from: NotStarted, to: ChainCreated }
        }
        execute_user_code {
            guards: [not_timed_out],
            transition: { from: ChainCreated, to: UserCodeExecuted }
        }
        terminate {
            transition: { from: [ChainCreated, UserCodeExecuted], to: Terminal }
        }
        unsubscribe {
            transition: { from: [ChainCreated, UserCodeExecuted], to: Unsubscribed }
        }
    }
}

impl Lifecycle<ChainCreated> {
    /// User code must not start once the timeout has claimed the command
    fn not_timed_out(&self, ctx: &LifecycleContext) -> bool {
        TimedOutStatus::from_word(ctx.timed_out.load(Ordering::Acquire)) != TimedOutStatus::TimedOut
    }
}

/// Mutex-guarded command lifecycle
pub(crate) struct CommandLifecycle {
    machine: Mutex<DynamicLifecycle>,
}

impl CommandLifecycle {
    pub(crate) fn new(context: LifecycleContext) -> Self {
        Self {
            machine: Mutex::new(DynamicLifecycle::new(context)),
        }
    }

    fn fire(&self, event: LifecycleEvent) -> Result<(), &'static str> {
        let mut machine = self.machine.lock();
        match machine.handle(event) {
            Ok(_) => Ok(()),
            Err(_) => Err(machine.current_state()),
        }
    }

    /// NotStarted -> ChainCreated; the error carries the state found instead
    pub(crate) fn create_chain(&self) -> Result<(), &'static str> {
        self.fire(LifecycleEvent::CreateChain)
    }

    pub(crate) fn execute_user_code(&self) -> bool {
        self.fire(LifecycleEvent::ExecuteUserCode).is_ok()
    }

    /// Normal exit; exclusive with [`unsubscribe`](Self::unsubscribe)
    pub(crate) fn terminate(&self) -> bool {
        self.fire(LifecycleEvent::Terminate).is_ok()
    }

    /// Cancellation exit; exclusive with [`terminate`](Self::terminate)
    pub(crate) fn unsubscribe(&self) -> bool {
        self.fire(LifecycleEvent::Unsubscribe).is_ok()
    }

    pub(crate) fn state_name(&self) -> &'static str {
        self.machine.lock().current_state()
    }
}

impl std::fmt::Debug for CommandLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLifecycle")
            .field("state", &self.state_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> (CommandLifecycle, AtomicState<TimedOutStatus>) {
        let context = LifecycleContext {
            command_key: "test".into(),
            timed_out: Arc::new(AtomicU8::new(TimedOutStatus::NotExecuted.to_word())),
        };
        let timed_out = AtomicState::shared(Arc::clone(&context.timed_out));
        (CommandLifecycle::new(context), timed_out)
    }

    #[test]
    fn test_happy_path() {
        let (lifecycle, _) = lifecycle();
        assert_eq!(lifecycle.state_name(), "NotStarted");
        assert!(lifecycle.create_chain().is_ok());
        assert!(lifecycle.execute_user_code());
        assert!(lifecycle.terminate());
        assert_eq!(lifecycle.state_name(), "Terminal");
    }

    #[test]
    fn test_create_chain_only_once() {
        let (lifecycle, _) = lifecycle();
        lifecycle.create_chain().unwrap();
        assert_eq!(lifecycle.create_chain(), Err("ChainCreated"));
    }

    #[test]
    fn test_exits_are_exclusive() {
        let (lifecycle, _) = lifecycle();
        lifecycle.create_chain().unwrap();
        assert!(lifecycle.unsubscribe());
        assert!(!lifecycle.terminate());
        assert!(!lifecycle.unsubscribe());
        assert!(!lifecycle.execute_user_code());
    }

    #[test]
    fn test_timed_out_blocks_user_code() {
        let (lifecycle, timed_out) = lifecycle();
        lifecycle.create_chain().unwrap();
        assert!(timed_out.compare_and_set(TimedOutStatus::NotExecuted, TimedOutStatus::TimedOut));
        assert!(!lifecycle.execute_user_code());
        assert!(lifecycle.terminate());
    }

    #[test]
    fn test_atomic_state_cas() {
        let state = AtomicState::new(ThreadState::NotUsingThread);
        assert!(state.compare_and_set(ThreadState::NotUsingThread, ThreadState::Started));
        assert!(!state.compare_and_set(ThreadState::NotUsingThread, ThreadState::Started));
        state.set(ThreadState::Terminal);
        assert_eq!(state.get(), ThreadState::Terminal);
    }
}
