//! Callback system for circuit breaker state transitions

use crate::stream::HealthCounts;
use std::sync::Arc;

/// What a transition callback is told
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    pub command_key: &'a str,
    /// Health snapshot the breaker saw when it changed state
    pub health: HealthCounts,
    pub at_millis: u64,
}

pub type TransitionFn = Arc<dyn Fn(&Transition<'_>) + Send + Sync>;

/// Callbacks for circuit breaker events
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<TransitionFn>,
    pub on_close: Option<TransitionFn>,
    /// Fires when a probe request is admitted through an open circuit
    pub on_half_open: Option<TransitionFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger_open(&self, transition: &Transition<'_>) {
        Self::fire(&self.on_open, transition);
    }

    pub fn trigger_close(&self, transition: &Transition<'_>) {
        Self::fire(&self.on_close, transition);
    }

    pub fn trigger_half_open(&self, transition: &Transition<'_>) {
        Self::fire(&self.on_half_open, transition);
    }

    fn fire(callback: &Option<TransitionFn>, transition: &Transition<'_>) {
        if let Some(callback) = callback {
            callback(transition);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}
