//! Immutable execution outcome records
//!
//! An [`ExecutionResult`] is rebuilt at every stage of a command's pipeline.
//! Every `with_*`/`add_*` method returns a new value, so a snapshot handed to
//! the timeout path or the event bus can never change underneath its reader.

use crate::errors::SharedError;
use crate::event::EventType;
use std::fmt;

/// Per-tag tally for a single command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventCounts {
    counts: [u32; EventType::COUNT],
}

impl EventCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tally with one count per listed tag
    pub fn from_events(events: &[EventType]) -> Self {
        events.iter().fold(Self::new(), |counts, &event| counts.plus(event))
    }

    /// Copy with `event` incremented by one
    pub fn plus(self, event: EventType) -> Self {
        self.plus_n(event, 1)
    }

    /// Copy with `event` incremented by `n`
    pub fn plus_n(mut self, event: EventType, n: u32) -> Self {
        let slot = &mut self.counts[event.index()];
        *slot = slot.saturating_add(n);
        self
    }

    pub fn contains(&self, event: EventType) -> bool {
        self.counts[event.index()] > 0
    }

    pub fn count(&self, event: EventType) -> u32 {
        self.counts[event.index()]
    }

    /// Tags present, in index order
    pub fn ordered(&self) -> Vec<EventType> {
        EventType::ALL
            .into_iter()
            .filter(|event| self.contains(*event))
            .collect()
    }
}

/// Outcome of one command invocation
#[derive(Clone, Default)]
pub struct ExecutionResult {
    event_counts: EventCounts,
    start_timestamp: Option<u64>,
    execution_latency: Option<u64>,
    user_thread_latency: Option<u64>,
    failed_execution_exception: Option<SharedError>,
    execution_exception: Option<SharedError>,
    execution_occurred: bool,
    executed_in_thread: bool,
}

impl ExecutionResult {
    /// Result with no events, timestamps or exceptions
    pub fn empty() -> Self {
        Self::default()
    }

    /// Result carrying the given tags; marks execution as occurred when any
    /// tag implies user code ran
    pub fn from_events(events: &[EventType]) -> Self {
        Self {
            event_counts: EventCounts::from_events(events),
            execution_occurred: events.iter().any(|e| e.implies_execution()),
            ..Self::default()
        }
    }

    pub fn with_execution_occurred(&self) -> Self {
        Self {
            execution_occurred: true,
            ..self.clone()
        }
    }

    pub fn with_execution_latency(&self, latency_ms: u64) -> Self {
        Self {
            execution_latency: Some(latency_ms),
            ..self.clone()
        }
    }

    /// Record the failure raised by user code
    pub fn with_exception(&self, error: SharedError) -> Self {
        Self {
            failed_execution_exception: Some(error),
            ..self.clone()
        }
    }

    /// Record the error that sent the command down the fallback path
    pub fn with_execution_exception(&self, error: SharedError) -> Self {
        Self {
            execution_exception: Some(error),
            ..self.clone()
        }
    }

    pub fn with_invocation_start(&self, timestamp: u64) -> Self {
        Self {
            start_timestamp: Some(timestamp),
            ..self.clone()
        }
    }

    pub fn with_executed_in_thread(&self) -> Self {
        Self {
            executed_in_thread: true,
            ..self.clone()
        }
    }

    /// Record caller-visible latency; ignored until an invocation start exists
    pub fn mark_user_thread_completion(&self, latency_ms: u64) -> Self {
        if self.start_timestamp.is_some() {
            Self {
                user_thread_latency: Some(latency_ms),
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }

    pub fn add_event(&self, event: EventType) -> Self {
        Self {
            event_counts: self.event_counts.plus(event),
            ..self.clone()
        }
    }

    /// Add a tag and, when the invocation was timed, its execution latency
    pub fn add_event_with_latency(&self, latency_ms: u64, event: EventType) -> Self {
        let next = self.add_event(event);
        if next.start_timestamp.is_some() {
            next.with_execution_latency(latency_ms)
        } else {
            next
        }
    }

    pub fn event_counts(&self) -> &EventCounts {
        &self.event_counts
    }

    pub fn start_timestamp(&self) -> Option<u64> {
        self.start_timestamp
    }

    pub fn execution_latency(&self) -> Option<u64> {
        self.execution_latency
    }

    pub fn user_thread_latency(&self) -> Option<u64> {
        self.user_thread_latency
    }

    pub fn exception(&self) -> Option<&SharedError> {
        self.failed_execution_exception.as_ref()
    }

    pub fn execution_exception(&self) -> Option<&SharedError> {
        self.execution_exception.as_ref()
    }

    pub fn execution_occurred(&self) -> bool {
        self.execution_occurred
    }

    pub fn is_executed_in_thread(&self) -> bool {
        self.executed_in_thread
    }

    pub fn ordered_events(&self) -> Vec<EventType> {
        self.event_counts.ordered()
    }
}

impl fmt::Debug for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionResult")
            .field("events", &self.event_counts.ordered())
            .field("start_timestamp", &self.start_timestamp)
            .field("execution_latency", &self.execution_latency)
            .field("user_thread_latency", &self.user_thread_latency)
            .field(
                "exception",
                &self.failed_execution_exception.as_ref().map(|e| e.to_string()),
            )
            .field(
                "execution_exception",
                &self.execution_exception.as_ref().map(|e| e.to_string()),
            )
            .field("execution_occurred", &self.execution_occurred)
            .field("executed_in_thread", &self.executed_in_thread)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_event_counts_plus_is_copy_on_write() {
        let empty = EventCounts::new();
        let one = empty.plus(EventType::Failure);
        let two = one.plus(EventType::Failure);

        assert_eq!(empty.count(EventType::Failure), 0);
        assert_eq!(one.count(EventType::Failure), 1);
        assert_eq!(two.count(EventType::Failure), 2);
        assert!(!two.contains(EventType::Success));
    }

    #[test]
    fn test_ordered_follows_index_order() {
        let counts = EventCounts::from_events(&[
            EventType::FallbackSuccess,
            EventType::Timeout,
            EventType::Timeout,
        ]);
        assert_eq!(
            counts.ordered(),
            vec![EventType::Timeout, EventType::FallbackSuccess]
        );
    }

    #[test]
    fn test_mutators_leave_original_untouched() {
        let base = ExecutionResult::empty();
        let started = base.with_invocation_start(100);
        let done = started.add_event_with_latency(25, EventType::Success);

        assert_eq!(base.start_timestamp(), None);
        assert!(base.ordered_events().is_empty());
        assert_eq!(started.execution_latency(), None);
        assert_eq!(done.execution_latency(), Some(25));
        assert_eq!(done.event_counts().count(EventType::Success), 1);
    }

    #[test]
    fn test_latency_ignored_without_start() {
        let result = ExecutionResult::empty()
            .add_event_with_latency(40, EventType::ShortCircuited)
            .mark_user_thread_completion(40);

        assert_eq!(result.execution_latency(), None);
        assert_eq!(result.user_thread_latency(), None);
        assert!(result.event_counts().contains(EventType::ShortCircuited));
    }

    #[test]
    fn test_exceptions_are_shared() {
        let error: SharedError = Arc::new(std::io::Error::other("boom"));
        let result = ExecutionResult::empty()
            .with_exception(error.clone())
            .with_execution_exception(error);

        assert_eq!(result.exception().map(|e| e.to_string()).as_deref(), Some("boom"));
        assert!(result.execution_exception().is_some());
    }

    #[test]
    fn test_from_events_marks_execution() {
        assert!(ExecutionResult::from_events(&[EventType::Success]).execution_occurred());
        assert!(!ExecutionResult::from_events(&[EventType::ShortCircuited]).execution_occurred());
    }
}
