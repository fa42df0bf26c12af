//! Outcome tags, the completion event published per command, and the
//! per-bucket counter array the metric streams fold events into.

use crate::result::ExecutionResult;
use std::fmt;

/// Outcome tag recorded on an [`ExecutionResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Success,
    Failure,
    Timeout,
    ShortCircuited,
    ThreadPoolRejected,
    SemaphoreRejected,
    BadRequest,
    FallbackSuccess,
    FallbackFailure,
    FallbackRejection,
    FallbackMissing,
    Cancelled,
}

impl EventType {
    /// Number of distinct tags; the length of every counter array
    pub const COUNT: usize = 12;

    /// Every tag, in index order
    pub const ALL: [EventType; EventType::COUNT] = [
        EventType::Success,
        EventType::Failure,
        EventType::Timeout,
        EventType::ShortCircuited,
        EventType::ThreadPoolRejected,
        EventType::SemaphoreRejected,
        EventType::BadRequest,
        EventType::FallbackSuccess,
        EventType::FallbackFailure,
        EventType::FallbackRejection,
        EventType::FallbackMissing,
        EventType::Cancelled,
    ];

    /// Position of this tag in counter arrays
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether the tag counts as a request in health snapshots
    pub const fn counts_toward_health(self) -> bool {
        matches!(
            self,
            EventType::Success
                | EventType::Failure
                | EventType::Timeout
                | EventType::ThreadPoolRejected
                | EventType::SemaphoreRejected
        )
    }

    /// Whether the tag counts as an error in health snapshots
    pub const fn is_health_error(self) -> bool {
        self.counts_toward_health() && !matches!(self, EventType::Success)
    }

    /// Whether the tag means user code actually ran
    pub const fn implies_execution(self) -> bool {
        matches!(
            self,
            EventType::Success | EventType::Failure | EventType::BadRequest
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::Success => "success",
            EventType::Failure => "failure",
            EventType::Timeout => "timeout",
            EventType::ShortCircuited => "short_circuited",
            EventType::ThreadPoolRejected => "thread_pool_rejected",
            EventType::SemaphoreRejected => "semaphore_rejected",
            EventType::BadRequest => "bad_request",
            EventType::FallbackSuccess => "fallback_success",
            EventType::FallbackFailure => "fallback_failure",
            EventType::FallbackRejection => "fallback_rejection",
            EventType::FallbackMissing => "fallback_missing",
            EventType::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything the bucketed stream can place on the time axis
pub trait Timestamped {
    /// Milliseconds on the owning clock at which the event happened
    fn timestamp_millis(&self) -> u64;
}

/// Immutable record of one finished command
#[derive(Debug, Clone)]
pub struct RequestEvent {
    command_key: String,
    result: ExecutionResult,
    completed_at: u64,
}

impl RequestEvent {
    pub fn new(command_key: impl Into<String>, result: ExecutionResult, completed_at: u64) -> Self {
        Self {
            command_key: command_key.into(),
            result,
            completed_at,
        }
    }

    pub fn command_key(&self) -> &str {
        &self.command_key
    }

    pub fn result(&self) -> &ExecutionResult {
        &self.result
    }

    /// Whether user code ran for this command
    pub fn execution_started(&self) -> bool {
        self.result.execution_occurred()
    }
}

impl Timestamped for RequestEvent {
    fn timestamp_millis(&self) -> u64 {
        self.completed_at
    }
}

/// Per-tag counters for one time bucket (or a fold of several)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketCounts {
    counts: [u64; EventType::COUNT],
}

impl BucketCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event: EventType) -> u64 {
        self.counts[event.index()]
    }

    /// Sum over every tag
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Fold one finished command into the bucket
    pub fn append_event(mut self, event: &RequestEvent) -> Self {
        let counts = event.result().event_counts();
        for tag in EventType::ALL {
            self.counts[tag.index()] += u64::from(counts.count(tag));
        }
        self
    }

    /// Add another bucket's counters
    pub fn merge(mut self, other: &BucketCounts) -> Self {
        for (acc, add) in self.counts.iter_mut().zip(other.counts.iter()) {
            *acc += *add;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_matches_all_order() {
        for (i, tag) in EventType::ALL.iter().enumerate() {
            assert_eq!(tag.index(), i);
        }
    }

    #[test]
    fn test_health_classification() {
        assert!(EventType::Success.counts_toward_health());
        assert!(!EventType::Success.is_health_error());
        assert!(EventType::Timeout.is_health_error());
        assert!(EventType::SemaphoreRejected.is_health_error());
        assert!(!EventType::ShortCircuited.counts_toward_health());
        assert!(!EventType::BadRequest.counts_toward_health());
        assert!(!EventType::FallbackSuccess.counts_toward_health());
    }

    #[test]
    fn test_bucket_counts_append_and_merge() {
        let failed = ExecutionResult::from_events(&[EventType::Failure, EventType::FallbackSuccess]);
        let ok = ExecutionResult::from_events(&[EventType::Success]);

        let bucket = BucketCounts::new()
            .append_event(&RequestEvent::new("svc", failed, 10))
            .append_event(&RequestEvent::new("svc", ok, 20));

        assert_eq!(bucket.get(EventType::Success), 1);
        assert_eq!(bucket.get(EventType::Failure), 1);
        assert_eq!(bucket.get(EventType::FallbackSuccess), 1);
        assert_eq!(bucket.total(), 3);

        let merged = bucket.merge(&bucket);
        assert_eq!(merged.get(EventType::Failure), 2);
    }
}
