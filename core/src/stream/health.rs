//! Rolling error-rate snapshots for the circuit breaker

use crate::event::{BucketCounts, EventType};
use crate::stream::rolling::RollingStream;
use std::sync::Arc;

/// Request volume and error rate over the rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthCounts {
    total_requests: u64,
    error_count: u64,
    error_percentage: u32,
}

impl HealthCounts {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(total_requests: u64, error_count: u64) -> Self {
        let error_percentage = if total_requests > 0 {
            ((error_count as f64 / total_requests as f64) * 100.0).round() as u32
        } else {
            0
        };
        Self {
            total_requests,
            error_count,
            error_percentage,
        }
    }

    /// Add one bucket's health-relevant tags
    pub fn plus(&self, bucket: &BucketCounts) -> Self {
        let (requests, errors) = EventType::ALL
            .into_iter()
            .filter(|tag| tag.counts_toward_health())
            .fold((0, 0), |(requests, errors), tag| {
                let n = bucket.get(tag);
                let errors = if tag.is_health_error() { errors + n } else { errors };
                (requests + n, errors)
            });
        Self::new(self.total_requests + requests, self.error_count + errors)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn error_percentage(&self) -> u32 {
        self.error_percentage
    }
}

pub type HealthStream = RollingStream<BucketCounts, HealthCounts>;

impl RollingStream<BucketCounts, HealthCounts> {
    /// Rolling health aggregator over `num_buckets` buckets
    pub fn health(num_buckets: usize) -> Self {
        RollingStream::new(
            num_buckets,
            Arc::new(|health: HealthCounts, bucket: &BucketCounts| health.plus(bucket)),
            Arc::new(HealthCounts::empty),
        )
    }
}
