//! Metric aggregation over the request event bus
//!
//! One [`BucketedStream`] per dependency slices completion events into
//! fixed-duration buckets. Any number of sinks share that computation:
//! [`RollingStream`] keeps a sliding window, [`CumulativeStream`] keeps a
//! running total, and [`HealthCounts`] is the rolling summary the circuit
//! breaker reads.

pub mod bucketed;
pub mod cumulative;
pub mod health;
pub mod rolling;

pub use bucketed::{BucketFactory, BucketReducer, BucketSink, BucketedStream};
pub use cumulative::CumulativeStream;
pub use health::{HealthCounts, HealthStream};
pub use rolling::{OutputFactory, OutputReducer, RollingStream};
