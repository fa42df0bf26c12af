//! CommandMachines - fault-isolating command execution
//!
//! This crate wraps calls to remote dependencies in single-use commands with:
//! - Circuit breaking driven by a rolling health window (volume and error-rate thresholds)
//! - Bulkheads: a tryable semaphore or a bounded worker pool per dependency
//! - Execution timeouts on a shared timer thread, racing completion exactly once
//! - Fallbacks under their own concurrency limit
//! - Time-bucketed rolling and cumulative outcome counters fed by an event bus
//!
//! # Example
//!
//! ```rust
//! use command_machines::{CommandError, Dependency, EventType, ManualClock};
//! use std::sync::Arc;
//!
//! let clock = Arc::new(ManualClock::new());
//! let payments = Dependency::builder("payment_api")
//!     .max_concurrent(10)
//!     .execution_timeout_ms(500)
//!     .volume_threshold(20)
//!     .error_threshold_percentage(50)
//!     .on_open(|t| println!("Circuit {} opened!", t.command_key))
//!     .clock(clock.clone())
//!     .build()
//!     .unwrap();
//!
//! // Execute with protection and a fallback
//! let charged = payments
//!     .submit(
//!         || Err("card processor down".into()),
//!         |cause: &CommandError| {
//!             println!("falling back after: {cause}");
//!             Ok("queued")
//!         },
//!     )
//!     .unwrap()
//!     .wait();
//! assert_eq!(charged.unwrap(), "queued");
//!
//! // Close the current window and read the counters
//! clock.advance(1_000);
//! payments.pump();
//! assert_eq!(payments.rolling_count(EventType::Failure), 1);
//! assert_eq!(payments.rolling_count(EventType::FallbackSuccess), 1);
//! assert!(!payments.is_circuit_open());
//! ```

pub mod builder;
pub mod bulkhead;
pub mod bus;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod command;
pub mod config;
pub mod dependency;
pub mod errors;
pub mod event;
pub mod metrics;
pub mod registry;
pub mod result;
pub mod stream;
pub mod thread_pool;
pub mod timer;

pub use builder::DependencyBuilder;
pub use bulkhead::{Permit, TryableSemaphore};
pub use bus::{EventBus, Subscription};
pub use callbacks::Transition;
pub use circuit::{CircuitBreaker, CircuitState, HealthSource};
pub use classifier::{BadRequestOn, DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, CommandHandle, ThreadState, TimedOutStatus};
pub use config::{CircuitBreakerConfig, CommandConfig, IsolationStrategy, MetricsConfig, ThreadPoolConfig};
pub use dependency::Dependency;
pub use errors::{BoxError, BuildError, CommandError, ConfigError, RejectionKind, SharedError};
pub use event::{BucketCounts, EventType, RequestEvent};
pub use metrics::CommandMetrics;
pub use registry::CommandRegistry;
pub use result::{EventCounts, ExecutionResult};
pub use stream::HealthCounts;
pub use thread_pool::{RejectedExecution, ThreadPool, ThreadPoolStats};
pub use timer::{SharedTimer, TimerHandle, TimerListener};
