//! Failure classification
//!
//! A classifier decides whether an error from user code is a dependency
//! failure. Errors it declines are recorded as bad requests: they skip the
//! fallback, never count toward health and surface to the caller unchanged.

use std::error::Error;
use std::marker::PhantomData;

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    pub command_key: &'a str,
    /// The error user code returned (downcast to inspect concrete types)
    pub error: &'a (dyn Error + Send + Sync + 'static),
    /// Time spent in user code
    pub duration_ms: u64,
}

/// Decides whether an error counts against the dependency's health
///
/// # Examples
///
/// ```rust
/// use command_machines::{FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct IgnoreNotFound;
///
/// impl FailureClassifier for IgnoreNotFound {
///     fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
///         ctx.error
///             .downcast_ref::<std::io::Error>()
///             .map(|e| e.kind() != std::io::ErrorKind::NotFound)
///             .unwrap_or(true)
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// `true` for a dependency failure, `false` for a bad request
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Treats every error as a dependency failure
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Classifier backed by a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

/// Declines errors of type `E`, turning them into bad requests
///
/// Errors wrapped in `E` are found by downcasting the boxed error user code
/// returned, so `E` must be the outermost error type.
pub struct BadRequestOn<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E: Error + 'static> BadRequestOn<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E: Error + 'static> Default for BadRequestOn<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Error + 'static> FailureClassifier for BadRequestOn<E> {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        !ctx.error.is::<E>()
    }
}

impl<E> std::fmt::Debug for BadRequestOn<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BadRequestOn<{}>", std::any::type_name::<E>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_default_classifier_trips_all() {
        let error = io::Error::other("boom");
        let ctx = FailureContext {
            command_key: "test",
            error: &error,
            duration_ms: 3,
        };
        assert!(DefaultClassifier.should_trip(&ctx));
    }

    #[test]
    fn test_predicate_classifier_downcasts() {
        #[derive(Debug, thiserror::Error)]
        #[error("http {status}")]
        struct HttpError {
            status: u16,
        }

        let classifier = PredicateClassifier::new(|ctx| {
            ctx.error
                .downcast_ref::<HttpError>()
                .map(|e| e.status >= 500)
                .unwrap_or(true)
        });

        fn trips(
            classifier: &impl FailureClassifier,
            error: &(dyn Error + Send + Sync + 'static),
        ) -> bool {
            classifier.should_trip(&FailureContext {
                command_key: "api",
                error,
                duration_ms: 10,
            })
        }

        assert!(trips(&classifier, &HttpError { status: 503 }));
        assert!(!trips(&classifier, &HttpError { status: 404 }));
        assert!(trips(&classifier, &io::Error::other("reset")));
    }

    #[test]
    fn test_predicate_on_duration() {
        let classifier = PredicateClassifier::new(|ctx| ctx.duration_ms > 100);
        let error = io::Error::other("slow");
        let fast = FailureContext {
            command_key: "test",
            error: &error,
            duration_ms: 50,
        };
        let slow = FailureContext {
            duration_ms: 200,
            ..fast
        };
        assert!(!classifier.should_trip(&fast));
        assert!(classifier.should_trip(&slow));
    }

    #[test]
    fn test_bad_request_on_type() {
        #[derive(Debug, thiserror::Error)]
        #[error("missing field {0}")]
        struct Validation(&'static str);

        let classifier = BadRequestOn::<Validation>::new();
        let invalid = Validation("email");
        let outage = io::Error::other("refused");

        let declined = FailureContext {
            command_key: "signup",
            error: &invalid,
            duration_ms: 1,
        };
        let tripped = FailureContext {
            error: &outage,
            ..declined
        };
        assert!(!classifier.should_trip(&declined));
        assert!(classifier.should_trip(&tripped));
        assert!(format!("{classifier:?}").contains("Validation"));
    }
}
