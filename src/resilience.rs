//! Retry, circuit breaking and timeouts for outbound calls.
//!
//! A [`ResiliencePipeline`] wraps any fallible async operation in a fixed
//! stack of policies, outermost first:
//!
//! ```text
//! Timeout -> Circuit Breaker -> Retry -> operation
//! ```
//!
//! The timeout bounds the whole retry sequence, the breaker short-circuits
//! before any attempt is made, and retry is the only layer that re-invokes the
//! operation. The order is not configurable.
//!
//! The same pipeline protects message publishes (through [`ResilienceLayer`])
//! and plain HTTP calls. Each protected call-site owns one pipeline, and the
//! breaker state is shared by every clone of it.

mod circuit_breaker;
mod hook;
mod layer;
mod pipeline;
mod retry;

use std::time::Duration;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use hook::{DefaultResilienceHook, ResilienceHook};
pub use layer::{ResilienceLayer, ResilienceService};
pub use pipeline::ResiliencePipeline;
pub use retry::RetryPolicy;

/// Classification of failures the pipeline is allowed to retry.
///
/// Only transient failures (network, connectivity, server-side overload) are
/// retried or counted by the circuit breaker. Anything else propagates on the
/// first occurrence.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Tunables for one protected call-site.
#[derive(Debug, Clone, PartialEq)]
pub struct ResiliencePolicy {
    /// Total number of attempts, the first one included.
    pub retry_count: u32,
    /// Backoff before attempt `k + 1` is `backoff_unit * 2^k`.
    pub backoff_unit: Duration,
    /// Consecutive transient failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial.
    pub break_duration: Duration,
    /// Deadline for the whole attempt sequence.
    pub timeout: Duration,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            backoff_unit: Duration::from_secs(1),
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Error returned by [`ResiliencePipeline::execute`].
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The operation failed and was not (or no longer) retried.
    Inner(E),
    /// The circuit is open; the operation was not invoked.
    CircuitOpen { retry_after: Duration },
    /// The deadline elapsed; the in-flight attempt was dropped.
    Timeout(Duration),
    /// The pipeline's cancellation token fired.
    Cancelled,
}

impl<E> ResilienceError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Inner(err) => Some(err),
            _ => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResilienceError::Inner(err) => write!(f, "{err}"),
            ResilienceError::CircuitOpen { retry_after } => {
                write!(f, "circuit open, retry after {retry_after:?}")
            }
            ResilienceError::Timeout(limit) => write!(f, "timed out after {limit:?}"),
            ResilienceError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl<E> std::error::Error for ResilienceError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResilienceError::Inner(err) => Some(err),
            _ => None,
        }
    }
}
