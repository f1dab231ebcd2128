use std::time::Duration;

/// Hook trait for observing resilience decisions.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// They only observe: nothing a hook does changes whether a call succeeds.
pub trait ResilienceHook: Send + Sync {
    /// Attempt `attempt` failed transiently; the next one starts after `delay`.
    fn on_retry(&self, attempt: u32, delay: Duration, error: &dyn std::error::Error);
    /// The circuit opened and will reject calls for `duration`.
    fn on_break(&self, duration: Duration);
    /// The break elapsed; the next call is a trial.
    fn on_half_open(&self);
    /// A trial succeeded and the circuit closed.
    fn on_reset(&self);
    /// A call was rejected by the open circuit.
    fn on_rejected(&self, retry_after: Duration);
    /// The attempt sequence exceeded its deadline.
    fn on_timeout(&self, limit: Duration);
}

/// Default resilience hook implementation.
///
/// Logs every decision using `tracing`.
pub struct DefaultResilienceHook;

impl ResilienceHook for DefaultResilienceHook {
    fn on_retry(&self, attempt: u32, delay: Duration, error: &dyn std::error::Error) {
        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "Transient failure, retrying"
        );
    }

    fn on_break(&self, duration: Duration) {
        tracing::error!(
            break_seconds = duration.as_secs_f64(),
            "Circuit breaker opened"
        );
    }

    fn on_half_open(&self) {
        tracing::info!("Circuit breaker half-open, letting a trial call through");
    }

    fn on_reset(&self) {
        tracing::info!("Circuit breaker reset");
    }

    fn on_rejected(&self, retry_after: Duration) {
        tracing::debug!(
            retry_after_ms = retry_after.as_millis() as u64,
            "Circuit breaker open, call rejected"
        );
    }

    fn on_timeout(&self, limit: Duration) {
        tracing::warn!(timeout_ms = limit.as_millis() as u64, "Call timed out");
    }
}
