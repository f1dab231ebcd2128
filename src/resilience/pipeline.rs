use std::{future::Future, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use super::{
    BreakerSnapshot, CircuitBreaker, DefaultResilienceHook, ResilienceError, ResilienceHook,
    ResiliencePolicy, RetryPolicy, Transient,
};

/// Timeout, circuit breaker and retry applied around one call-site.
///
/// Cloning a pipeline shares its breaker: every clone guards the same
/// call-site.
#[derive(Clone)]
pub struct ResiliencePipeline {
    name: Arc<str>,
    retry: RetryPolicy,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
    hook: Arc<dyn ResilienceHook>,
    cancel: Option<CancellationToken>,
}

impl ResiliencePipeline {
    /// Create a pipeline for the call-site `name`, logging through the
    /// default hook.
    pub fn new(name: impl Into<Arc<str>>, policy: &ResiliencePolicy) -> Self {
        Self::with_hook(name, policy, DefaultResilienceHook)
    }

    /// Create a pipeline that reports its decisions to `hook`.
    pub fn with_hook(
        name: impl Into<Arc<str>>,
        policy: &ResiliencePolicy,
        hook: impl ResilienceHook + 'static,
    ) -> Self {
        let hook: Arc<dyn ResilienceHook> = Arc::new(hook);
        Self {
            name: name.into(),
            retry: RetryPolicy::new(policy.retry_count, policy.backoff_unit),
            timeout: policy.timeout,
            breaker: Arc::new(CircuitBreaker::new(
                policy.failure_threshold,
                policy.break_duration,
                hook.clone(),
            )),
            hook,
            cancel: None,
        }
    }

    /// Abort in-flight executions, backoff sleeps included, when `cancel`
    /// fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker_state(&self) -> BreakerSnapshot {
        self.breaker.state()
    }

    /// Run `op` under the pipeline.
    ///
    /// `op` is invoked once per attempt. When the deadline or the
    /// cancellation fires, the in-flight attempt future is dropped, so no
    /// attempt keeps running past it.
    #[tracing::instrument(skip_all, fields(call_site = %self.name))]
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::error::Error,
    {
        let bounded = async {
            match tokio::time::timeout(self.timeout, self.guarded(op)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    self.hook.on_timeout(self.timeout);
                    Err(ResilienceError::Timeout(self.timeout))
                }
            }
        };

        match &self.cancel {
            Some(cancel) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
                    result = bounded => result,
                }
            }
            None => bounded.await,
        }
    }

    async fn guarded<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::error::Error,
    {
        let permit = self
            .breaker
            .acquire()
            .map_err(|retry_after| ResilienceError::CircuitOpen { retry_after })?;

        match self.retry.run(self.hook.as_ref(), op).await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                if err.is_transient() {
                    permit.failure();
                } else {
                    permit.neutral();
                }
                Err(ResilienceError::Inner(err))
            }
        }
    }
}
