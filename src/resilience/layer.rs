use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Layer, Service, ServiceExt};

use super::{ResilienceError, ResiliencePipeline, Transient};

/// Tower `Service` wrapper that runs every call through a
/// [`ResiliencePipeline`].
///
/// Each retry attempt calls a fresh clone of the inner service with a clone
/// of the request, so the inner service must be cheap to clone and the
/// request must be replayable.
#[derive(Clone)]
pub struct ResilienceService<S> {
    inner: S,
    pipeline: ResiliencePipeline,
}

impl<S> ResilienceService<S> {
    pub fn pipeline(&self) -> &ResiliencePipeline {
        &self.pipeline
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, R> Service<R> for ResilienceService<S>
where
    R: Clone + Send + 'static,
    S: Service<R> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Transient + std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    /// Readiness of the inner service is awaited per attempt, inside the
    /// pipeline, so that waiting for it is also bounded by the timeout.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let inner = self.inner.clone();
        let pipeline = self.pipeline.clone();

        Box::pin(async move {
            pipeline
                .execute(move || inner.clone().oneshot(req.clone()))
                .await
        })
    }
}

/// Tower `Layer` that applies [`ResilienceService`] to a service stack.
///
/// All services produced by one layer share the layer's pipeline, and with it
/// one circuit breaker.
#[derive(Clone)]
pub struct ResilienceLayer {
    pipeline: ResiliencePipeline,
}

impl ResilienceLayer {
    pub fn new(pipeline: ResiliencePipeline) -> Self {
        Self { pipeline }
    }
}

impl<S> Layer<S> for ResilienceLayer {
    type Service = ResilienceService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ResilienceService {
            inner: service,
            pipeline: self.pipeline.clone(),
        }
    }
}
