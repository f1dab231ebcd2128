//! Composition root binding one broker to a publisher and consumer loops.

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::{
    consumer::{ConsumerLoop, Handler},
    envelope::Envelope,
    error::{ConsumeError, PublishError},
    publisher::Publisher,
    resilience::{
        BreakerSnapshot, ResilienceLayer, ResiliencePipeline, ResiliencePolicy, ResilienceService,
    },
    transport::{Broker, Sender, SenderService, TransportError},
};

type PublishStack<B> = ResilienceService<SenderService<<B as Broker>::Sender>>;

/// Messaging gateway over one broker destination.
///
/// Publishes go through a single resilience pipeline, so every publish shares
/// one circuit breaker. Consumer loops each open their own receiver and stop
/// when the gateway's cancellation token fires.
pub struct Gateway<B: Broker> {
    broker: B,
    sender: B::Sender,
    publisher: Publisher<PublishStack<B>>,
    pipeline: ResiliencePipeline,
    cancel: CancellationToken,
}

impl<B: Broker> Gateway<B> {
    /// Open the publishing side of `broker` and wrap it in a pipeline built
    /// from `policy`.
    ///
    /// `cancel` stops consumer loops and aborts in-flight publishes.
    #[tracing::instrument(skip_all, fields(destination = broker.destination()))]
    pub async fn connect(
        broker: B,
        policy: &ResiliencePolicy,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let sender = broker.open_sender().await?;
        let pipeline = ResiliencePipeline::new(format!("publish:{}", broker.destination()), policy)
            .with_cancellation(cancel.clone());
        let publisher =
            Publisher::new(sender.clone()).layer(ResilienceLayer::new(pipeline.clone()));

        tracing::info!("Gateway connected");
        Ok(Self {
            broker,
            sender,
            publisher,
            pipeline,
            cancel,
        })
    }

    /// Publish `envelope` with retry, circuit breaking and timeout.
    pub async fn publish<M: Serialize>(&self, envelope: &Envelope<M>) -> Result<(), PublishError> {
        self.publisher.publish(envelope).await
    }

    /// Run a consumer loop until the gateway's token is cancelled.
    ///
    /// Each call opens its own receiver; the loop stops when the gateway's
    /// token is cancelled.
    pub async fn consume<M, H>(&self, handler: H) -> Result<(), ConsumeError>
    where
        M: DeserializeOwned + Send + 'static,
        H: Handler<M>,
    {
        ConsumerLoop::new()
            .run(&self.broker, handler, self.cancel.child_token())
            .await
    }

    /// Like [`consume`](Self::consume) with a caller-provided loop, for custom
    /// hooks.
    pub async fn consume_with<M, H, HK>(
        &self,
        consumer: ConsumerLoop<HK>,
        handler: H,
    ) -> Result<(), ConsumeError>
    where
        M: DeserializeOwned + Send + 'static,
        H: Handler<M>,
        HK: crate::consumer::ConsumerHook,
    {
        consumer
            .run(&self.broker, handler, self.cancel.child_token())
            .await
    }

    /// Publish-path circuit breaker state, for health reporting.
    pub fn breaker_state(&self) -> BreakerSnapshot {
        self.pipeline.breaker_state()
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the gateway token and release the publishing side.
    ///
    /// Consumer loops borrow the gateway, so they must have returned before
    /// this can be called. Stop them through
    /// [`cancellation_token`](Self::cancellation_token) first.
    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        self.cancel.cancel();
        let result = self.sender.close().await;
        tracing::info!("Gateway shut down");
        result
    }
}
