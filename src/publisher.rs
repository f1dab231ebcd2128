//! Publishing envelopes through a transport service stack.
//!
//! A [`Publisher`] owns a Tower service stack whose bottom is a
//! [`SenderService`]. Encoding happens once per publish; the encoded
//! [`Frame`] is then replayed by whatever layers sit above the sender, which
//! is how retries issue one network write per attempt.

use serde::Serialize;
use tower::{Layer, Service, ServiceExt};
use uuid::Uuid;

use crate::{
    envelope::{Envelope, Frame},
    error::PublishError,
    transport::{Sender, SenderService},
};

/// Envelope publisher.
///
/// Generic parameters:
/// - `S`: Tower service that accepts [`Frame`]s
/// - `HK`: Hook implementation for publish events
#[derive(Clone)]
pub struct Publisher<S, HK = DefaultPublishHook> {
    service: S,
    hook: HK,
}

impl<D> Publisher<SenderService<D>, DefaultPublishHook>
where
    D: Sender + Clone + 'static,
{
    /// Create a publisher that sends straight through `sender`, one attempt
    /// per publish.
    pub fn new(sender: D) -> Self {
        Self {
            service: SenderService::new(sender),
            hook: DefaultPublishHook,
        }
    }
}

impl<S, HK> Publisher<S, HK> {
    /// Wrap the current service stack in `layer`.
    ///
    /// ```ignore
    /// let publisher = Publisher::new(sender)
    ///     .layer(ResilienceLayer::new(pipeline));
    /// ```
    pub fn layer<L>(self, layer: L) -> Publisher<L::Service, HK>
    where
        L: Layer<S>,
    {
        Publisher {
            service: layer.layer(self.service),
            hook: self.hook,
        }
    }

    /// Replace the publish hook while keeping the service stack unchanged.
    pub fn with_hook<HK2: PublishHook>(self, hook: HK2) -> Publisher<S, HK2> {
        Publisher {
            service: self.service,
            hook,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.service
    }
}

impl<S, HK> Publisher<S, HK>
where
    S: Service<Frame, Response = ()> + Clone + Send + 'static,
    S::Error: Into<PublishError>,
    S::Future: Send,
    HK: PublishHook,
{
    /// Encode `envelope` and send it through the service stack.
    ///
    /// Encoding failures are returned before anything touches the
    /// transport.
    #[tracing::instrument(skip_all, fields(message_id = %envelope.id()))]
    pub async fn publish<M: Serialize>(&self, envelope: &Envelope<M>) -> Result<(), PublishError> {
        let id = envelope.id();
        let frame = match Frame::encode(envelope) {
            Ok(frame) => frame,
            Err(err) => {
                let err = PublishError::from(err);
                self.hook.on_publish_error(id, &err);
                return Err(err);
            }
        };

        self.hook.on_publish(id);
        match self.service.clone().oneshot(frame).await {
            Ok(()) => {
                self.hook.on_published(id);
                Ok(())
            }
            Err(err) => {
                let err = err.into();
                self.hook.on_publish_error(id, &err);
                Err(err)
            }
        }
    }
}

/// Hook trait for observing publishes.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Individual send attempts are logged by the transport layer; these events
/// cover the publish as a whole.
pub trait PublishHook: Send + Sync {
    fn on_publish(&self, id: Uuid);
    fn on_published(&self, id: Uuid);
    fn on_publish_error(&self, id: Uuid, error: &PublishError);
}

/// Default publish hook implementation.
///
/// Logs publish events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPublishHook;

impl PublishHook for DefaultPublishHook {
    fn on_publish(&self, id: Uuid) {
        tracing::debug!(%id, "Publishing message");
    }

    fn on_published(&self, id: Uuid) {
        tracing::info!(%id, "Message published");
    }

    fn on_publish_error(&self, id: Uuid, error: &PublishError) {
        tracing::error!(%id, %error, "Failed to publish message");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{
        resilience::{ResilienceLayer, ResiliencePipeline, ResiliencePolicy},
        transport::{Broker, InMemoryBroker},
    };

    #[derive(Default)]
    struct Recorded(Mutex<Vec<&'static str>>);

    impl PublishHook for Arc<Recorded> {
        fn on_publish(&self, _id: Uuid) {
            self.0.lock().unwrap().push("publish");
        }
        fn on_published(&self, _id: Uuid) {
            self.0.lock().unwrap().push("published");
        }
        fn on_publish_error(&self, _id: Uuid, _error: &PublishError) {
            self.0.lock().unwrap().push("error");
        }
    }

    async fn resilient(
        broker: &InMemoryBroker,
        policy: &ResiliencePolicy,
    ) -> Publisher<crate::resilience::ResilienceService<SenderService<crate::transport::InMemorySender>>>
    {
        let sender = broker.open_sender().await.unwrap();
        Publisher::new(sender).layer(ResilienceLayer::new(ResiliencePipeline::new("publish", policy)))
    }

    #[tokio::test]
    async fn publish_without_layers_is_a_single_attempt() {
        let broker = InMemoryBroker::new("orders");
        broker.fail_next_sends(1);
        let publisher = Publisher::new(broker.open_sender().await.unwrap());

        let err = publisher.publish(&Envelope::new("x")).await.unwrap_err();
        assert!(!err.is_circuit_open());
        assert_eq!(broker.send_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let broker = InMemoryBroker::new("orders");
        broker.fail_next_sends(2);
        let publisher = resilient(&broker, &ResiliencePolicy::default()).await;
        let envelope = Envelope::new(serde_json::json!({ "sku": 7 }));

        publisher.publish(&envelope).await.unwrap();

        assert_eq!(broker.send_attempts(), 3);
        let sent = broker.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), envelope.id());
    }

    #[tokio::test(start_paused = true)]
    async fn encoding_failure_never_reaches_the_transport() {
        struct Unserializable;

        impl Serialize for Unserializable {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("nope"))
            }
        }

        let broker = InMemoryBroker::new("orders");
        let events = Arc::new(Recorded::default());
        let publisher = resilient(&broker, &ResiliencePolicy::default())
            .await
            .with_hook(events.clone());

        let err = publisher.publish(&Envelope::new(Unserializable)).await.unwrap_err();

        assert!(err.is_encoding());
        assert_eq!(broker.send_attempts(), 0);
        assert_eq!(*events.0.lock().unwrap(), vec!["error"]);
    }

    #[tokio::test(start_paused = true)]
    async fn hook_sees_publish_then_outcome() {
        let broker = InMemoryBroker::new("orders");
        let events = Arc::new(Recorded::default());
        let policy = ResiliencePolicy {
            retry_count: 1,
            timeout: Duration::from_secs(5),
            ..ResiliencePolicy::default()
        };
        let publisher = resilient(&broker, &policy).await.with_hook(events.clone());

        publisher.publish(&Envelope::new(1)).await.unwrap();
        broker.fail_next_sends(1);
        publisher.publish(&Envelope::new(2)).await.unwrap_err();

        assert_eq!(
            *events.0.lock().unwrap(),
            vec!["publish", "published", "publish", "error"]
        );
    }
}
