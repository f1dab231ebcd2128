//! Consumer loop driving a transport receiver.
//!
//! The loop:
//!
//! - Opens an exclusively-owned receiver on the broker
//! - Waits for a message or for cancellation
//! - Decodes each message into an [`Envelope`] and hands it to a [`Handler`]
//! - Acks on success, nacks with requeue on decode or handler failure
//! - Releases the receiver on every way out
//!
//! The loop runs until:
//! - The [`CancellationToken`] is triggered while waiting for a message
//! - Connecting, receiving or settling fails in a way the transport cannot
//!   recover from

use std::future::Future;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    envelope::{Envelope, Frame},
    error::ConsumeError,
    transport::{Broker, Receiver, TransportError},
};

/// Error type returned by message handlers.
pub type HandlerError = tower::BoxError;

/// Caller-supplied processing for consumed envelopes.
///
/// Any error sends the message back to the broker for redelivery, so
/// handlers must be idempotent.
#[async_trait::async_trait]
pub trait Handler<M>: Send + Sync {
    async fn handle(&self, envelope: Envelope<M>) -> Result<(), HandlerError>;
}

#[async_trait::async_trait]
impl<M, F, Fut> Handler<M> for F
where
    M: Send + 'static,
    F: Fn(Envelope<M>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, envelope: Envelope<M>) -> Result<(), HandlerError> {
        (self)(envelope).await
    }
}

/// Where a consumer loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connected,
    Receiving,
    Acking,
    Requeuing,
    Stopped,
}

/// Consumer loop.
///
/// Processes one message at a time, in the order the transport delivers
/// them. The current message is always settled before cancellation is
/// looked at again.
pub struct ConsumerLoop<HK = DefaultConsumerHook> {
    hook: HK,
    state: ConsumerState,
}

impl ConsumerLoop<DefaultConsumerHook> {
    /// Create a new consumer loop with the default hook implementation.
    pub fn new() -> Self {
        Self {
            hook: DefaultConsumerHook,
            state: ConsumerState::Idle,
        }
    }
}

impl Default for ConsumerLoop<DefaultConsumerHook> {
    fn default() -> Self {
        Self::new()
    }
}

enum Outcome {
    Ack(Uuid),
    Requeue(Option<Uuid>),
}

impl<HK: ConsumerHook> ConsumerLoop<HK> {
    /// Replace the consumer hook.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> ConsumerLoop<HK2> {
        ConsumerLoop {
            hook,
            state: self.state,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Run the loop against `broker` until cancellation or a fatal transport
    /// error.
    ///
    /// Returns `Ok(())` when stopped by `cancel`.
    #[tracing::instrument(skip_all, fields(destination = broker.destination()))]
    pub async fn run<B, M, H>(
        mut self,
        broker: &B,
        handler: H,
        cancel: CancellationToken,
    ) -> Result<(), ConsumeError>
    where
        B: Broker,
        M: DeserializeOwned + Send + 'static,
        H: Handler<M>,
    {
        let mut receiver = match broker.open_receiver().await {
            Ok(receiver) => receiver,
            Err(err) => {
                self.transition(ConsumerState::Stopped);
                return Err(ConsumeError::connect(err));
            }
        };
        self.transition(ConsumerState::Connected);

        let result = self.drive(&mut receiver, &handler, &cancel).await;

        if let Err(err) = receiver.close().await {
            self.hook.on_close_error(&err);
        }
        self.transition(ConsumerState::Stopped);
        result
    }

    async fn drive<R, M, H>(
        &mut self,
        receiver: &mut R,
        handler: &H,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumeError>
    where
        R: Receiver,
        M: DeserializeOwned + Send + 'static,
        H: Handler<M>,
    {
        loop {
            self.transition(ConsumerState::Receiving);
            let delivery = match receiver.receive(cancel).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => return Ok(()),
                Err(err) => return Err(ConsumeError::receive(err)),
            };

            let delivery_count = delivery.delivery_count();
            let (body, handle) = delivery.into_parts();

            let outcome = match Frame::decode::<M>(&body) {
                Ok(envelope) => {
                    let id = envelope.id();
                    self.hook.on_received(Some(id), delivery_count);
                    match handler.handle(envelope).await {
                        Ok(()) => Outcome::Ack(id),
                        Err(err) => {
                            self.hook.on_handler_error(id, err.as_ref());
                            Outcome::Requeue(Some(id))
                        }
                    }
                }
                Err(err) => {
                    self.hook.on_received(None, delivery_count);
                    self.hook.on_decode_error(&err);
                    Outcome::Requeue(None)
                }
            };

            match outcome {
                Outcome::Ack(id) => {
                    self.transition(ConsumerState::Acking);
                    match receiver.ack(handle).await {
                        Ok(()) => self.hook.on_acked(id),
                        Err(err) => self.settle_failed(err)?,
                    }
                }
                Outcome::Requeue(id) => {
                    self.transition(ConsumerState::Requeuing);
                    match receiver.nack(handle, true).await {
                        Ok(()) => self.hook.on_nacked(id, true),
                        Err(err) => self.settle_failed(err)?,
                    }
                }
            }
        }
    }

    /// A lost handle only means the broker may redeliver; anything else
    /// leaves the channel in an unknown state.
    fn settle_failed(&self, err: TransportError) -> Result<(), ConsumeError> {
        if err.is_settlement() {
            self.hook.on_settle_error(&err);
            Ok(())
        } else {
            Err(ConsumeError::settle(err))
        }
    }

    fn transition(&mut self, state: ConsumerState) {
        if self.state != state {
            self.state = state;
            self.hook.on_state(state);
        }
    }
}

/// Hook trait for observing consumer loop events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait ConsumerHook: Send + Sync {
    fn on_state(&self, state: ConsumerState);
    /// Called once per delivery; `id` is `None` when the body does not decode.
    fn on_received(&self, id: Option<Uuid>, delivery_count: u32);
    fn on_acked(&self, id: Uuid);
    /// `id` is `None` when the message could not be decoded.
    fn on_nacked(&self, id: Option<Uuid>, requeue: bool);
    fn on_decode_error(&self, error: &dyn std::error::Error);
    fn on_handler_error(&self, id: Uuid, error: &(dyn std::error::Error + Send + Sync));
    fn on_settle_error(&self, error: &dyn std::error::Error);
    fn on_close_error(&self, error: &dyn std::error::Error);
}

/// Default consumer hook implementation.
///
/// Logs loop events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_state(&self, state: ConsumerState) {
        match state {
            ConsumerState::Connected => tracing::info!("Consumer connected"),
            ConsumerState::Stopped => tracing::info!("Consumer stopped"),
            state => tracing::trace!(?state, "Consumer state changed"),
        }
    }

    fn on_received(&self, id: Option<Uuid>, delivery_count: u32) {
        match id {
            Some(id) => tracing::debug!(%id, delivery_count, "Message received"),
            None => tracing::debug!(delivery_count, "Undecodable message received"),
        }
    }

    fn on_acked(&self, id: Uuid) {
        tracing::info!(%id, "Message acknowledged");
    }

    fn on_nacked(&self, id: Option<Uuid>, requeue: bool) {
        match id {
            Some(id) => tracing::warn!(%id, requeue, "Message rejected"),
            None => tracing::warn!(requeue, "Undecodable message rejected"),
        }
    }

    fn on_decode_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Failed to decode message");
    }

    fn on_handler_error(&self, id: Uuid, error: &(dyn std::error::Error + Send + Sync)) {
        tracing::error!(%id, %error, "Handler failed");
    }

    fn on_settle_error(&self, error: &dyn std::error::Error) {
        tracing::warn!(%error, "Settlement failed, message may be redelivered");
    }

    fn on_close_error(&self, error: &dyn std::error::Error) {
        tracing::warn!(%error, "Failed to release receiver");
    }
}
