//! Transport abstractions and broker backends.
//!
//! This module defines the capability set every broker backend provides to
//! the gateway: a single-attempt [`Sender`], a cancellable [`Receiver`] with
//! explicit settlement, and a [`Broker`] that opens exclusively-owned
//! instances of both.
//!
//! Sending is exposed to the rest of the crate as a Tower `Service` through
//! [`SenderService`], so retry, circuit breaking and timeouts compose as
//! ordinary layers while the backends stay policy-free.
//!
//! ## Backends
//!
//! - [`InMemoryBroker`]: always available, used for tests and local pipelines
//! - [`rabbitmq`]: queue semantics, per-message ack with a requeue flag
//! - [`kafka`]: log semantics, offsets are committed instead of acked
//! - [`servicebus`]: bus semantics, peek-lock tokens are completed or abandoned

mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

#[cfg(feature = "servicebus")]
pub mod servicebus;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing_error::SpanTrace;

use crate::{envelope::Frame, resilience::Transient};

pub use inmemory::{InMemoryBroker, InMemoryHandle, InMemoryReceiver, InMemorySender};

/// Error returned by transport operations.
///
/// Each error captures:
/// - The failure kind, which drives retry and loop-termination decisions
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The broker could not be reached or the channel dropped. Transient.
    Connection(tower::BoxError),
    /// The broker refused the request; repeating it will not help.
    Rejected(tower::BoxError),
    /// A delivery handle could not be resolved (lock lost, unknown tag,
    /// already settled). The message may be redelivered.
    Settlement(tower::BoxError),
    /// A native message could not be turned into a frame.
    Serde(tower::BoxError),
}

impl TransportError {
    /// Create a connectivity-related transport error.
    pub fn connection(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Connection(err.into()))
    }

    /// Create an error for a request the broker permanently refused.
    pub fn rejected(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Rejected(err.into()))
    }

    /// Create an error for a delivery handle that could not be resolved.
    pub fn settlement(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Settlement(err.into()))
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Serde(err.into()))
    }

    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    pub fn is_settlement(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Settlement(_))
    }
}

impl Transient for TransportError {
    fn is_transient(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Connection(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Connection(err) => writeln!(f, "Connection error: {err}"),
            TransportErrorKind::Rejected(err) => writeln!(f, "Rejected by broker: {err}"),
            TransportErrorKind::Settlement(err) => writeln!(f, "Settlement error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Connection(err)
            | TransportErrorKind::Rejected(err)
            | TransportErrorKind::Settlement(err)
            | TransportErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}

/// A message handed out by a [`Receiver`], paired with the handle needed to
/// settle it.
#[derive(Debug)]
pub struct Delivery<H> {
    body: Vec<u8>,
    handle: H,
    delivery_count: u32,
}

impl<H> Delivery<H> {
    pub fn new(body: Vec<u8>, handle: H, delivery_count: u32) -> Self {
        Self {
            body,
            handle,
            delivery_count,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// How many times the broker has handed this message out, starting at 1.
    ///
    /// Backends that do not track it report 1 for first deliveries and 2 for
    /// anything flagged as redelivered.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn into_parts(self) -> (Vec<u8>, H) {
        (self.body, self.handle)
    }
}

/// Trait implemented by concrete sender backends.
///
/// A sender performs exactly one network write per call. Retrying is the job
/// of the layers stacked above [`SenderService`].
#[async_trait::async_trait]
pub trait Sender: Send {
    /// Send one frame to the configured destination.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Flush and release whatever the sender holds open.
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Trait implemented by concrete receiver backends.
///
/// Handles are moved into [`ack`](Receiver::ack) and [`nack`](Receiver::nack),
/// so each received message is settled at most once.
#[async_trait::async_trait]
pub trait Receiver: Send {
    /// Backend-specific delivery handle (delivery tag, offset, lock token).
    type Handle: Send + 'static;

    /// Wait until a message arrives or `cancel` fires.
    ///
    /// Returns `Ok(None)` on cancellation.
    async fn receive(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery<Self::Handle>>, TransportError>;

    /// Mark the message as processed.
    async fn ack(&mut self, handle: Self::Handle) -> Result<(), TransportError>;

    /// Reject the message, asking for redelivery when `requeue` is set.
    async fn nack(&mut self, handle: Self::Handle, requeue: bool) -> Result<(), TransportError>;

    /// Release the channel/session and the connection under it.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for the transport resources of one destination.
///
/// Every call opens a fresh sender or receiver which the caller owns
/// exclusively.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    type Sender: Sender + Clone + Sync + 'static;
    type Receiver: Receiver + 'static;

    /// Human readable destination name, used in log fields.
    fn destination(&self) -> &str;

    async fn open_sender(&self) -> Result<Self::Sender, TransportError>;

    async fn open_receiver(&self) -> Result<Self::Receiver, TransportError>;
}

/// Tower service adapter for a [`Sender`] backend.
///
/// This type bridges the [`Sender`] trait with Tower’s `Service` abstraction.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }

    pub fn get_ref(&self) -> &D {
        &self.sender
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<Frame> for SenderService<D>
where
    D: Sender + Clone + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Frame) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            let id = req.id();
            tracing::debug!(message_id = %id, "Send attempt");
            sender
                .send(req)
                .await
                .inspect_err(|error| tracing::warn!(message_id = %id, %error, "Send attempt failed"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn only_connection_errors_are_transient() {
        assert!(TransportError::connection("broker down").is_transient());
        assert!(!TransportError::rejected("access refused").is_transient());
        assert!(!TransportError::settlement("lock lost").is_transient());
        assert!(!TransportError::serde("empty payload").is_transient());
    }

    #[test]
    fn source_points_at_the_backend_error() {
        let err = TransportError::rejected("queue not found");
        assert_eq!(err.source().unwrap().to_string(), "queue not found");
        assert!(err.to_string().starts_with("Rejected by broker: queue not found"));
    }
}
