//! Errors surfaced by the gateway's public operations.
//!
//! Every error captures a [`SpanTrace`] at construction so a failure logged
//! far from where it happened still shows which publish or consume span it
//! came from.

use std::time::Duration;

use tracing_error::SpanTrace;

use crate::{resilience::ResilienceError, transport::TransportError};

/// A payload could not be serialized. Never retried.
#[derive(Debug)]
pub struct EncodingError {
    context: SpanTrace,
    source: serde_json::Error,
}

impl EncodingError {
    pub(crate) fn new(source: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            source,
        }
    }
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Encoding error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for EncodingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Error returned by [`Publisher::publish`](crate::Publisher::publish).
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Classification of publish failures.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// The payload could not be serialized.
    Encoding(EncodingError),
    /// The transport failed; transient failures have already been retried.
    Transport(TransportError),
    /// The circuit breaker rejected the call without touching the transport.
    CircuitOpen { retry_after: Duration },
    /// The whole attempt sequence exceeded its deadline.
    Timeout(Duration),
    /// The gateway was shut down while the publish was in flight.
    Cancelled,
}

impl PublishError {
    fn new(kind: PublishErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.kind, PublishErrorKind::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, PublishErrorKind::Timeout(_))
    }

    pub fn is_encoding(&self) -> bool {
        matches!(self.kind, PublishErrorKind::Encoding(_))
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::Encoding(err) => writeln!(f, "{err}"),
            PublishErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
            PublishErrorKind::CircuitOpen { retry_after } => {
                writeln!(f, "Circuit open, retry after {retry_after:?}")
            }
            PublishErrorKind::Timeout(limit) => writeln!(f, "Publish timed out after {limit:?}"),
            PublishErrorKind::Cancelled => writeln!(f, "Publish cancelled"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::Encoding(err) => Some(err),
            PublishErrorKind::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<EncodingError> for PublishError {
    fn from(err: EncodingError) -> Self {
        Self::new(PublishErrorKind::Encoding(err))
    }
}

impl From<TransportError> for PublishError {
    fn from(err: TransportError) -> Self {
        Self::new(PublishErrorKind::Transport(err))
    }
}

impl From<ResilienceError<TransportError>> for PublishError {
    fn from(err: ResilienceError<TransportError>) -> Self {
        let kind = match err {
            ResilienceError::Inner(err) => PublishErrorKind::Transport(err),
            ResilienceError::CircuitOpen { retry_after } => {
                PublishErrorKind::CircuitOpen { retry_after }
            }
            ResilienceError::Timeout(limit) => PublishErrorKind::Timeout(limit),
            ResilienceError::Cancelled => PublishErrorKind::Cancelled,
        };
        Self::new(kind)
    }
}

/// Error that terminated a consumer loop.
///
/// Handler and decode failures never show up here; they are nacked and the
/// loop keeps going.
#[derive(Debug)]
pub struct ConsumeError {
    context: SpanTrace,
    kind: ConsumeErrorKind,
}

/// Classification of consumer loop failures.
#[derive(Debug)]
pub enum ConsumeErrorKind {
    /// The channel/session could not be established.
    Connect(TransportError),
    /// The transport failed while waiting for a message.
    Receive(TransportError),
    /// An ack or nack failed in a way that leaves the channel unusable.
    Settle(TransportError),
}

impl ConsumeError {
    pub(crate) fn connect(err: TransportError) -> Self {
        Self::new(ConsumeErrorKind::Connect(err))
    }

    pub(crate) fn receive(err: TransportError) -> Self {
        Self::new(ConsumeErrorKind::Receive(err))
    }

    pub(crate) fn settle(err: TransportError) -> Self {
        Self::new(ConsumeErrorKind::Settle(err))
    }

    fn new(kind: ConsumeErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ConsumeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumeErrorKind::Connect(err) => writeln!(f, "Connect error: {err}"),
            ConsumeErrorKind::Receive(err) => writeln!(f, "Receive error: {err}"),
            ConsumeErrorKind::Settle(err) => writeln!(f, "Settle error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumeErrorKind::Connect(err)
            | ConsumeErrorKind::Receive(err)
            | ConsumeErrorKind::Settle(err) => Some(err),
        }
    }
}
