//! Transport-independent message container and its wire codec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::EncodingError;

/// Message container travelling through the gateway.
///
/// `Envelope` bundles a payload with the identity and creation time assigned
/// by the producer. It is a value: once built, none of its fields change, and
/// the consumer side rebuilds exactly what the producer sent.
///
/// ## Example
///
/// ```rust
/// use switchyard::Envelope;
///
/// let envelope = Envelope::new("user.created");
/// assert_eq!(*envelope.payload(), "user.created");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    id: Uuid,
    payload: M,
    timestamp: DateTime<Utc>,
}

impl<M> Envelope<M> {
    /// Wrap a payload, assigning a fresh id and the current time.
    pub fn new(payload: M) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Rebuild an envelope from already-assigned parts.
    pub fn from_parts(id: Uuid, payload: M, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            timestamp,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &M {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Consume the envelope, returning its payload.
    pub fn into_payload(self) -> M {
        self.payload
    }
}

impl<M> From<M> for Envelope<M> {
    fn from(payload: M) -> Self {
        Envelope::new(payload)
    }
}

/// Content type of every encoded [`Frame`].
pub const CONTENT_TYPE: &str = "application/json";

/// Wire-ready form of an [`Envelope`].
///
/// Adapters only ever see frames: the message id (used as message id, key or
/// duplicate-detection id depending on the broker) and the encoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    id: Uuid,
    body: Vec<u8>,
}

impl Frame {
    /// Serialize an envelope into its JSON wire form.
    pub fn encode<M: Serialize>(envelope: &Envelope<M>) -> Result<Self, EncodingError> {
        let body = serde_json::to_vec(envelope).map_err(EncodingError::new)?;
        Ok(Self {
            id: envelope.id,
            body,
        })
    }

    /// Rebuild the envelope carried by a received body.
    pub fn decode<M: DeserializeOwned>(body: &[u8]) -> Result<Envelope<M>, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }
}
