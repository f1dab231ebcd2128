#![doc = include_str!("../README.md")]

mod consumer;
pub mod config;
pub mod envelope;
pub mod error;
mod gateway;
#[cfg(feature = "http")]
pub mod http;
mod publisher;
pub mod resilience;
pub mod transport;

#[doc(inline)]
pub use envelope::{Envelope, Frame};

#[doc(inline)]
pub use error::{
    ConsumeError, ConsumeErrorKind, EncodingError, PublishError, PublishErrorKind,
};

#[doc(inline)]
pub use transport::{Broker, Receiver, Sender, SenderService, TransportError, TransportErrorKind};

#[doc(inline)]
pub use resilience::{
    CircuitState, ResilienceError, ResilienceLayer, ResiliencePipeline, ResiliencePolicy,
    Transient,
};

#[doc(inline)]
pub use publisher::{DefaultPublishHook, PublishHook, Publisher};

#[doc(inline)]
pub use consumer::{
    ConsumerHook, ConsumerLoop, ConsumerState, DefaultConsumerHook, Handler, HandlerError,
};

#[doc(inline)]
pub use gateway::Gateway;

#[doc(inline)]
pub use config::{GatewayConfig, Provider};
