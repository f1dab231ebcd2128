//! Azure Service Bus backend over the REST API.
//!
//! Bus semantics: messages are received under a peek-lock. Completing the
//! lock removes the message, abandoning it makes the message immediately
//! available again, and the service dead-letters it once its max delivery
//! count is reached. Discarding completes the message: the gateway never
//! drops work into the dead-letter queue on its own.
//!
//! Requests are authorized with a Shared Access Signature derived from the
//! namespace key, so no Azure SDK is involved.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use reqwest::{StatusCode, header::AUTHORIZATION};
use serde::Deserialize;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    envelope::Frame,
    transport::{Broker, Delivery, Receiver, Sender, TransportError},
};

const BROKER_PROPERTIES: &str = "BrokerProperties";

/// Namespace credentials used to sign requests.
struct Credentials {
    key_name: String,
    key: String,
    token_ttl: Duration,
}

impl Credentials {
    /// Build a `SharedAccessSignature` token for `resource`.
    fn token(&self, resource: &Url) -> Result<String, TransportError> {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_add(self.token_ttl)
            .as_secs();
        sas_token(
            resource.as_str(),
            &self.key_name,
            self.key.as_bytes(),
            expiry,
        )
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn sas_token(
    resource: &str,
    key_name: &str,
    key: &[u8],
    expiry: u64,
) -> Result<String, TransportError> {
    let resource = encode(resource);
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| TransportError::rejected("invalid shared access key"))?;
    mac.update(format!("{resource}\n{expiry}").as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={resource}&sig={}&se={expiry}&skn={}",
        encode(&signature),
        encode(key_name)
    ))
}

/// Service Bus broker for a queue, or a topic and one of its subscriptions.
#[derive(Clone)]
pub struct ServiceBus {
    client: reqwest::Client,
    credentials: Arc<Credentials>,
    namespace: Url,
    entity: String,
    subscription: Option<String>,
    receive_wait: Duration,
}

impl ServiceBus {
    /// `endpoint` is the namespace URL, such as
    /// `https://example.servicebus.windows.net/`.
    pub fn new(
        endpoint: &str,
        entity: impl Into<String>,
        key_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let namespace = if endpoint.ends_with('/') {
            Url::parse(endpoint)
        } else {
            Url::parse(&format!("{endpoint}/"))
        }
        .map_err(TransportError::rejected)?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(TransportError::rejected)?;

        Ok(Self {
            client,
            credentials: Arc::new(Credentials {
                key_name: key_name.into(),
                key: key.into(),
                token_ttl: Duration::from_secs(3600),
            }),
            namespace,
            entity: entity.into(),
            subscription: None,
            receive_wait: Duration::from_secs(60),
        })
    }

    /// Parse a connection string of the form
    /// `Endpoint=sb://<ns>.servicebus.windows.net/;SharedAccessKeyName=<name>;SharedAccessKey=<key>[;EntityPath=<entity>]`.
    ///
    /// `entity` is required when the connection string has no `EntityPath`.
    pub fn from_connection_string(
        connection: &str,
        entity: Option<&str>,
    ) -> Result<Self, TransportError> {
        let parts = ConnectionString::parse(connection)?;
        let entity = entity
            .map(str::to_string)
            .or(parts.entity_path)
            .ok_or_else(|| TransportError::rejected("no entity path in connection string"))?;

        let endpoint = match parts.endpoint.strip_prefix("sb://") {
            Some(rest) => format!("https://{rest}"),
            None => parts.endpoint,
        };
        Self::new(&endpoint, entity, parts.key_name, parts.key)
    }

    /// Receive from `subscription` of the topic instead of from a queue.
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    /// Server-side long-poll duration of one receive request. Default 60s.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait.max(Duration::from_secs(1));
        self
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.namespace.join(path).map_err(TransportError::rejected)
    }

    /// Path of the entity messages are received from.
    fn source_path(&self) -> String {
        match &self.subscription {
            Some(subscription) => format!("{}/subscriptions/{subscription}", self.entity),
            None => self.entity.clone(),
        }
    }
}

#[async_trait]
impl Broker for ServiceBus {
    type Sender = ServiceBusSender;
    type Receiver = ServiceBusReceiver;

    fn destination(&self) -> &str {
        &self.entity
    }

    async fn open_sender(&self) -> Result<Self::Sender, TransportError> {
        Ok(ServiceBusSender {
            client: self.client.clone(),
            credentials: self.credentials.clone(),
            namespace: self.namespace.clone(),
            send_url: self.url(&format!("{}/messages", self.entity))?,
        })
    }

    async fn open_receiver(&self) -> Result<Self::Receiver, TransportError> {
        let source = self.source_path();
        let mut receive_url = self.url(&format!("{source}/messages/head"))?;
        receive_url
            .query_pairs_mut()
            .append_pair("timeout", &self.receive_wait.as_secs().to_string());

        Ok(ServiceBusReceiver {
            client: self.client.clone(),
            credentials: self.credentials.clone(),
            namespace: self.namespace.clone(),
            receive_url,
            settle_base: self.url(&format!("{source}/messages/"))?,
        })
    }
}

/// Service Bus transport sender.
#[derive(Clone)]
pub struct ServiceBusSender {
    client: reqwest::Client,
    credentials: Arc<Credentials>,
    namespace: Url,
    send_url: Url,
}

#[async_trait]
impl Sender for ServiceBusSender {
    #[tracing::instrument(skip_all, fields(message_id = %frame.id()))]
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let properties = serde_json::json!({ "MessageId": frame.id() }).to_string();
        let response = self
            .client
            .post(self.send_url.clone())
            .header(AUTHORIZATION, self.credentials.token(&self.namespace)?)
            .header(BROKER_PROPERTIES, properties)
            .header(reqwest::header::CONTENT_TYPE, frame.content_type())
            .body(frame.body().to_vec())
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(status_error(status)),
        }
    }
}

/// Peek-lock of one received message.
#[derive(Debug)]
pub struct ServiceBusHandle {
    settle_url: Url,
    sequence_number: i64,
}

impl ServiceBusHandle {
    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    lock_token: String,
    sequence_number: i64,
    #[serde(default = "first_delivery")]
    delivery_count: u32,
}

fn first_delivery() -> u32 {
    1
}

/// Service Bus receiver.
///
/// A receive that is cancelled mid-request may leave a message locked on the
/// server; it becomes available again when the lock expires.
pub struct ServiceBusReceiver {
    client: reqwest::Client,
    credentials: Arc<Credentials>,
    namespace: Url,
    receive_url: Url,
    settle_base: Url,
}

impl ServiceBusReceiver {
    async fn settle(&self, request: reqwest::RequestBuilder) -> Result<(), TransportError> {
        let response = request
            .header(AUTHORIZATION, self.credentials.token(&self.namespace)?)
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(TransportError::settlement(
                "message lock expired or was already released",
            )),
            status => Err(status_error(status)),
        }
    }
}

#[async_trait]
impl Receiver for ServiceBusReceiver {
    type Handle = ServiceBusHandle;

    async fn receive(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery<Self::Handle>>, TransportError> {
        loop {
            let token = self.credentials.token(&self.namespace)?;
            let request = self
                .client
                .post(self.receive_url.clone())
                .header(AUTHORIZATION, token)
                .header(reqwest::header::CONTENT_LENGTH, 0)
                .send();

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                response = request => response.map_err(request_error)?,
            };

            match response.status() {
                StatusCode::CREATED | StatusCode::OK => {}
                // the long poll elapsed without a message
                StatusCode::NO_CONTENT => continue,
                status => return Err(status_error(status)),
            }

            let properties: BrokerProperties = response
                .headers()
                .get(BROKER_PROPERTIES)
                .ok_or_else(|| TransportError::serde("response has no BrokerProperties header"))
                .and_then(|value| {
                    serde_json::from_slice(value.as_bytes()).map_err(TransportError::serde)
                })?;

            let settle_url = self
                .settle_base
                .join(&format!(
                    "{}/{}",
                    properties.sequence_number, properties.lock_token
                ))
                .map_err(TransportError::serde)?;
            let body = response.bytes().await.map_err(request_error)?;

            let handle = ServiceBusHandle {
                settle_url,
                sequence_number: properties.sequence_number,
            };
            return Ok(Some(Delivery::new(
                body.to_vec(),
                handle,
                properties.delivery_count,
            )));
        }
    }

    /// Complete the message.
    async fn ack(&mut self, handle: Self::Handle) -> Result<(), TransportError> {
        self.settle(self.client.delete(handle.settle_url)).await
    }

    /// Abandon the lock when requeuing, complete it when discarding.
    async fn nack(&mut self, handle: Self::Handle, requeue: bool) -> Result<(), TransportError> {
        let request = if requeue {
            self.client
                .put(handle.settle_url)
                .header(reqwest::header::CONTENT_LENGTH, 0)
        } else {
            self.client.delete(handle.settle_url)
        };
        self.settle(request).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn request_error(err: reqwest::Error) -> TransportError {
    if err.is_builder() {
        TransportError::rejected(err)
    } else {
        TransportError::connection(err)
    }
}

/// 5xx, 408 and 429 are transient; other statuses are refusals.
fn status_error(status: StatusCode) -> TransportError {
    let message = format!("service bus answered {status}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        TransportError::connection(message)
    } else {
        TransportError::rejected(message)
    }
}

struct ConnectionString {
    endpoint: String,
    key_name: String,
    key: String,
    entity_path: Option<String>,
}

impl ConnectionString {
    fn parse(connection: &str) -> Result<Self, TransportError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for part in connection.split(';').filter(|part| !part.trim().is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                TransportError::rejected(format!("malformed connection string segment {part:?}"))
            })?;
            let value = value.trim().to_string();
            match name.trim() {
                "Endpoint" => endpoint = Some(value),
                "SharedAccessKeyName" => key_name = Some(value),
                "SharedAccessKey" => key = Some(value),
                "EntityPath" => entity_path = Some(value),
                _ => {}
            }
        }

        let missing = |field: &str| TransportError::rejected(format!("connection string has no {field}"));
        Ok(Self {
            endpoint: endpoint.ok_or_else(|| missing("Endpoint"))?,
            key_name: key_name.ok_or_else(|| missing("SharedAccessKeyName"))?,
            key: key.ok_or_else(|| missing("SharedAccessKey"))?,
            entity_path,
        })
    }
}
