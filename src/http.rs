//! HTTP API client guarded by its own resilience pipeline.
//!
//! The client applies the same Timeout -> Circuit Breaker -> Retry stack as
//! the publish path, with a breaker of its own so an unhealthy API does not
//! trip publishing and vice versa.

use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::Serialize;
use tracing_error::SpanTrace;

use crate::{
    config::HttpClientConfig,
    resilience::{BreakerSnapshot, ResilienceError, ResiliencePipeline, ResiliencePolicy, Transient},
};

/// Error from a single HTTP attempt.
#[derive(Debug)]
pub struct HttpError {
    context: SpanTrace,
    kind: HttpErrorKind,
}

/// Classification of HTTP failures.
#[derive(Debug)]
pub enum HttpErrorKind {
    /// The request could not be built, sent or read.
    Request(reqwest::Error),
    /// The server answered with a non-success status.
    Status(StatusCode),
    /// The base URL or path did not form a valid URL.
    InvalidUrl(tower::BoxError),
}

impl HttpError {
    fn new(kind: HttpErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn request(err: reqwest::Error) -> Self {
        Self::new(HttpErrorKind::Request(err))
    }

    fn status(status: StatusCode) -> Self {
        Self::new(HttpErrorKind::Status(status))
    }

    fn invalid_url(err: impl Into<tower::BoxError>) -> Self {
        Self::new(HttpErrorKind::InvalidUrl(err.into()))
    }

    pub fn kind(&self) -> &HttpErrorKind {
        &self.kind
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match &self.kind {
            HttpErrorKind::Status(status) => Some(*status),
            HttpErrorKind::Request(err) => err.status(),
            HttpErrorKind::InvalidUrl(_) => None,
        }
    }
}

impl Transient for HttpError {
    /// Network failures, timeouts, 5xx, 408 and 429.
    fn is_transient(&self) -> bool {
        match &self.kind {
            HttpErrorKind::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            HttpErrorKind::Status(status) => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            HttpErrorKind::InvalidUrl(_) => false,
        }
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            HttpErrorKind::Request(err) => writeln!(f, "HTTP request error: {err}"),
            HttpErrorKind::Status(status) => writeln!(f, "HTTP status {status}"),
            HttpErrorKind::InvalidUrl(err) => writeln!(f, "Invalid URL: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            HttpErrorKind::Request(err) => Some(err),
            HttpErrorKind::Status(_) => None,
            HttpErrorKind::InvalidUrl(err) => Some(err.as_ref()),
        }
    }
}

/// Result of an [`ApiClient`] call.
pub type ApiResult<T> = Result<T, ResilienceError<HttpError>>;

/// Typed HTTP client for one API.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: Url,
    pipeline: ResiliencePipeline,
}

impl ApiClient {
    /// Build a client from configuration, with the default breaker settings
    /// and the configured retry count and timeout.
    pub fn from_config(config: &HttpClientConfig) -> Result<Self, HttpError> {
        let policy = ResiliencePolicy {
            retry_count: config.retry_count,
            timeout: Duration::from_secs(config.timeout_secs),
            ..ResiliencePolicy::default()
        };
        Self::new(
            &config.base_url,
            Duration::from_secs(config.timeout_secs),
            &policy,
        )
    }

    /// `request_timeout` bounds each attempt; `policy.timeout` bounds the
    /// whole retry sequence.
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        policy: &ResiliencePolicy,
    ) -> Result<Self, HttpError> {
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)
        } else {
            Url::parse(&format!("{base_url}/"))
        }
        .map_err(HttpError::invalid_url)?;

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(HttpError::request)?;

        Ok(Self {
            pipeline: ResiliencePipeline::new(format!("http:{}", base_url.host_str().unwrap_or("")), policy),
            client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn breaker_state(&self) -> BreakerSnapshot {
        self.pipeline.breaker_state()
    }

    fn url(&self, path: &str) -> Result<Url, HttpError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(HttpError::invalid_url)
    }

    /// GET `path` and return the response body.
    #[tracing::instrument(skip(self))]
    pub async fn get_text(&self, path: &str) -> ApiResult<String> {
        let url = &self.url(path).map_err(ResilienceError::Inner)?;
        let client = &self.client;

        tracing::info!("Fetching data from API");
        let body = self
            .pipeline
            .execute(move || async move {
                let response = client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(HttpError::request)?;
                let status = response.status();
                if !status.is_success() {
                    return Err(HttpError::status(status));
                }
                response.text().await.map_err(HttpError::request)
            })
            .await
            .inspect_err(|error| tracing::error!(%error, "HTTP request failed"))?;

        tracing::info!("Successfully fetched data from API");
        Ok(body)
    }

    /// POST `body` as JSON to `path`. Any 2xx answer is a success.
    #[tracing::instrument(skip(self, body))]
    pub async fn post_json<T: Serialize + Sync>(&self, path: &str, body: &T) -> ApiResult<()> {
        let url = &self.url(path).map_err(ResilienceError::Inner)?;
        let client = &self.client;

        tracing::info!("Posting data to API");
        self.pipeline
            .execute(move || async move {
                let response = client
                    .post(url.clone())
                    .json(body)
                    .send()
                    .await
                    .map_err(HttpError::request)?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(HttpError::status(status))
                }
            })
            .await
            .inspect_err(|error| tracing::error!(%error, "HTTP request failed"))?;

        tracing::info!("Successfully posted data to API");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use axum::{Json, Router, extract::State, http::StatusCode as AxumStatus, routing::get, routing::post};

    use super::*;

    fn policy() -> ResiliencePolicy {
        ResiliencePolicy {
            retry_count: 3,
            backoff_unit: Duration::from_millis(5),
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }

    async fn serve(hits: Arc<AtomicU32>) -> String {
        async fn flaky(State(hits): State<Arc<AtomicU32>>) -> (AxumStatus, &'static str) {
            if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                (AxumStatus::SERVICE_UNAVAILABLE, "busy")
            } else {
                (AxumStatus::OK, "payload")
            }
        }

        async fn missing(State(hits): State<Arc<AtomicU32>>) -> AxumStatus {
            hits.fetch_add(1, Ordering::SeqCst);
            AxumStatus::NOT_FOUND
        }

        async fn create(Json(body): Json<serde_json::Value>) -> AxumStatus {
            if body.get("title").is_some() {
                AxumStatus::CREATED
            } else {
                AxumStatus::UNPROCESSABLE_ENTITY
            }
        }

        let app = Router::new()
            .route("/flaky", get(flaky))
            .route("/missing", get(missing))
            .route("/posts", post(create))
            .with_state(hits);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let client = ApiClient::new(&serve(hits.clone()).await, Duration::from_secs(2), &policy()).unwrap();

        let body = client.get_text("flaky").await.unwrap();

        assert_eq!(body, "payload");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let client = ApiClient::new(&serve(hits.clone()).await, Duration::from_secs(2), &policy()).unwrap();

        let err = client.get_text("/missing").await.unwrap_err();

        let err = err.into_inner().unwrap();
        assert_eq!(err.status_code(), Some(StatusCode::NOT_FOUND));
        assert!(!err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(client.breaker_state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn posts_json_bodies() {
        let client = ApiClient::new(
            &serve(Arc::new(AtomicU32::new(0))).await,
            Duration::from_secs(2),
            &policy(),
        )
        .unwrap();

        client
            .post_json("posts", &serde_json::json!({ "title": "hello", "userId": 1 }))
            .await
            .unwrap();
        let err = client
            .post_json("posts", &serde_json::json!({ "body": "untitled" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Inner(_)));
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ApiClient::new(
            &format!("http://{addr}"),
            Duration::from_secs(1),
            &ResiliencePolicy {
                retry_count: 1,
                ..policy()
            },
        )
        .unwrap();

        let err = client.get_text("anything").await.unwrap_err();
        assert!(err.into_inner().unwrap().is_transient());
    }

    #[test]
    fn status_classification() {
        for (status, transient) in [
            (StatusCode::INTERNAL_SERVER_ERROR, true),
            (StatusCode::BAD_GATEWAY, true),
            (StatusCode::REQUEST_TIMEOUT, true),
            (StatusCode::TOO_MANY_REQUESTS, true),
            (StatusCode::BAD_REQUEST, false),
            (StatusCode::UNAUTHORIZED, false),
        ] {
            assert_eq!(HttpError::status(status).is_transient(), transient, "{status}");
        }
    }
}
