//! Gateway configuration.
//!
//! Configuration can be deserialized from any serde format, or read from
//! `SWITCHYARD_*` environment variables with [`GatewayConfig::from_env`].
//! Every field has a default, so an empty source yields a working in-memory
//! setup.

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::resilience::ResiliencePolicy;

/// Which broker backend the gateway talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    InMemory,
    RabbitMq,
    Kafka,
    #[serde(alias = "azureservicebus")]
    ServiceBus,
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inmemory" | "memory" => Ok(Provider::InMemory),
            "rabbitmq" => Ok(Provider::RabbitMq),
            "kafka" => Ok(Provider::Kafka),
            "servicebus" | "azureservicebus" => Ok(Provider::ServiceBus),
            _ => Err(ConfigError::invalid("SWITCHYARD_PROVIDER", s)),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub provider: Provider,
    /// Broker URI, bootstrap servers or connection string, depending on the
    /// provider.
    pub connection: String,
    /// Queue or topic name.
    pub destination: String,
    /// Service Bus subscription; when set, `destination` is a topic.
    pub subscription: Option<String>,
    /// Kafka consumer group.
    pub consumer_group: String,
    pub resilience: ResilienceConfig,
    pub http: HttpClientConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider: Provider::InMemory,
            connection: String::new(),
            destination: "messages".to_string(),
            subscription: None,
            consumer_group: "switchyard".to_string(),
            resilience: ResilienceConfig::default(),
            http: HttpClientConfig::default(),
        }
    }
}

/// Retry, circuit breaker and timeout settings, in config-friendly units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry_count: u32,
    pub backoff_unit_ms: u64,
    pub failure_threshold: u32,
    pub break_duration_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            backoff_unit_ms: 1000,
            failure_threshold: 5,
            break_duration_secs: 30,
            timeout_secs: 30,
        }
    }
}

impl From<&ResilienceConfig> for ResiliencePolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            backoff_unit: Duration::from_millis(config.backoff_unit_ms),
            failure_threshold: config.failure_threshold,
            break_duration: Duration::from_secs(config.break_duration_secs),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Settings for the HTTP protected call-site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub base_url: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
    pub retry_count: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.com".to_string(),
            timeout_secs: 30,
            retry_count: 3,
        }
    }
}

impl GatewayConfig {
    /// Read configuration from `SWITCHYARD_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let resilience = ResilienceConfig::default();
        let http = HttpClientConfig::default();

        Ok(Self {
            provider: match lookup("SWITCHYARD_PROVIDER") {
                Some(value) => value.parse()?,
                None => defaults.provider,
            },
            connection: lookup("SWITCHYARD_CONNECTION").unwrap_or(defaults.connection),
            destination: lookup("SWITCHYARD_DESTINATION").unwrap_or(defaults.destination),
            subscription: lookup("SWITCHYARD_SUBSCRIPTION").filter(|s| !s.is_empty()),
            consumer_group: lookup("SWITCHYARD_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            resilience: ResilienceConfig {
                retry_count: parse(&lookup, "SWITCHYARD_RETRY_COUNT", resilience.retry_count)?,
                backoff_unit_ms: parse(
                    &lookup,
                    "SWITCHYARD_BACKOFF_UNIT_MS",
                    resilience.backoff_unit_ms,
                )?,
                failure_threshold: parse(
                    &lookup,
                    "SWITCHYARD_FAILURE_THRESHOLD",
                    resilience.failure_threshold,
                )?,
                break_duration_secs: parse(
                    &lookup,
                    "SWITCHYARD_BREAK_DURATION_SECS",
                    resilience.break_duration_secs,
                )?,
                timeout_secs: parse(&lookup, "SWITCHYARD_TIMEOUT_SECS", resilience.timeout_secs)?,
            },
            http: HttpClientConfig {
                base_url: lookup("SWITCHYARD_HTTP_BASE_URL").unwrap_or(http.base_url),
                timeout_secs: parse(&lookup, "SWITCHYARD_HTTP_TIMEOUT_SECS", http.timeout_secs)?,
                retry_count: parse(&lookup, "SWITCHYARD_HTTP_RETRY_COUNT", http.retry_count)?,
            },
        })
    }

    pub fn resilience_policy(&self) -> ResiliencePolicy {
        ResiliencePolicy::from(&self.resilience)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(key, &value)),
        None => Ok(default),
    }
}

/// A configuration value could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    key: &'static str,
    value: String,
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str) -> Self {
        Self {
            key,
            value: value.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        self.key
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value {:?} for {}", self.value, self.key)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.resilience_policy(), ResiliencePolicy::default());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("SWITCHYARD_PROVIDER", "AzureServiceBus"),
            ("SWITCHYARD_DESTINATION", "orders"),
            ("SWITCHYARD_SUBSCRIPTION", "billing"),
            ("SWITCHYARD_RETRY_COUNT", "5"),
            ("SWITCHYARD_TIMEOUT_SECS", "10"),
        ]))
        .unwrap();

        assert_eq!(config.provider, Provider::ServiceBus);
        assert_eq!(config.destination, "orders");
        assert_eq!(config.subscription.as_deref(), Some("billing"));
        let policy = config.resilience_policy();
        assert_eq!(policy.retry_count, 5);
        assert_eq!(policy.timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_values_are_reported_by_key() {
        let err = GatewayConfig::from_lookup(lookup(&[("SWITCHYARD_RETRY_COUNT", "many")]))
            .unwrap_err();
        assert_eq!(err.key(), "SWITCHYARD_RETRY_COUNT");

        let err = GatewayConfig::from_lookup(lookup(&[("SWITCHYARD_PROVIDER", "smtp")])).unwrap_err();
        assert_eq!(err.key(), "SWITCHYARD_PROVIDER");
    }

    #[test]
    fn deserializes_partial_json() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{ "provider": "kafka", "resilience": { "retry_count": 1 } }"#,
        )
        .unwrap();

        assert_eq!(config.provider, Provider::Kafka);
        assert_eq!(config.resilience.retry_count, 1);
        assert_eq!(config.resilience.failure_threshold, 5);
        assert_eq!(config.destination, "messages");
    }
}
