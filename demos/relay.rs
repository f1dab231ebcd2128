use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use switchyard::{
    Broker, Envelope, Gateway, GatewayConfig, HandlerError, Provider, transport::InMemoryBroker,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order: u32,
    sku: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let config = GatewayConfig::from_env()?;

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_signal.cancel();
        }
    });

    match config.provider {
        Provider::InMemory => relay(InMemoryBroker::new(&config.destination), &config, cancel).await,
        #[cfg(feature = "rabbitmq")]
        Provider::RabbitMq => {
            let broker = switchyard::transport::rabbitmq::RabbitMq::new(
                &config.connection,
                &config.destination,
            );
            relay(broker, &config, cancel).await
        }
        #[cfg(feature = "kafka")]
        Provider::Kafka => {
            let broker = switchyard::transport::kafka::Kafka::new(
                &config.connection,
                &config.destination,
                &config.consumer_group,
            );
            relay(broker, &config, cancel).await
        }
        #[cfg(feature = "servicebus")]
        Provider::ServiceBus => {
            let mut broker = switchyard::transport::servicebus::ServiceBus::from_connection_string(
                &config.connection,
                Some(config.destination.as_str()),
            )?;
            if let Some(subscription) = &config.subscription {
                broker = broker.with_subscription(subscription);
            }
            relay(broker, &config, cancel).await
        }
        #[allow(unreachable_patterns)]
        provider => Err(format!("{provider:?} support is not compiled in").into()),
    }
}

/// Publish an order every 200ms and consume them back, failing every fifth
/// delivery so the requeue path shows up in the logs.
async fn relay<B>(
    broker: B,
    config: &GatewayConfig,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    B: Broker + 'static,
    B::Sender: Sync,
{
    let gateway = Arc::new(Gateway::connect(broker, &config.resilience_policy(), cancel.clone()).await?);

    let publisher = {
        let gateway = gateway.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut order = 0;
            while !cancel.is_cancelled() {
                let envelope = Envelope::new(OrderPlaced {
                    order,
                    sku: format!("SKU-{}", order % 7),
                });
                if let Err(error) = gateway.publish(&envelope).await {
                    tracing::error!(%error, "Publish failed");
                }
                order += 1;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
    };

    let deliveries = AtomicU32::new(0);
    let deliveries = &deliveries;
    let handler = move |envelope: Envelope<OrderPlaced>| async move {
        if deliveries.fetch_add(1, Ordering::SeqCst) % 5 == 4 {
            return Err(HandlerError::from(format!(
                "order {} hit a simulated failure",
                envelope.payload().order
            )));
        }
        tracing::info!(order = envelope.payload().order, sku = %envelope.payload().sku, "Order relayed");
        Ok(())
    };

    let consumed = gateway.consume(handler).await;
    // A consumer that failed on its own leaves the publisher running.
    cancel.cancel();
    publisher.await?;

    match Arc::try_unwrap(gateway) {
        Ok(gateway) => gateway.shutdown().await?,
        Err(_) => tracing::warn!("Gateway still shared at shutdown"),
    }
    consumed?;
    Ok(())
}
