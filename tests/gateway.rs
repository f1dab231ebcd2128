use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use switchyard::{
    CircuitState, ConsumeErrorKind, Envelope, Gateway, HandlerError, ResiliencePolicy,
    transport::InMemoryBroker,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn single_attempt() -> ResiliencePolicy {
    ResiliencePolicy {
        retry_count: 1,
        ..ResiliencePolicy::default()
    }
}

#[tokio::test(start_paused = true)]
async fn publish_gives_up_after_three_attempts() {
    let broker = InMemoryBroker::new("orders");
    let gateway = Gateway::connect(broker.clone(), &ResiliencePolicy::default(), CancellationToken::new())
        .await
        .unwrap();

    broker.fail_next_sends(3);
    let started = Instant::now();
    let err = gateway.publish(&Envelope::new(1)).await.unwrap_err();

    assert!(!err.is_circuit_open());
    assert!(!err.is_timeout());
    assert_eq!(broker.send_attempts(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(2 + 4));
    assert!(broker.sent_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn publish_recovers_from_a_short_outage() {
    let broker = InMemoryBroker::new("orders");
    let gateway = Gateway::connect(broker.clone(), &ResiliencePolicy::default(), CancellationToken::new())
        .await
        .unwrap();

    broker.fail_next_sends(2);
    let envelope = Envelope::new("order #7".to_owned());
    gateway.publish(&envelope).await.unwrap();

    assert_eq!(broker.send_attempts(), 3);
    let sent = broker.sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id(), envelope.id());
}

#[tokio::test(start_paused = true)]
async fn broker_recovery_closes_the_circuit_after_the_break() {
    let broker = InMemoryBroker::new("orders");
    let gateway = Gateway::connect(broker.clone(), &single_attempt(), CancellationToken::new())
        .await
        .unwrap();

    broker.fail_next_sends(5);
    for n in 0..5 {
        gateway.publish(&Envelope::new(n)).await.unwrap_err();
    }
    assert_eq!(gateway.breaker_state().state, CircuitState::Open);

    tokio::time::sleep(Duration::from_secs(30)).await;
    gateway.publish(&Envelope::new(5)).await.unwrap();

    let snapshot = gateway.breaker_state();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(broker.send_attempts(), 6);
}

#[tokio::test(start_paused = true)]
async fn failed_trial_keeps_rejecting_publishes() {
    let broker = InMemoryBroker::new("orders");
    let gateway = Gateway::connect(broker.clone(), &single_attempt(), CancellationToken::new())
        .await
        .unwrap();

    broker.fail_next_sends(6);
    for n in 0..5 {
        gateway.publish(&Envelope::new(n)).await.unwrap_err();
    }
    tokio::time::sleep(Duration::from_secs(30)).await;

    let trial = gateway.publish(&Envelope::new(5)).await.unwrap_err();
    assert!(!trial.is_circuit_open());
    assert_eq!(gateway.breaker_state().state, CircuitState::Open);

    let rejected = gateway.publish(&Envelope::new(6)).await.unwrap_err();
    assert!(rejected.is_circuit_open());
    assert_eq!(broker.send_attempts(), 6);
}

#[tokio::test]
async fn failed_message_is_redelivered_before_the_next_one() {
    let broker = InMemoryBroker::new("orders");
    let gateway = Gateway::connect(broker.clone(), &ResiliencePolicy::default(), CancellationToken::new())
        .await
        .unwrap();

    gateway.publish(&Envelope::new("m1".to_owned())).await.unwrap();
    gateway.publish(&Envelope::new("m2".to_owned())).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        move |envelope: Envelope<String>| {
            let seen = seen.clone();
            async move {
                let mut seen = seen.lock().unwrap();
                let first_attempt = !seen.contains(envelope.payload());
                seen.push(envelope.into_payload());
                if first_attempt && seen.len() == 1 {
                    return Err(HandlerError::from("downstream unavailable"));
                }
                Ok(())
            }
        }
    };

    let stop = async {
        while broker.acked() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        gateway.cancellation_token().cancel();
    };
    let (consumed, ()) = tokio::join!(gateway.consume(handler), stop);

    consumed.unwrap();
    assert_eq!(*seen.lock().unwrap(), ["m1", "m1", "m2"]);
    assert_eq!(broker.pending(), 0);
    assert_eq!(broker.in_flight(), 0);
    assert!(broker.dead_letters().is_empty());
}

#[tokio::test]
async fn cancellation_releases_an_idle_consumer_promptly() {
    let broker = InMemoryBroker::new("orders");
    let gateway = Gateway::connect(broker.clone(), &ResiliencePolicy::default(), CancellationToken::new())
        .await
        .unwrap();

    let cancel = gateway.cancellation_token().clone();
    let stop = async {
        while broker.open_receivers() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cancel.cancel();
    };
    let consume = gateway.consume(|_: Envelope<String>| async { Ok::<_, HandlerError>(()) });

    let (consumed, ()) = tokio::time::timeout(Duration::from_secs(1), async {
        tokio::join!(consume, stop)
    })
    .await
    .expect("consumer did not stop after cancellation");

    consumed.unwrap();
    assert_eq!(broker.open_receivers(), 0);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn refused_consumer_returns_without_cancelling_the_gateway() {
    let broker = InMemoryBroker::new("orders");
    let gateway = Gateway::connect(broker.clone(), &ResiliencePolicy::default(), CancellationToken::new())
        .await
        .unwrap();
    broker.refuse_connections(true);

    let err = gateway
        .consume(|_: Envelope<String>| async { Ok::<_, HandlerError>(()) })
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), ConsumeErrorKind::Connect(_)));
    assert!(!gateway.cancellation_token().is_cancelled());
    gateway.shutdown().await.unwrap();
}
