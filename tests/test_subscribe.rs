//! Integration tests for subscriptions: declaration and binding, consumer
//! delivery, decode handling, and unsubscribe.


use std::sync::{Arc, Mutex};
use std::time::Duration;

use hamqp::broker::Inbound;
use hamqp::ha::HaCallbacks;
use hamqp::testing::mocks::delivery;
use hamqp::transport::ExchangeType;
use hamqp::{
    BrokerStatus, ExchangeSpec, JsonSerializer, PacketSerializer, QueueSpec, SubscribeOptions,
};
use test_helpers::*;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn encoded_request() -> Vec<u8> {
    JsonSerializer.encode(&request_packet()).unwrap()
}

#[tokio::test]
async fn test_subscribe_declares_binds_and_consumes() {
    let (client, transport) = mock_client(one_broker_options(), HaCallbacks::default()).await;

    let (_, handler) = recording_handler();
    let ids = client
        .subscribe(
            &QueueSpec::durable("work"),
            Some(&ExchangeSpec::direct("jobs")),
            &SubscribeOptions::default(),
            handler,
        )
        .await;
    assert_eq!(ids, vec!["rs-broker-first-5672"]);

    let channel = transport.channel("first:5672").unwrap();
    let queues = channel.declared_queues.lock().unwrap().clone();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].0, "work");
    assert!(queues[0].1.durable);

    let exchanges = channel.declared_exchanges.lock().unwrap().clone();
    assert_eq!(exchanges.len(), 1);
    assert_eq!(exchanges[0].1, "jobs");

    let binds = channel.binds.lock().unwrap().clone();
    assert_eq!(binds.len(), 1);
    // binding key defaults to the queue name
    assert_eq!(binds[0], ("work".to_string(), "jobs".to_string(), "work".to_string()));

    let consumers = channel.consumers.lock().unwrap().clone();
    assert_eq!(consumers.len(), 1);
    assert_eq!(consumers[0].0, "work");
    // no explicit ack requested, so the consumer is no-ack
    assert!(consumers[0].2);
}

#[tokio::test]
async fn test_second_exchange_is_declared_and_bound() {
    let (client, transport) = mock_client(one_broker_options(), HaCallbacks::default()).await;

    let options = SubscribeOptions {
        exchange2: Some(ExchangeSpec::fanout("events")),
        key: Some("all".to_string()),
        ..Default::default()
    };
    let (_, handler) = recording_handler();
    client
        .subscribe(
            &QueueSpec::named("work"),
            Some(&ExchangeSpec::direct("jobs")),
            &options,
            handler,
        )
        .await;

    let channel = transport.channel("first:5672").unwrap();
    let exchanges = channel.declared_exchanges.lock().unwrap().clone();
    assert_eq!(exchanges.len(), 2);
    assert_eq!(exchanges[1].0, ExchangeType::Fanout);
    assert_eq!(exchanges[1].1, "events");

    let binds = channel.binds.lock().unwrap().clone();
    assert_eq!(binds.len(), 2);
    assert_eq!(binds[0].2, "all");
    assert_eq!(binds[1].2, "all");
}

#[tokio::test]
async fn test_no_declare_skips_declarations() {
    let (client, transport) = mock_client(one_broker_options(), HaCallbacks::default()).await;

    let options = SubscribeOptions {
        no_declare: true,
        ..Default::default()
    };
    let (_, handler) = recording_handler();
    client
        .subscribe(
            &QueueSpec::named("work"),
            Some(&ExchangeSpec::direct("jobs")),
            &options,
            handler,
        )
        .await;

    let channel = transport.channel("first:5672").unwrap();
    assert!(channel.declared_queues.lock().unwrap().is_empty());
    assert!(channel.declared_exchanges.lock().unwrap().is_empty());
    // binding still happens against the existing topology
    assert_eq!(channel.binds.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_subscribe_is_idempotent_per_queue() {
    let (client, transport) = mock_client(one_broker_options(), HaCallbacks::default()).await;

    let (_, handler) = recording_handler();
    let first = client
        .subscribe(
            &QueueSpec::named("work"),
            None,
            &SubscribeOptions::default(),
            handler.clone(),
        )
        .await;
    let second = client
        .subscribe(
            &QueueSpec::named("work"),
            None,
            &SubscribeOptions::default(),
            handler,
        )
        .await;

    // both calls report success on the broker
    assert_eq!(first, vec!["rs-broker-first-5672"]);
    assert_eq!(second, vec!["rs-broker-first-5672"]);
    // but only one consumer was installed
    let channel = transport.channel("first:5672").unwrap();
    assert_eq!(channel.consumers.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_delivery_decodes_and_reaches_handler() {
    let (client, transport) = mock_client(one_broker_options(), HaCallbacks::default()).await;

    let (received, handler) = recording_handler();
    client
        .subscribe(
            &QueueSpec::named("work"),
            None,
            &SubscribeOptions::default(),
            handler,
        )
        .await;

    let channel = transport.channel("first:5672").unwrap();
    assert!(channel.deliver("work", delivery(&encoded_request())).await);
    settle().await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].broker, "rs-broker-first-5672");
    match &received[0].message {
        Inbound::Packet(packet) => {
            assert_eq!(packet.kind, "Request");
            assert_eq!(packet.token.as_deref(), Some("token-1"));
        }
        Inbound::Raw(_) => panic!("expected a decoded packet"),
    }
}

#[tokio::test]
async fn test_ack_happens_before_handler() {
    let (client, transport) = mock_client(one_broker_options(), HaCallbacks::default()).await;
    let channel = transport.channel("first:5672").unwrap();

    let acks_at_invocation: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = acks_at_invocation.clone();
    let observed = channel.clone();
    let handler: hamqp::SubscriptionHandler = Arc::new(move |_envelope| {
        sink.lock().unwrap().push(observed.acks.lock().unwrap().len());
        Ok(())
    });

    let options = SubscribeOptions {
        ack: true,
        ..Default::default()
    };
    client
        .subscribe(&QueueSpec::named("work"), None, &options, handler)
        .await;

    // explicit-ack subscriptions consume with no_ack = false
    assert!(!channel.consumers.lock().unwrap()[0].2);

    let mut incoming = delivery(&encoded_request());
    incoming.delivery_tag = 42;
    assert!(channel.deliver("work", incoming).await);
    settle().await;

    assert_eq!(channel.acks.lock().unwrap().as_slice(), [42]);
    // the handler saw the ack already recorded
    assert_eq!(acks_at_invocation.lock().unwrap().as_slice(), [1]);
}

#[tokio::test]
async fn test_nil_sentinel_is_ignored() {
    let (client, transport) = mock_client(one_broker_options(), HaCallbacks::default()).await;

    let (received, handler) = recording_handler();
    client
        .subscribe(
            &QueueSpec::named("work"),
            None,
            &SubscribeOptions::default(),
            handler,
        )
        .await;

    let channel = transport.channel("first:5672").unwrap();
    assert!(channel.deliver("work", delivery(b"nil")).await);
    settle().await;

    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unexpected_kind_is_dropped() {
    let (client, transport) = mock_client(one_broker_options(), HaCallbacks::default()).await;

    let mut options = SubscribeOptions::default();
    options
        .kinds
        .insert("Result".to_string(), vec!["status".to_string()]);
    let (received, handler) = recording_handler();
    client
        .subscribe(&QueueSpec::named("work"), None, &options, handler)
        .await;

    let channel = transport.channel("first:5672").unwrap();
    // a Request arrives where only Results are allowed
    assert!(channel.deliver("work", delivery(&encoded_request())).await);
    settle().await;

    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_decode_failure_reaches_receive_exception_callback() {
    // Scenario: inbound bytes the serializer cannot decode; the handler is
    // not called, the callback fires exactly once, the broker stays
    // connected
    let failures: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    let callbacks = HaCallbacks {
        exception_on_receive: Some(Arc::new(move |bytes, _error| {
            sink.lock().unwrap().push(bytes.to_vec());
        })),
        ..Default::default()
    };
    let (client, transport) = mock_client(one_broker_options(), callbacks).await;

    let mut options = SubscribeOptions::default();
    options.kinds.insert("Request".to_string(), Vec::new());
    let (received, handler) = recording_handler();
    client
        .subscribe(&QueueSpec::named("work"), None, &options, handler)
        .await;

    let channel = transport.channel("first:5672").unwrap();
    assert!(channel.deliver("work", delivery(b"\x00\x01 not json")).await);
    settle().await;

    assert!(received.lock().unwrap().is_empty());
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0], b"\x00\x01 not json".to_vec());
    assert_eq!(client.status()[0].status, BrokerStatus::Connected);
}

#[tokio::test]
async fn test_no_unserialize_hands_raw_bytes_to_handler() {
    let (client, transport) = mock_client(one_broker_options(), HaCallbacks::default()).await;

    let options = SubscribeOptions {
        no_unserialize: true,
        ..Default::default()
    };
    let (received, handler) = recording_handler();
    client
        .subscribe(&QueueSpec::named("work"), None, &options, handler)
        .await;

    let channel = transport.channel("first:5672").unwrap();
    assert!(channel.deliver("work", delivery(b"opaque bytes")).await);
    settle().await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    match &received[0].message {
        Inbound::Raw(bytes) => assert_eq!(bytes, b"opaque bytes"),
        Inbound::Packet(_) => panic!("expected raw bytes"),
    }
}

#[tokio::test]
async fn test_unsubscribe_cancels_consumers_and_is_idempotent() {
    let (client, transport) = mock_client(two_broker_options(), HaCallbacks::default()).await;

    let (_, handler) = recording_handler();
    client
        .subscribe(
            &QueueSpec::named("work"),
            None,
            &SubscribeOptions::default(),
            handler,
        )
        .await;
    assert_eq!(
        client.subscribed("work"),
        vec!["rs-broker-first-5672", "rs-broker-second-5672"]
    );

    client
        .unsubscribe(&["work".to_string()], Some(Duration::from_millis(200)))
        .await;
    assert!(client.subscribed("work").is_empty());
    let first = transport.channel("first:5672").unwrap();
    assert_eq!(first.cancelled.lock().unwrap().len(), 1);

    // second call is a silent no-op
    client
        .unsubscribe(&["work".to_string()], Some(Duration::from_millis(200)))
        .await;
    assert_eq!(first.cancelled.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_subscribe_while_connecting_is_permitted() {
    let transport = Arc::new(hamqp::testing::mocks::MockTransport::new());
    transport.hold_ready("first:5672");
    let client = hamqp::ha::HaBrokerClient::with_transport(
        Some(Arc::new(JsonSerializer)),
        one_broker_options(),
        HaCallbacks::default(),
        transport.clone(),
    )
    .await
    .unwrap();
    assert_eq!(client.status()[0].status, BrokerStatus::Connecting);

    let (_, handler) = recording_handler();
    let ids = client
        .subscribe(
            &QueueSpec::named("work"),
            None,
            &SubscribeOptions::default(),
            handler,
        )
        .await;

    // the transport queues channel operations until ready
    assert_eq!(ids, vec!["rs-broker-first-5672"]);
    let channel = transport.channel("first:5672").unwrap();
    assert_eq!(channel.consumers.lock().unwrap().len(), 1);
}
