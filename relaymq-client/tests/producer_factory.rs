mod common;

use common::MockCluster;
use relaymq_client::protocol::request_code;
use relaymq_client::{
    Message, ProducerFactory, ProducerFactoryConfig, RelaymqClientError, SendStatus,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

async fn factory_on(cluster: &MockCluster, topic_queue_num: u32) -> ProducerFactory {
    let config = ProducerFactoryConfig {
        name_server_address: "mock:9876".to_string(),
        topic_queue_num,
    };
    ProducerFactory::with_context(config, cluster.context())
        .await
        .expect("Failed to start factory")
}

#[tokio::test]
async fn test_same_topic_returns_same_producer() {
    let cluster = MockCluster::new(&["broker-a", "broker-b"]);
    let factory = factory_on(&cluster, 4).await;

    let first = factory.get_topic_producer("orders").await.unwrap();
    for _ in 0..5 {
        let again = factory.get_topic_producer("orders").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    let other = factory.get_topic_producer("payments").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(first.topic(), "orders");
    assert_eq!(other.topic(), "payments");
    assert_eq!(factory.len(), 2);

    // Provisioned once per broker, not once per request
    assert_eq!(cluster.provisioned("orders").len(), 2);
}

#[tokio::test]
async fn test_concurrent_requests_build_one_producer() {
    let cluster = MockCluster::new(&["broker-a", "broker-b"]);
    cluster.set_connect_delay(Duration::from_millis(20));
    let factory = Arc::new(factory_on(&cluster, 4).await);
    let constructions = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..12 {
        let factory = Arc::clone(&factory);
        let constructions = Arc::clone(&constructions);
        tasks.spawn(async move {
            factory
                .get_topic_producer_with("orders", move |_| {
                    constructions.fetch_add(1, Ordering::SeqCst);
                })
                .await
        });
    }

    let mut producers = Vec::new();
    while let Some(result) = tasks.join_next().await {
        producers.push(result.expect("Task failed").expect("Failed to get producer"));
    }

    assert_eq!(constructions.load(Ordering::SeqCst), 1);
    assert!(producers.iter().all(|p| Arc::ptr_eq(p, &producers[0])));
    assert_eq!(cluster.provisioned("orders").len(), 2);
}

#[tokio::test]
async fn test_configure_hook_runs_before_start() {
    let cluster = MockCluster::new(&["broker-a"]);
    let factory = factory_on(&cluster, 4).await;

    let producer = factory
        .get_topic_producer_with("orders", |config| {
            config.client_config.group = "order-producers".to_string();
            config.send_timeout = Duration::from_secs(1);
        })
        .await
        .unwrap();

    assert_eq!(producer.client().group(), "order-producers");
    assert_eq!(producer.config().send_timeout, Duration::from_secs(1));
    assert!(producer.client().is_active());
}

#[tokio::test]
async fn test_queue_num_below_one_uses_default() {
    let cluster = MockCluster::new(&["broker-a"]);
    let factory = factory_on(&cluster, 0).await;
    assert_eq!(factory.topic_queue_num(), 4);

    factory.get_topic_producer("orders").await.unwrap();
    let provisioned = cluster.provisioned("orders");
    assert_eq!(provisioned[0].fields["readQueueNums"], "4");
    assert_eq!(provisioned[0].fields["writeQueueNums"], "4");
}

#[tokio::test]
async fn test_failed_construction_is_not_cached() {
    let cluster = MockCluster::new(&["broker-a"]);
    let factory = factory_on(&cluster, 4).await;
    cluster.state.missing_routes.lock().insert("orders".to_string());

    let err = factory.get_topic_producer("orders").await.unwrap_err();
    assert!(matches!(err, RelaymqClientError::RouteNotFound { .. }));
    assert!(factory.is_empty());

    cluster.state.missing_routes.lock().clear();
    let producer = factory.get_topic_producer("orders").await.unwrap();
    assert_eq!(producer.topic(), "orders");
    assert_eq!(factory.len(), 1);
}

#[tokio::test]
async fn test_blank_arguments_are_rejected() {
    let cluster = MockCluster::new(&["broker-a"]);

    let err = ProducerFactory::new("").await.unwrap_err();
    assert!(matches!(
        err,
        RelaymqClientError::InvalidArgument { name: "name_server_address" }
    ));

    let err = ProducerFactory::with_context(ProducerFactoryConfig::new("  "), cluster.context())
        .await
        .unwrap_err();
    assert!(matches!(err, RelaymqClientError::InvalidArgument { .. }));
    assert_eq!(cluster.route_lookups(), 0);
    assert_eq!(cluster.connects(), 0);

    let factory = factory_on(&cluster, 4).await;
    let err = factory.get_topic_producer(" ").await.unwrap_err();
    assert!(matches!(err, RelaymqClientError::InvalidArgument { name: "topic" }));
}

#[tokio::test]
async fn test_close_disposes_everything_and_rejects_requests() {
    let cluster = MockCluster::new(&["broker-a", "broker-b"]);
    let factory = factory_on(&cluster, 4).await;

    let orders = factory.get_topic_producer("orders").await.unwrap();
    orders.publish(Message::new("one")).await.unwrap();
    orders.publish(Message::new("two")).await.unwrap();
    factory.get_topic_producer("payments").await.unwrap();

    factory.close().await.unwrap();

    // Every session opened by the master or a topic producer was closed
    assert_eq!(cluster.closes(), cluster.connects());
    assert!(!orders.client().is_active());

    let err = factory.get_topic_producer("orders").await.unwrap_err();
    assert!(matches!(err, RelaymqClientError::Closed));
    let err = factory.get_topic_producer("refunds").await.unwrap_err();
    assert!(matches!(err, RelaymqClientError::Closed));
}

#[tokio::test]
async fn test_close_continues_past_failures() {
    let cluster = MockCluster::new(&["broker-a"]);
    let factory = factory_on(&cluster, 4).await;

    // Connect #1 is the master's session, opened while provisioning
    for topic in ["a", "b", "c"] {
        let producer = factory.get_topic_producer(topic).await.unwrap();
        producer.publish(Message::new(topic)).await.unwrap();
    }
    assert_eq!(cluster.connects(), 4);
    cluster.fail_close_on(3);

    let err = factory.close().await.unwrap_err();
    match err {
        RelaymqClientError::Dispose { failed, total, .. } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 4);
        }
        other => panic!("Expected dispose error, got {}", other),
    }
    assert_eq!(cluster.closes(), 4);
}

#[tokio::test]
async fn test_order_events_scenario() {
    let cluster = MockCluster::new(&["broker-a", "broker-b"]);
    let factory = factory_on(&cluster, 4).await;
    let producer = factory.get_topic_producer("orders").await.unwrap();

    let tags = ["order_create", "order_commit", "order_refund"];
    let mut queues = HashSet::new();
    for i in 0..10 {
        let message = Message::new(format!("order event {}", i))
            .with_tags(tags[i % tags.len()])
            .with_keys(format!("order-{}", i));
        let result = producer.publish(message).await.unwrap();

        assert_eq!(result.status, SendStatus::SendOk);
        assert_eq!(result.queue.topic, "orders");
        assert!(!result.msg_id.is_empty());
        queues.insert(result.queue.to_string());
    }

    // Round-robin spreads 10 sends over both brokers' 4 queues each
    assert_eq!(queues.len(), 8);

    let provisioned: HashSet<String> = cluster
        .provisioned("orders")
        .into_iter()
        .map(|r| r.broker)
        .collect();
    assert_eq!(provisioned.len(), 2);

    let sends = cluster.received(request_code::SEND_MESSAGE);
    assert_eq!(sends.len(), 10);
    assert!(sends[0].fields["properties"].contains("order_create"));
    assert_eq!(sends[0].fields["topic"], "orders");

    factory.close().await.unwrap();
}
