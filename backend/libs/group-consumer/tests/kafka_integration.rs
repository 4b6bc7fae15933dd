//! Integration tests against a real broker
//!
//! These tests require a running Kafka broker with topic auto-creation.
//! Run with: KAFKA_BROKERS=localhost:9092 cargo test --test kafka_integration -- --ignored

use std::sync::{Arc, Mutex};
use std::time::Duration;

use group_consumer::{handler_fn, ConsumerConfig, Envelope, GroupConsumer, InitialOffset};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;

fn brokers() -> String {
    std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires Kafka broker
async fn test_consumes_and_commits_produced_records() {
    let suffix = chrono::Utc::now().timestamp_millis();
    let topic = format!("group-consumer-it-{suffix}");
    let group_id = format!("group-consumer-it-{suffix}");

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", brokers())
        .set("message.timeout.ms", "5000")
        .create()
        .expect("Failed to create producer");

    for i in 0..3 {
        let payload = format!("{{\"n\":{i}}}");
        let key = format!("key-{i}");
        producer
            .send(
                FutureRecord::to(&topic).payload(&payload).key(&key).partition(0),
                Duration::from_secs(5),
            )
            .await
            .map_err(|(e, _)| e)
            .expect("Failed to produce");
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(move |_ctx, msg: Envelope| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(msg.offset());
            Ok(())
        }
    });

    let config = ConsumerConfig::new(vec![brokers()], group_id.clone(), vec![topic.clone()])
        .with_initial_offset(InitialOffset::Oldest);
    let mut consumer = GroupConsumer::from_config(&config, handler).expect("Failed to create consumer");
    consumer.start(&CancellationToken::new());

    tokio::time::timeout(Duration::from_secs(30), async {
        while seen.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("records should be consumed");

    // marked offsets are durable once close returns
    consumer.close().await.expect("Failed to close consumer");
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

    let offsets: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers())
        .set("group.id", &group_id)
        .create()
        .expect("Failed to create offset reader");
    let mut partitions = TopicPartitionList::new();
    partitions.add_partition(&topic, 0);
    let committed = offsets
        .committed_offsets(partitions, Duration::from_secs(10))
        .expect("Failed to read committed offsets");
    let position = committed
        .find_partition(&topic, 0)
        .map(|elem| elem.offset());
    assert_eq!(position, Some(Offset::Offset(3)));
}
