use carrot_dispatch::amqp::{BasicProperties, BrokerOperation, InMemoryBroker};
use carrot_dispatch::consumers::{ConsumerDescriptor, QueueCheckRetry, QueueConsumer};
use carrot_dispatch::services::ServiceProvider;
use std::time::Duration;
use uuid::Uuid;

pub fn queue_name() -> String {
    Uuid::new_v4().to_string()
}

pub fn json_properties() -> BasicProperties {
    BasicProperties::default().with_content_type("application/json".into())
}

pub fn json_message(body: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(body).unwrap()
}

/// Fail fast when a queue is missing, instead of waiting through the default backoff.
pub fn no_queue_retry() -> QueueCheckRetry {
    QueueCheckRetry {
        max_attempts: 1,
        initial_delay_ms: 1,
        max_delay_ms: 1,
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "The condition did not hold within two seconds"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Acks, nacks and rejects, in the order the broker received them.
pub fn settlements(broker: &InMemoryBroker) -> Vec<BrokerOperation> {
    broker
        .operations()
        .into_iter()
        .filter(BrokerOperation::is_settlement)
        .collect()
}

pub async fn wait_for_settlements(broker: &InMemoryBroker, count: usize) -> Vec<BrokerOperation> {
    wait_until(|| settlements(broker).len() >= count).await;
    settlements(broker)
}

/// Build, initialize and start a consumer.
pub async fn start(
    descriptor: &mut ConsumerDescriptor,
    services: ServiceProvider,
) -> QueueConsumer {
    let mut consumer = descriptor.build(services).unwrap();
    consumer.initialize().await.unwrap();
    consumer.start().await.unwrap();
    consumer
}
