use crate::consumers::{ExampleMessage, Recorder};
use crate::helpers::{json_properties, no_queue_retry, queue_name, wait_for_settlements};
use carrot_dispatch::amqp::{BrokerOperation, InMemoryBroker};
use carrot_dispatch::consumers::{
    ConsumerDescriptor, ConsumerServer, ConsumerState, Message, QueueCheckRetry, QueueName,
    Service,
};
use carrot_dispatch::services::{ServiceCollection, ServiceProvider};
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;
use std::time::Duration;

async fn handler(_message: Message<ExampleMessage>) {}

fn descriptor(broker: &InMemoryBroker, queue: &str) -> ConsumerDescriptor {
    let mut descriptor = ConsumerDescriptor::new(queue, broker.clone(), handler).unwrap();
    descriptor.queue_check(no_queue_retry()).unwrap();
    descriptor
}

#[tokio::test]
async fn the_server_starts_a_consumer_per_registered_queue() {
    async fn handler(
        queues: Service<Recorder<String>>,
        queue: QueueName,
        _message: Message<ExampleMessage>,
    ) {
        queues.record(queue.0);
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queues: Vec<String> = (0..3).map(|_| queue_name()).collect();
    let recorder = Arc::new(Recorder::<String>::default());
    let mut services = ServiceCollection::new();
    services.add_singleton(recorder.clone());
    let mut server = ConsumerServer::new(services.build());
    for queue in &queues {
        broker.declare_queue(queue);
        server
            .add(ConsumerDescriptor::new(queue, broker.clone(), handler).unwrap())
            .unwrap();
    }

    // Act
    server.start().await.unwrap();
    for queue in &queues {
        broker.enqueue(queue, json_properties(), ExampleMessage::fake().to_json());
    }

    // Assert
    wait_for_settlements(&broker, 3).await;
    let mut consumed = recorder.items();
    consumed.sort();
    let mut expected = queues.clone();
    expected.sort();
    assert_eq!(consumed, expected);
    assert!(server
        .consumers()
        .iter()
        .all(|c| c.state() == ConsumerState::Consuming));
    assert!(server.descriptors().iter().all(|d| d.is_locked()));
}

#[tokio::test]
async fn the_server_fails_to_start_if_any_queue_is_missing() {
    // Arrange
    let broker = InMemoryBroker::new();
    let present = queue_name();
    let missing = queue_name();
    broker.declare_queue(&present);
    let mut server = ConsumerServer::new(ServiceProvider::default());
    server
        .add(descriptor(&broker, &present))
        .unwrap()
        .add(descriptor(&broker, &missing))
        .unwrap();

    // Act
    let outcome = server.start().await;

    // Assert
    let error = outcome.unwrap_err();
    assert!(format!("{error:#}").contains(&missing));
}

#[tokio::test]
async fn a_failed_start_releases_the_consumers_that_were_still_starting() {
    // Arrange
    let broker = InMemoryBroker::new();
    let slow = queue_name();
    let missing = queue_name();
    let mut slow_descriptor = ConsumerDescriptor::new(&slow, broker.clone(), handler).unwrap();
    slow_descriptor
        .queue_check(QueueCheckRetry {
            max_attempts: 4,
            initial_delay_ms: 30,
            max_delay_ms: 30,
        })
        .unwrap();
    let mut server = ConsumerServer::new(ServiceProvider::default());
    server
        .add(slow_descriptor)
        .unwrap()
        .add(descriptor(&broker, &missing))
        .unwrap();

    // Act
    let outcome = server.start().await;

    // Assert
    assert!(outcome.is_err());
    assert!(server.consumers().is_empty());
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn consumers_are_stopped_in_reverse_registration_order() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queues: Vec<String> = (0..3).map(|_| queue_name()).collect();
    let mut server = ConsumerServer::new(ServiceProvider::default());
    for queue in &queues {
        broker.declare_queue(queue);
        let mut descriptor = descriptor(&broker, queue);
        descriptor.consumer_tag(format!("tag-{queue}")).unwrap();
        server.add(descriptor).unwrap();
    }
    server.start().await.unwrap();

    // Act
    server.stop().await;

    // Assert
    let cancelled: Vec<String> = broker
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            BrokerOperation::Cancel { consumer_tag } => Some(consumer_tag),
            _ => None,
        })
        .collect();
    let expected: Vec<String> = queues.iter().rev().map(|q| format!("tag-{q}")).collect();
    assert_eq!(cancelled, expected);
    assert!(server
        .consumers()
        .iter()
        .all(|c| c.state() == ConsumerState::Stopped));
}

#[tokio::test]
async fn disposing_the_server_releases_every_consumer_and_can_be_repeated() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut server = ConsumerServer::new(ServiceProvider::default());
    for _ in 0..2 {
        let queue = queue_name();
        broker.declare_queue(&queue);
        server.add(descriptor(&broker, &queue)).unwrap();
    }
    server.start().await.unwrap();

    // Act
    server.dispose().await;
    server.dispose().await;

    // Assert
    assert!(server.consumers().is_empty());
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn consumers_cannot_be_added_once_the_server_started() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let mut server = ConsumerServer::new(ServiceProvider::default());
    server.add(descriptor(&broker, &queue)).unwrap();
    server.start().await.unwrap();

    // Act
    let added = server.add(descriptor(&broker, &queue)).is_err();
    let restarted = server.start().await.is_err();

    // Assert
    assert!(added);
    assert!(restarted);
    assert_eq!(server.descriptors().len(), 1);
    server.dispose().await;
}

#[tokio::test]
async fn the_server_runs_until_shutdown_is_signalled() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let mut server = ConsumerServer::new(ServiceProvider::default());
    server.add(descriptor(&broker, &queue)).unwrap();
    let shutdown = Arc::new(ShutdownHandler::new());

    // Act
    let running = tokio::spawn(server.run_until_shutdown(shutdown.clone()));
    broker.enqueue(&queue, json_properties(), ExampleMessage::fake().to_json());
    wait_for_settlements(&broker, 1).await;
    shutdown.shutdown();

    // Assert
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.consumer_count(&queue), 0);
}
