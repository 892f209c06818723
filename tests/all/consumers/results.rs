use crate::consumers::{ExampleMessage, Recorder};
use crate::helpers::{
    json_properties, queue_name, settlements, start, wait_for_settlements, wait_until,
};
use carrot_dispatch::amqp::types::{AMQPValue, FieldTable};
use carrot_dispatch::amqp::{BasicProperties, BrokerOperation, InMemoryBroker};
use carrot_dispatch::consumers::hooks::failure::RetryWithDelay;
use carrot_dispatch::consumers::hooks::pre_start::{
    DeclareQueue, WithDeadLetterQueue, WithDelayedRetryQueue,
};
use carrot_dispatch::consumers::{BrokerAction, ConsumerDescriptor, Forward, Message, Service};
use carrot_dispatch::serialization::{Payload, SerializationError};
use carrot_dispatch::services::{ServiceCollection, ServiceProvider};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn a_reply_is_published_to_the_reply_to_queue_before_the_request_is_acked() {
    type Reply = (Option<String>, serde_json::Value);

    async fn handler(
        message: Message<ExampleMessage>,
    ) -> Result<BrokerAction, SerializationError> {
        Ok(BrokerAction::compose([
            BrokerAction::Ack,
            BrokerAction::reply_json(&json!({ "Greeting": format!("Hello {}", message.name) }))?,
        ]))
    }

    async fn on_reply(
        recorder: Service<Recorder<Reply>>,
        properties: BasicProperties,
        message: Message<serde_json::Value>,
    ) {
        let correlation_id = properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_owned());
        recorder.record((correlation_id, message.into_inner()));
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let requests = queue_name();
    let replies = queue_name();
    broker.declare_queue(&requests);
    broker.declare_queue(&replies);
    let recorder = Arc::new(Recorder::<Reply>::default());
    let mut services = ServiceCollection::new();
    services.add_singleton(recorder.clone());
    let services = services.build();
    let mut requests_descriptor =
        ConsumerDescriptor::new(&requests, broker.clone(), handler).unwrap();
    let mut replies_descriptor =
        ConsumerDescriptor::new(&replies, broker.clone(), on_reply).unwrap();
    let _requests_consumer = start(&mut requests_descriptor, services.clone()).await;
    let _replies_consumer = start(&mut replies_descriptor, services).await;
    let message = ExampleMessage::fake();

    // Act
    broker.enqueue(
        &requests,
        json_properties()
            .with_reply_to(replies.clone().into())
            .with_message_id("request-1".into()),
        message.to_json(),
    );

    // Assert
    wait_until(|| recorder.len() == 1).await;
    assert_eq!(
        recorder.items(),
        vec![(
            Some("request-1".to_string()),
            json!({ "Greeting": format!("Hello {}", message.name) })
        )]
    );

    let operations = broker.operations();
    let published = operations
        .iter()
        .position(|op| matches!(op, BrokerOperation::Publish(p) if p.routing_key == replies))
        .unwrap();
    let acked = operations
        .iter()
        .position(|op| matches!(op, BrokerOperation::Ack { queue, .. } if queue == &requests))
        .unwrap();
    assert!(published < acked);
}

#[tokio::test]
async fn forwarded_messages_keep_their_headers_but_not_their_expiration() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    let audit = queue_name();
    broker.declare_queue(&queue);
    broker.declare_queue(&audit);

    let target = audit.clone();
    let handler = move |message: Message<ExampleMessage>| {
        let target = target.clone();
        async move {
            BrokerAction::compose([
                Forward::new("", target)
                    .payload(Payload::json(&*message).unwrap())
                    .reply_to("audit-replies")
                    .into(),
                BrokerAction::Ack,
            ])
        }
    };
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    let _consumer = start(&mut descriptor, ServiceProvider::default()).await;

    let mut headers = FieldTable::default();
    headers.insert("x-tenant-id".into(), AMQPValue::LongString("acme".into()));
    let message = ExampleMessage::fake();

    // Act
    broker.enqueue(
        &queue,
        json_properties()
            .with_headers(headers)
            .with_expiration("60000".into())
            .with_reply_to("requester".into())
            .with_message_id("request-1".into()),
        message.to_json(),
    );

    // Assert
    let settlements = wait_for_settlements(&broker, 1).await;
    assert!(matches!(settlements[0], BrokerOperation::Ack { .. }));

    let forwarded = broker.messages(&audit);
    assert_eq!(forwarded.len(), 1);
    let properties = &forwarded[0].properties;
    assert_eq!(
        properties
            .headers()
            .as_ref()
            .unwrap()
            .inner()
            .get("x-tenant-id"),
        Some(&AMQPValue::LongString("acme".into()))
    );
    assert!(properties.expiration().is_none());
    assert_eq!(
        properties.reply_to().as_ref().map(|r| r.as_str()),
        Some("audit-replies")
    );
    assert_eq!(
        properties.correlation_id().as_ref().map(|id| id.as_str()),
        Some("request-1")
    );
    let message_id = properties.message_id().as_ref().unwrap();
    assert_ne!(message_id.as_str(), "request-1");
    assert_eq!(
        serde_json::from_slice::<ExampleMessage>(&forwarded[0].body).unwrap(),
        message
    );
}

#[tokio::test]
async fn a_delayed_message_waits_in_the_delayed_queue_and_the_delivery_is_acked() {
    async fn handler(_message: Message<ExampleMessage>) -> BrokerAction {
        BrokerAction::delayed(Duration::from_millis(1500))
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    descriptor
        .pre_start_hook(WithDelayedRetryQueue(DeclareQueue))
        .unwrap();
    let _consumer = start(&mut descriptor, ServiceProvider::default()).await;
    let message = ExampleMessage::fake();

    // Act
    broker.enqueue(&queue, json_properties(), message.to_json());

    // Assert
    let settlements = wait_for_settlements(&broker, 1).await;
    assert_eq!(
        settlements,
        vec![BrokerOperation::Ack {
            queue: queue.clone(),
            delivery_tag: 1
        }]
    );
    let delayed = broker.messages(&format!("{queue}-delayed"));
    assert_eq!(delayed.len(), 1);
    assert_eq!(
        delayed[0].properties.expiration().as_ref().map(|e| e.as_str()),
        Some("1500")
    );
    assert_eq!(delayed[0].body, message.to_json());
}

#[tokio::test]
async fn a_failed_delivery_is_retried_later_when_the_failure_hook_says_so() {
    async fn handler(_message: Message<ExampleMessage>) -> Result<(), anyhow::Error> {
        anyhow::bail!("The downstream service is unavailable")
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    descriptor
        .pre_start_hook(WithDelayedRetryQueue(DeclareQueue))
        .unwrap()
        .on_process_failure(RetryWithDelay {
            ttl: Duration::from_millis(250),
        })
        .unwrap();
    let _consumer = start(&mut descriptor, ServiceProvider::default()).await;

    // Act
    broker.enqueue(&queue, json_properties(), ExampleMessage::fake().to_json());

    // Assert
    let settlements = wait_for_settlements(&broker, 1).await;
    assert!(matches!(settlements[0], BrokerOperation::Ack { .. }));
    let delayed = broker.messages(&format!("{queue}-delayed"));
    assert_eq!(
        delayed[0].properties.expiration().as_ref().map(|e| e.as_str()),
        Some("250")
    );
}

#[tokio::test]
async fn a_reply_without_reply_to_falls_back_to_a_nack_without_requeue() {
    async fn handler(_message: Message<ExampleMessage>) -> BrokerAction {
        BrokerAction::compose([
            BrokerAction::Ack,
            BrokerAction::Reply(Payload::Value(json!("pong"))),
        ])
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    let _consumer = start(&mut descriptor, ServiceProvider::default()).await;

    // Act
    broker.enqueue(&queue, json_properties(), ExampleMessage::fake().to_json());

    // Assert
    let settlements = wait_for_settlements(&broker, 1).await;
    assert_eq!(
        settlements,
        vec![BrokerOperation::Nack {
            queue: queue.clone(),
            delivery_tag: 1,
            requeue: false
        }]
    );
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn a_reply_on_its_own_leaves_the_delivery_unacknowledged() {
    async fn handler(_message: Message<ExampleMessage>) -> BrokerAction {
        BrokerAction::Reply(Payload::Value(json!("pong")))
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    let replies = queue_name();
    broker.declare_queue(&queue);
    broker.declare_queue(&replies);
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    let _consumer = start(&mut descriptor, ServiceProvider::default()).await;

    // Act
    broker.enqueue(
        &queue,
        json_properties().with_reply_to(replies.clone().into()),
        ExampleMessage::fake().to_json(),
    );

    // Assert
    wait_until(|| broker.messages(&replies).len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(settlements(&broker).is_empty());
    assert_eq!(broker.unacked_count(&queue), 1);
}

#[tokio::test]
async fn rejected_messages_are_dead_lettered() {
    async fn handler(_message: Message<ExampleMessage>) -> BrokerAction {
        BrokerAction::reject(false)
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    descriptor
        .pre_start_hook(WithDeadLetterQueue(DeclareQueue))
        .unwrap();
    let _consumer = start(&mut descriptor, ServiceProvider::default()).await;
    let message = ExampleMessage::fake();

    // Act
    broker.enqueue(&queue, json_properties(), message.to_json());

    // Assert
    let settlements = wait_for_settlements(&broker, 1).await;
    assert_eq!(
        settlements,
        vec![BrokerOperation::Reject {
            queue: queue.clone(),
            delivery_tag: 1,
            requeue: false
        }]
    );
    let dead_letters = broker.messages(&format!("{queue}.deadletter"));
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].body, message.to_json());
}
