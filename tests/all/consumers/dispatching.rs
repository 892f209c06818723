use crate::consumers::{ExampleMessage, Recorder};
use crate::helpers::{json_message, json_properties, queue_name, start, wait_for_settlements};
use carrot_dispatch::amqp::types::{AMQPValue, FieldTable};
use carrot_dispatch::amqp::{BrokerOperation, InMemoryBroker};
use carrot_dispatch::consumers::{
    get_message_local_item, set_message_local_item, sync_handler, BrokerAction,
    ConsumerDescriptor, DeliveryMode, DispatchContext, Header, KeyedService, Message,
    OptionalMessage, ProcessFailureHook, QueueName, RoutingKey, Service,
};
use carrot_dispatch::services::ServiceCollection;
use fake::Fake;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

carrot_dispatch::header_key!(TenantId => "x-tenant-id");
carrot_dispatch::service_key!(Audit => "audit");

#[tokio::test]
async fn the_body_and_the_services_of_the_handler_are_bound_from_the_delivery() {
    async fn handler(
        recorder: Service<Recorder<ExampleMessage>>,
        message: Message<ExampleMessage>,
    ) {
        recorder.record(message.into_inner());
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let recorder = Arc::new(Recorder::<ExampleMessage>::default());
    let mut services = ServiceCollection::new();
    services.add_singleton(recorder.clone());
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    let _consumer = start(&mut descriptor, services.build()).await;

    // Act
    broker.enqueue(
        &queue,
        json_properties(),
        json_message(&json!({ "Name": "n", "Age": 8 })),
    );

    // Assert
    let settlements = wait_for_settlements(&broker, 1).await;
    assert_eq!(
        settlements,
        vec![BrokerOperation::Ack {
            queue: queue.clone(),
            delivery_tag: 1
        }]
    );
    assert_eq!(
        recorder.items(),
        vec![ExampleMessage {
            name: "n".into(),
            age: 8
        }]
    );
}

#[tokio::test]
async fn headers_and_delivery_metadata_are_bound_by_type() {
    type Seen = (Option<String>, String, String, DeliveryMode);

    async fn handler(
        tenant: Header<TenantId>,
        queue: QueueName,
        routing_key: RoutingKey,
        delivery_mode: DeliveryMode,
        recorder: Service<Recorder<Seen>>,
        _message: Message<ExampleMessage>,
    ) {
        recorder.record((
            tenant.as_str().map(|t| t.into_owned()),
            queue.0,
            routing_key.0,
            delivery_mode,
        ));
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let recorder = Arc::new(Recorder::<Seen>::default());
    let mut services = ServiceCollection::new();
    services.add_singleton(recorder.clone());
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    let _consumer = start(&mut descriptor, services.build()).await;

    let mut headers = FieldTable::default();
    headers.insert("x-tenant-id".into(), AMQPValue::LongString("acme".into()));

    // Act
    broker.enqueue(
        &queue,
        json_properties()
            .with_headers(headers)
            .with_delivery_mode(2),
        ExampleMessage::fake().to_json(),
    );
    broker.enqueue(&queue, json_properties(), ExampleMessage::fake().to_json());

    // Assert
    wait_for_settlements(&broker, 2).await;
    assert_eq!(
        recorder.items(),
        vec![
            (
                Some("acme".to_string()),
                queue.clone(),
                queue.clone(),
                DeliveryMode::Persistent
            ),
            (None, queue.clone(), queue.clone(), DeliveryMode::Unspecified),
        ]
    );
}

#[tokio::test]
async fn keyed_services_are_resolved_by_their_key() {
    async fn handler(
        audit: KeyedService<Recorder<String>, Audit>,
        message: Message<ExampleMessage>,
    ) {
        audit.record(message.name.clone());
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let unkeyed = Arc::new(Recorder::<String>::default());
    let audit = Arc::new(Recorder::<String>::default());
    let mut services = ServiceCollection::new();
    services
        .add_singleton(unkeyed.clone())
        .add_keyed_singleton("audit", audit.clone());
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    let _consumer = start(&mut descriptor, services.build()).await;
    let message = ExampleMessage::fake();

    // Act
    broker.enqueue(&queue, json_properties(), message.to_json());

    // Assert
    wait_for_settlements(&broker, 1).await;
    assert_eq!(audit.items(), vec![message.name]);
    assert!(unkeyed.items().is_empty());
}

#[tokio::test]
async fn scoped_services_are_shared_within_a_delivery_and_renewed_across_deliveries() {
    struct UnitOfWork {
        id: Uuid,
    }

    async fn handler(
        first: Service<UnitOfWork>,
        second: Service<UnitOfWork>,
        recorder: Service<Recorder<(Uuid, Uuid)>>,
        _message: Message<ExampleMessage>,
    ) {
        recorder.record((first.id, second.id));
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let recorder = Arc::new(Recorder::<(Uuid, Uuid)>::default());
    let mut services = ServiceCollection::new();
    services
        .add_singleton(recorder.clone())
        .add_scoped(|_| {
            Ok(Arc::new(UnitOfWork {
                id: Uuid::new_v4(),
            }))
        });
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    let _consumer = start(&mut descriptor, services.build()).await;

    // Act
    broker.enqueue(&queue, json_properties(), ExampleMessage::fake().to_json());
    broker.enqueue(&queue, json_properties(), ExampleMessage::fake().to_json());

    // Assert
    wait_for_settlements(&broker, 2).await;
    let units = recorder.items();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0].0, units[0].1);
    assert_eq!(units[1].0, units[1].1);
    assert_ne!(units[0].0, units[1].0);
}

#[derive(Serialize, Deserialize)]
struct Sequenced {
    position: u32,
    delay_ms: u64,
}

#[tokio::test]
async fn deliveries_are_processed_in_queue_order_when_dispatch_concurrency_is_one() {
    async fn handler(recorder: Service<Recorder<u32>>, message: Message<Sequenced>) {
        tokio::time::sleep(Duration::from_millis(message.delay_ms)).await;
        recorder.record(message.position);
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let recorder = Arc::new(Recorder::<u32>::default());
    let mut services = ServiceCollection::new();
    services.add_singleton(recorder.clone());
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    let _consumer = start(&mut descriptor, services.build()).await;

    // Act
    for position in 0..20 {
        let message = Sequenced {
            position,
            delay_ms: (0..10).fake(),
        };
        broker.enqueue(
            &queue,
            json_properties(),
            serde_json::to_vec(&message).unwrap(),
        );
    }

    // Assert
    wait_for_settlements(&broker, 20).await;
    assert_eq!(recorder.items(), (0..20).collect::<Vec<_>>());
}

#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

#[tokio::test]
async fn no_more_deliveries_than_the_dispatch_concurrency_are_processed_at_once() {
    async fn handler(in_flight: Service<InFlight>, _message: Message<ExampleMessage>) {
        let current = in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        in_flight.max.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        in_flight.current.fetch_sub(1, Ordering::SeqCst);
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let in_flight = Arc::new(InFlight::default());
    let mut services = ServiceCollection::new();
    services.add_singleton(in_flight.clone());
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    descriptor.dispatch_concurrency(3).unwrap();
    let _consumer = start(&mut descriptor, services.build()).await;

    // Act
    for _ in 0..10 {
        broker.enqueue(&queue, json_properties(), ExampleMessage::fake().to_json());
    }

    // Assert
    let settlements = wait_for_settlements(&broker, 10).await;
    assert!(settlements
        .iter()
        .all(|s| matches!(s, BrokerOperation::Ack { .. })));
    assert_eq!(in_flight.max.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn an_empty_body_binds_to_none_for_optional_messages() {
    async fn handler(
        recorder: Service<Recorder<Option<ExampleMessage>>>,
        message: OptionalMessage<ExampleMessage>,
    ) {
        recorder.record(message.0);
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let recorder = Arc::new(Recorder::<Option<ExampleMessage>>::default());
    let mut services = ServiceCollection::new();
    services.add_singleton(recorder.clone());
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    let _consumer = start(&mut descriptor, services.build()).await;
    let message = ExampleMessage::fake();

    // Act
    broker.enqueue(&queue, json_properties(), Vec::new());
    broker.enqueue(&queue, json_properties(), message.to_json());

    // Assert
    let settlements = wait_for_settlements(&broker, 2).await;
    assert!(settlements
        .iter()
        .all(|s| matches!(s, BrokerOperation::Ack { .. })));
    assert_eq!(recorder.items(), vec![None, Some(message)]);
}

#[tokio::test]
async fn synchronous_functions_can_be_used_as_handlers() {
    fn handler(recorder: Service<Recorder<String>>, message: Message<ExampleMessage>) {
        recorder.record(message.into_inner().name);
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let recorder = Arc::new(Recorder::<String>::default());
    let mut services = ServiceCollection::new();
    services.add_singleton(recorder.clone());
    let mut descriptor =
        ConsumerDescriptor::new(&queue, broker.clone(), sync_handler(handler)).unwrap();
    let _consumer = start(&mut descriptor, services.build()).await;
    let message = ExampleMessage::fake();

    // Act
    broker.enqueue(&queue, json_properties(), message.to_json());

    // Assert
    let settlements = wait_for_settlements(&broker, 1).await;
    assert!(matches!(settlements[0], BrokerOperation::Ack { .. }));
    assert_eq!(recorder.items(), vec![message.name]);
}

#[derive(Clone, Debug, PartialEq)]
struct CorrelationId(String);

struct CapturingHook {
    seen: Arc<Recorder<Option<CorrelationId>>>,
}

#[async_trait::async_trait]
impl ProcessFailureHook for CapturingHook {
    async fn on_process_failure(
        &self,
        _context: &DispatchContext,
        _error: &anyhow::Error,
    ) -> BrokerAction {
        self.seen.record(get_message_local_item::<CorrelationId>());
        BrokerAction::Ack
    }
}

#[tokio::test]
async fn message_local_items_set_by_the_handler_are_visible_to_the_failure_hook_of_the_same_delivery(
) {
    async fn handler(
        previous: Service<Recorder<Option<CorrelationId>>>,
        message: Message<ExampleMessage>,
    ) -> Result<(), anyhow::Error> {
        // Nothing leaks from the previous delivery.
        previous.record(get_message_local_item::<CorrelationId>());
        set_message_local_item(CorrelationId(message.name.clone()));
        anyhow::bail!("Failed to process {}", message.name)
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    broker.declare_queue(&queue);
    let previous = Arc::new(Recorder::<Option<CorrelationId>>::default());
    let seen = Arc::new(Recorder::<Option<CorrelationId>>::default());
    let mut services = ServiceCollection::new();
    services.add_singleton(previous.clone());
    let mut descriptor = ConsumerDescriptor::new(&queue, broker.clone(), handler).unwrap();
    descriptor
        .on_process_failure(CapturingHook { seen: seen.clone() })
        .unwrap();
    let _consumer = start(&mut descriptor, services.build()).await;
    let first = ExampleMessage::fake();
    let second = ExampleMessage::fake();

    // Act
    broker.enqueue(&queue, json_properties(), first.to_json());
    broker.enqueue(&queue, json_properties(), second.to_json());

    // Assert
    let settlements = wait_for_settlements(&broker, 2).await;
    assert!(settlements
        .iter()
        .all(|s| matches!(s, BrokerOperation::Ack { .. })));
    assert_eq!(previous.items(), vec![None, None]);
    assert_eq!(
        seen.items(),
        vec![
            Some(CorrelationId(first.name)),
            Some(CorrelationId(second.name))
        ]
    );
}
