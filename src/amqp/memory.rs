//! An in-process broker.
//!
//! [`InMemoryBroker`] implements [`ConnectionProvider`], [`BrokerConnection`] and
//! [`BrokerChannel`] without a network hop. It supports:
//! - the default exchange plus declared exchanges (fanout, or exact routing key match
//!   for every other kind);
//! - per-channel prefetch and delivery tags, round-robin across consumers;
//! - requeue on nack/reject and dead-lettering through `x-dead-letter-exchange`;
//! - an ordered log of every operation, for assertions.
//!
//! Message TTLs are recorded but never expire.
use crate::amqp::broker::{
    BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent, ConnectionProvider,
    DeliveryStream, Envelope,
};
use amq_protocol_types::{AMQPValue, DeliveryTag, FieldTable};
use futures_util::StreamExt;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::{BasicProperties, ExchangeKind};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};

const EVENT_BUFFER: usize = 16;

/// Something the broker was asked to do, in the order it was asked.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOperation {
    QueueDeclare {
        queue: String,
        passive: bool,
    },
    ExchangeDeclare {
        exchange: String,
        kind: ExchangeKind,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Qos {
        prefetch_count: u16,
    },
    Consume {
        queue: String,
        consumer_tag: String,
        exclusive: bool,
        arguments: FieldTable,
    },
    Cancel {
        consumer_tag: String,
    },
    Ack {
        queue: String,
        delivery_tag: DeliveryTag,
    },
    Nack {
        queue: String,
        delivery_tag: DeliveryTag,
        requeue: bool,
    },
    Reject {
        queue: String,
        delivery_tag: DeliveryTag,
        requeue: bool,
    },
    Publish(PublishedMessage),
    ChannelClosed,
    ConnectionClosed,
}

impl BrokerOperation {
    /// `true` for acks, nacks and rejects.
    pub fn is_settlement(&self) -> bool {
        matches!(
            self,
            Self::Ack { .. } | Self::Nack { .. } | Self::Reject { .. }
        )
    }
}

/// A message as it was handed to `basic_publish`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// A message waiting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// A broker living in the current process.
///
/// Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    // Presence in the map means open.
    connections: HashMap<u64, broadcast::Sender<ConnectionEvent>>,
    channels: HashMap<u64, ChannelState>,
    operations: Vec<BrokerOperation>,
    next_id: u64,
    connections_opened: usize,
    failing_connects: usize,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    consumers: Vec<Subscription>,
    arguments: FieldTable,
    next_consumer: usize,
}

struct Subscription {
    consumer_tag: String,
    channel_id: u64,
    exclusive: bool,
    sender: mpsc::UnboundedSender<Result<Envelope, BrokerError>>,
}

struct ExchangeState {
    kind: ExchangeKind,
    // (routing key, queue)
    bindings: Vec<(String, String)>,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    next_delivery_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, (String, QueuedMessage)>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

enum Settlement {
    Ack,
    Requeue,
    Discard,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel(&mut self, id: u64) -> Result<&mut ChannelState, BrokerError> {
        self.channels.get_mut(&id).ok_or(BrokerError::ChannelClosed)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }
        let state = self.exchanges.get(exchange).ok_or_else(|| {
            BrokerError::Other(anyhow::anyhow!("Exchange `{}` does not exist", exchange))
        })?;
        Ok(state
            .bindings
            .iter()
            .filter(|(key, _)| state.kind == ExchangeKind::Fanout || key == routing_key)
            .map(|(_, queue)| queue.clone())
            .collect())
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        for queue in self.route(exchange, routing_key)? {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.messages.push_back(QueuedMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    properties: properties.clone(),
                    body: body.clone(),
                    redelivered: false,
                });
            }
        }
        self.dispatch();
        Ok(())
    }

    /// Push ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            loop {
                let Some(queue) = self.queues.get_mut(&name) else {
                    break;
                };
                if queue.messages.is_empty() || queue.consumers.is_empty() {
                    break;
                }
                let count = queue.consumers.len();
                let channels = &self.channels;
                let pick = (0..count)
                    .map(|i| (queue.next_consumer + i) % count)
                    .find(|&i| {
                        channels
                            .get(&queue.consumers[i].channel_id)
                            .map_or(false, ChannelState::has_capacity)
                    });
                let Some(index) = pick else {
                    break;
                };
                let Some(message) = queue.messages.pop_front() else {
                    break;
                };
                queue.next_consumer = (index + 1) % count;
                let subscription = &queue.consumers[index];
                let Some(channel) = self.channels.get_mut(&subscription.channel_id) else {
                    break;
                };
                channel.next_delivery_tag += 1;
                let delivery_tag = channel.next_delivery_tag;
                let envelope = Envelope {
                    delivery_tag,
                    exchange: message.exchange.clone().into(),
                    routing_key: message.routing_key.clone().into(),
                    consumer_tag: subscription.consumer_tag.clone().into(),
                    redelivered: message.redelivered,
                    properties: message.properties.clone(),
                    data: message.body.clone(),
                };
                if subscription.sender.send(Ok(envelope)).is_err() {
                    // The stream was dropped without a cancel.
                    queue.consumers.remove(index);
                    queue.messages.push_front(message);
                    continue;
                }
                channel.unacked.insert(delivery_tag, (name.clone(), message));
            }
        }
    }

    fn settle(
        &mut self,
        channel_id: u64,
        delivery_tag: DeliveryTag,
        settlement: Settlement,
    ) -> Result<String, BrokerError> {
        let (queue, mut message) = self
            .channel(channel_id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| {
                BrokerError::Other(anyhow::anyhow!("Unknown delivery tag {}", delivery_tag))
            })?;
        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                if let Some(state) = self.queues.get_mut(&queue) {
                    message.redelivered = true;
                    state.messages.push_front(message);
                }
            }
            Settlement::Discard => self.dead_letter(&queue, message),
        }
        self.dispatch();
        Ok(queue)
    }

    fn dead_letter(&mut self, queue: &str, message: QueuedMessage) {
        let Some(arguments) = self.queues.get(queue).map(|q| q.arguments.clone()) else {
            return;
        };
        let Some(exchange) = string_argument(&arguments, "x-dead-letter-exchange") else {
            return;
        };
        let routing_key = string_argument(&arguments, "x-dead-letter-routing-key")
            .unwrap_or_else(|| message.routing_key.clone());
        // Unroutable dead letters are dropped, as RabbitMq does.
        let _ = self.publish(&exchange, &routing_key, message.properties, message.body);
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };
        for (queue, mut message) in channel.unacked.into_values().rev() {
            if let Some(state) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                state.messages.push_front(message);
            }
        }
        for state in self.queues.values_mut() {
            state.consumers.retain(|s| s.channel_id != channel_id);
        }
        self.operations.push(BrokerOperation::ChannelClosed);
        self.dispatch();
    }

    fn close_connection(&mut self, connection_id: u64, shutdown_reason: Option<String>) {
        let Some(events) = self.connections.remove(&connection_id) else {
            return;
        };
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id);
        }
        if let Some(reason) = shutdown_reason {
            let _ = events.send(ConnectionEvent::Shutdown { reason });
        }
        self.operations.push(BrokerOperation::ConnectionClosed);
    }
}

fn string_argument(arguments: &FieldTable, key: &str) -> Option<String> {
    match arguments.inner().get(key)? {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a queue with no arguments, if it does not exist yet.
    pub fn declare_queue(&self, queue: &str) {
        self.state().queues.entry(queue.to_owned()).or_default();
    }

    /// Publish a message to `queue` through the default exchange.
    pub fn enqueue(&self, queue: &str, properties: BasicProperties, body: impl Into<Vec<u8>>) {
        let _ = self.state().publish("", queue, properties, body.into());
    }

    /// Messages ready for delivery in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages delivered from `queue` and not settled yet.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn operations(&self) -> Vec<BrokerOperation> {
        self.state().operations.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state()
            .operations
            .iter()
            .filter_map(|op| match op {
                BrokerOperation::Publish(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// How many connections were opened so far.
    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.state().channels.len()
    }

    /// Make the next `attempts` connection attempts fail.
    pub fn fail_next_connects(&self, attempts: usize) {
        self.state().failing_connects = attempts;
    }

    /// Send `event` to every open connection.
    pub fn emit(&self, event: ConnectionEvent) {
        for events in self.state().connections.values() {
            let _ = events.send(event.clone());
        }
    }

    /// Close every open connection as the broker would on a node failure.
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id, Some(reason.to_owned()));
        }
    }

    /// Close every open channel, leaving connections up.
    pub fn close_channels(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
    }
}

#[async_trait::async_trait]
impl ConnectionProvider for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.state();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::ConnectionClosed);
        }
        let id = state.next_id();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        state.connections.insert(id, events);
        state.connections_opened += 1;
        Ok(Arc::new(InMemoryConnection {
            id,
            broker: self.clone(),
        }))
    }
}

/// A connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait::async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.state();
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                next_delivery_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(InMemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        match self.broker.state().connections.get(&self.id) {
            Some(events) => events.subscribe(),
            // The sender is dropped right away: the receiver reports `Closed`.
            None => broadcast::channel(1).1,
        }
    }

    fn is_open(&self) -> bool {
        self.broker.state().connections.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.state().close_connection(self.id, None);
        Ok(())
    }
}

/// A channel on an [`InMemoryConnection`].
pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait::async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        state.operations.push(BrokerOperation::QueueDeclare {
            queue: queue.to_owned(),
            passive: options.passive,
        });
        if options.passive {
            return match state.queues.contains_key(queue) {
                true => Ok(()),
                false => Err(BrokerError::QueueNotFound(queue.to_owned())),
            };
        }
        state
            .queues
            .entry(queue.to_owned())
            .or_insert_with(|| QueueState {
                arguments,
                ..QueueState::default()
            });
        Ok(())
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        state.operations.push(BrokerOperation::ExchangeDeclare {
            exchange: exchange.to_owned(),
            kind: kind.clone(),
        });
        if options.passive {
            return match state.exchanges.contains_key(exchange) {
                true => Ok(()),
                false => Err(BrokerError::Other(anyhow::anyhow!(
                    "Exchange `{}` does not exist",
                    exchange
                ))),
            };
        }
        state
            .exchanges
            .entry(exchange.to_owned())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: QueueBindOptions,
        _arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        state.operations.push(BrokerOperation::QueueBind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_owned()));
        }
        let exchange_state = state.exchanges.get_mut(exchange).ok_or_else(|| {
            BrokerError::Other(anyhow::anyhow!("Exchange `{}` does not exist", exchange))
        })?;
        let binding = (routing_key.to_owned(), queue.to_owned());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel(self.id)?.prefetch = prefetch_count;
        state
            .operations
            .push(BrokerOperation::Qos { prefetch_count });
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        let consumer_tag = match consumer_tag {
            "" => format!("amq.ctag-{}", uuid::Uuid::new_v4()),
            tag => tag.to_owned(),
        };
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_owned()))?;
        if queue_state.consumers.iter().any(|s| s.exclusive)
            || (exclusive && !queue_state.consumers.is_empty())
        {
            return Err(BrokerError::Other(anyhow::anyhow!(
                "Queue `{}` is in exclusive use",
                queue
            )));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        queue_state.consumers.push(Subscription {
            consumer_tag: consumer_tag.clone(),
            channel_id: self.id,
            exclusive,
            sender,
        });
        state.operations.push(BrokerOperation::Consume {
            queue: queue.to_owned(),
            consumer_tag,
            exclusive,
            arguments,
        });
        state.dispatch();

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        });
        Ok(stream.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|s| !(s.channel_id == self.id && s.consumer_tag == consumer_tag));
        }
        state.operations.push(BrokerOperation::Cancel {
            consumer_tag: consumer_tag.to_owned(),
        });
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        let queue = state.settle(self.id, delivery_tag, Settlement::Ack)?;
        state.operations.push(BrokerOperation::Ack {
            queue,
            delivery_tag,
        });
        Ok(())
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        };
        let mut state = self.broker.state();
        let queue = state.settle(self.id, delivery_tag, settlement)?;
        state.operations.push(BrokerOperation::Nack {
            queue,
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        };
        let mut state = self.broker.state();
        let queue = state.settle(self.id, delivery_tag, settlement)?;
        state.operations.push(BrokerOperation::Reject {
            queue,
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        state
            .operations
            .push(BrokerOperation::Publish(PublishedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                mandatory,
                properties: properties.clone(),
                body: body.clone(),
            }));
        state.publish(exchange, routing_key, properties, body)
    }

    fn is_open(&self) -> bool {
        self.broker.state().channels.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.state().close_channel(self.id);
        Ok(())
    }
}
