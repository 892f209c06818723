//! The broker surface the consumer runtime is written against.
//!
//! [`BrokerConnection`] and [`BrokerChannel`] capture the handful of AMQP primitives a
//! [`QueueConsumer`] needs: open a channel, check a queue, set QoS, consume, settle,
//! publish and cancel. `lapin` backs them in production (see [`LapinConnection`]);
//! [`InMemoryBroker`] backs them in tests.
//!
//! [`QueueConsumer`]: crate::consumers::QueueConsumer
//! [`LapinConnection`]: crate::amqp::LapinConnection
//! [`InMemoryBroker`]: crate::amqp::InMemoryBroker
use amq_protocol_types::{DeliveryTag, FieldTable, ShortString};
use futures_util::stream::BoxStream;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::{BasicProperties, ExchangeKind};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A message delivered to a consumer subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The delivery tag of the message, scoped to the channel it was delivered on.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// The tag of the subscription the message was delivered to.
    pub consumer_tag: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

/// The stream of deliveries returned by [`BrokerChannel::basic_consume`].
///
/// The stream ends when the subscription is cancelled or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Envelope, BrokerError>>;

/// Connection-level notifications.
///
/// They are observability signals only: nothing in this crate reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker is applying back-pressure (e.g. memory or disk alarm).
    Blocked { reason: String },
    /// The broker lifted back-pressure.
    Unblocked,
    /// The connection is gone.
    Shutdown { reason: String },
}

/// Errors raised by the broker collaborators.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("The channel is closed")]
    ChannelClosed,
    #[error("The connection is closed")]
    ConnectionClosed,
    #[error("Queue `{0}` does not exist")]
    QueueNotFound(String),
    #[error("The broker did not answer within the configured timeout")]
    Timeout,
    #[error(transparent)]
    Lapin(#[from] lapin::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrokerError {
    /// `true` if the error means the channel can no longer be used to settle messages.
    pub fn is_channel_closed(&self) -> bool {
        match self {
            Self::ChannelClosed | Self::ConnectionClosed => true,
            Self::Lapin(e) => matches!(
                e,
                lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
            ),
            _ => false,
        }
    }
}

/// An open connection to the broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Open a new channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Subscribe to connection-level events.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// An open channel.
///
/// Implementations must tolerate concurrent calls: results executed for concurrent
/// deliveries publish and settle on the same channel.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    /// Fails with [`BrokerError::QueueNotFound`] if the queue does not exist.
    async fn queue_declare_passive(&self, queue: &str) -> Result<(), BrokerError> {
        self.queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Start a subscription with manual acknowledgements.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: DeliveryTag, requeue: bool)
        -> Result<(), BrokerError>;

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Hands out connections to a [`QueueConsumer`](crate::consumers::QueueConsumer).
///
/// Whether two calls return the same connection decides who closes it: a consumer only
/// closes connections that are not shared.
#[async_trait::async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// Opens the channel a [`QueueConsumer`](crate::consumers::QueueConsumer) consumes on.
#[async_trait::async_trait]
pub trait ChannelProvider: Send + Sync + 'static {
    async fn create_channel(
        &self,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// Opens a fresh channel on the given connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultChannelProvider;

#[async_trait::async_trait]
impl ChannelProvider for DefaultChannelProvider {
    async fn create_channel(
        &self,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        connection.create_channel().await
    }
}

/// Identity comparison between two connection handles.
pub fn same_connection(a: &Arc<dyn BrokerConnection>, b: &Arc<dyn BrokerConnection>) -> bool {
    // Compare data pointers only: vtable pointers are not guaranteed to be unique.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[async_trait::async_trait]
impl<P: ConnectionProvider> ConnectionProvider for Arc<P> {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.as_ref().connect().await
    }
}
