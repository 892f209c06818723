//! [`BrokerConnection`] and [`BrokerChannel`] on top of `lapin`.
use crate::amqp::broker::{
    BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent, DeliveryStream, Envelope,
};
use amq_protocol_types::{DeliveryTag, FieldTable};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::{BasicProperties, ExchangeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 16;
const BLOCKED_POLL_INTERVAL: Duration = Duration::from_secs(1);
// AMQP reply code for a clean close.
const REPLY_SUCCESS: u16 = 200;

/// A `lapin` connection.
///
/// `lapin` only exposes a callback for connection errors; blocked/unblocked transitions
/// are detected by watching the connection status.
pub struct LapinConnection {
    connection: Arc<lapin::Connection>,
    events: broadcast::Sender<ConnectionEvent>,
    blocked_watcher: JoinHandle<()>,
}

impl LapinConnection {
    pub fn new(connection: lapin::Connection) -> Self {
        let connection = Arc::new(connection);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let on_error = events.clone();
        connection.on_error(move |e| {
            tracing::warn!("RabbitMQ broken connection: {:?}", e);
            let _ = on_error.send(ConnectionEvent::Shutdown {
                reason: e.to_string(),
            });
        });

        let blocked_watcher = tokio::spawn(watch_blocked(
            Arc::downgrade(&connection),
            events.clone(),
        ));

        Self {
            connection,
            events,
            blocked_watcher,
        }
    }

    /// The underlying `lapin` connection.
    pub fn raw(&self) -> &lapin::Connection {
        &self.connection
    }
}

impl Drop for LapinConnection {
    fn drop(&mut self) {
        self.blocked_watcher.abort();
    }
}

async fn watch_blocked(
    connection: std::sync::Weak<lapin::Connection>,
    events: broadcast::Sender<ConnectionEvent>,
) {
    let mut was_blocked = false;
    let mut interval = tokio::time::interval(BLOCKED_POLL_INTERVAL);
    loop {
        interval.tick().await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        let blocked = connection.status().blocked();
        if blocked != was_blocked {
            let event = if blocked {
                ConnectionEvent::Blocked {
                    reason: "connection blocked by the broker".into(),
                }
            } else {
                ConnectionEvent::Unblocked
            };
            let _ = events.send(event);
            was_blocked = blocked;
        }
    }
}

#[async_trait::async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(LapinChannel {
            channel,
            connection: self.connection.clone(),
        }))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection.close(REPLY_SUCCESS, "closed by consumer").await?;
        Ok(())
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    channel: lapin::Channel,
    // A failed passive declare closes the channel it was issued on: checks run on a
    // throwaway channel opened on this connection.
    connection: Arc<lapin::Connection>,
}

impl LapinChannel {
    /// The underlying `lapin` channel.
    pub fn raw(&self) -> &lapin::Channel {
        &self.channel
    }
}

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(queue, options, arguments)
            .await
            .map_err(|e| match e {
                lapin::Error::ProtocolError(ref amqp) if amqp.get_id() == 404 => {
                    BrokerError::QueueNotFound(queue.to_owned())
                }
                e => e.into(),
            })?;
        Ok(())
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<(), BrokerError> {
        let probe = self.connection.create_channel().await?;
        let outcome = probe
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        match outcome {
            Ok(_) => {
                let _ = probe.close(REPLY_SUCCESS, "queue check done").await;
                Ok(())
            }
            Err(lapin::Error::ProtocolError(amqp)) if amqp.get_id() == 404 => {
                Err(BrokerError::QueueNotFound(queue.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(exchange, kind, options, arguments)
            .await?;
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive,
                    ..BasicConsumeOptions::default()
                },
                arguments,
            )
            .await?;
        let consumer_tag = consumer.tag();
        let stream = consumer.map(move |delivery| {
            delivery
                .map(|d| Envelope {
                    delivery_tag: d.delivery_tag,
                    exchange: d.exchange,
                    routing_key: d.routing_key,
                    consumer_tag: consumer_tag.clone(),
                    redelivered: d.redelivered,
                    properties: d.properties,
                    data: d.data,
                })
                .map_err(BrokerError::from)
        });
        Ok(stream.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
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
        let options = BasicPublishOptions {
            mandatory,
            // The immediate flag was dropped in RabbitMQ 3.0 - setting `true` causes a not-supported error
            immediate: false,
        };
        self.channel
            .basic_publish(exchange, routing_key, options, &body, properties)
            .await?
            .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel.close(REPLY_SUCCESS, "closed by consumer").await?;
        Ok(())
    }
}
