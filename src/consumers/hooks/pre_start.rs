//! A collection of pre-start hooks to set up the topology a consumer relies on.
//!
//! ## Examples of queue/exchange setups
//!
//! ```
//! use carrot_dispatch::consumers::hooks::pre_start::{
//!     Bind, DeclareDurableExchange, DeclareDurableQueue, ExchangeKind, ExistingExchange,
//!     Headers, RoutingKey, WithDeadLetterQueue, WithDelayedRetryQueue,
//! };
//!
//! // a durable queue bound to a new topic exchange, with a dead letter queue for
//! // rejected messages
//! let pre_start_hook = Bind {
//!     exchange: DeclareDurableExchange {
//!         name: "orders".to_owned(),
//!         kind: ExchangeKind::Topic,
//!     },
//!     queue: WithDeadLetterQueue(DeclareDurableQueue),
//!     binding: vec![RoutingKey::from("order.created"), RoutingKey::from("order.paid")],
//! };
//! # drop(pre_start_hook);
//!
//! // a durable queue publishers send to directly, plus the `{queue}-delayed` queue
//! // `BrokerAction::Delayed` re-publishes to
//! let pre_start_hook = WithDelayedRetryQueue(DeclareDurableQueue);
//! # drop(pre_start_hook);
//!
//! // a queue bound to an existing headers exchange
//! let pre_start_hook = Bind {
//!     exchange: ExistingExchange {
//!         name: "payments".to_owned(),
//!     },
//!     queue: DeclareDurableQueue,
//!     binding: Headers::All(vec![("currency".to_owned(), "EUR".to_owned())]),
//! };
//! # drop(pre_start_hook);
//! ```
use crate::amqp::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use crate::amqp::types::{AMQPValue, FieldTable, LongString, ShortString};
use crate::amqp::BrokerChannel;
use crate::consumers::ConsumerPreStartHook;
use async_trait::async_trait;
use std::collections::BTreeMap;

pub use lapin::ExchangeKind;

async fn declare_exchange(
    channel: &dyn BrokerChannel,
    name: &str,
    kind: ExchangeKind,
    durable: bool,
) -> Result<(), anyhow::Error> {
    let options = ExchangeDeclareOptions {
        durable,
        ..ExchangeDeclareOptions::default()
    };
    channel
        .exchange_declare(name, kind, options, FieldTable::default())
        .await?;
    Ok(())
}

async fn declare_queue(
    channel: &dyn BrokerChannel,
    name: &str,
    durable: bool,
    arguments: FieldTable,
) -> Result<(), anyhow::Error> {
    let options = QueueDeclareOptions {
        durable,
        ..QueueDeclareOptions::default()
    };
    channel.queue_declare(name, options, arguments).await?;
    Ok(())
}

#[async_trait]
/// Defines how to set up an exchange.
pub trait ExchangeSetup: Send + Sync + 'static {
    fn exchange_name(&self) -> &str;

    /// Ensures the exchange is set up.
    async fn setup_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), anyhow::Error>;
}

/// Declares a durable exchange.
pub struct DeclareDurableExchange {
    pub name: String,
    pub kind: ExchangeKind,
}

/// Declares a transient exchange: it does not survive a broker restart.
pub struct DeclareExchange {
    pub name: String,
    pub kind: ExchangeKind,
}

/// Uses an exchange someone else declared.
pub struct ExistingExchange {
    pub name: String,
}

#[async_trait]
impl ExchangeSetup for DeclareDurableExchange {
    fn exchange_name(&self) -> &str {
        &self.name
    }

    async fn setup_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), anyhow::Error> {
        declare_exchange(channel, &self.name, self.kind.clone(), true).await
    }
}

#[async_trait]
impl ExchangeSetup for DeclareExchange {
    fn exchange_name(&self) -> &str {
        &self.name
    }

    async fn setup_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), anyhow::Error> {
        declare_exchange(channel, &self.name, self.kind.clone(), false).await
    }
}

#[async_trait]
impl ExchangeSetup for ExistingExchange {
    fn exchange_name(&self) -> &str {
        &self.name
    }

    async fn setup_exchange(&self, _channel: &dyn BrokerChannel) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Declares the consumer's queue as durable.
#[derive(Clone)]
pub struct DeclareDurableQueue;

/// Declares the consumer's queue as transient.
#[derive(Clone)]
pub struct DeclareQueue;

#[async_trait]
impl ConsumerPreStartHook for DeclareDurableQueue {
    async fn run(
        &self,
        channel: &dyn BrokerChannel,
        queue_name: &str,
        queue_args: FieldTable,
    ) -> Result<(), anyhow::Error> {
        declare_queue(channel, queue_name, true, queue_args).await
    }
}

#[async_trait]
impl ConsumerPreStartHook for DeclareQueue {
    async fn run(
        &self,
        channel: &dyn BrokerChannel,
        queue_name: &str,
        queue_args: FieldTable,
    ) -> Result<(), anyhow::Error> {
        declare_queue(channel, queue_name, false, queue_args).await
    }
}

/// Wraps the queue declaration of another hook with a
/// [dead letter exchange](https://www.rabbitmq.com/dlx.html).
///
/// The fanout exchange `<queue_name>.deadletter` and the durable queue of the same name
/// are declared and bound, and the exchange is set as `x-dead-letter-exchange` of the
/// consumer's queue.
///
/// Queue arguments are immutable: switching an existing queue to
/// `WithDeadLetterQueue<_>` requires rolling a new queue.
pub struct WithDeadLetterQueue<H: ConsumerPreStartHook>(pub H);

#[async_trait]
impl<H: ConsumerPreStartHook> ConsumerPreStartHook for WithDeadLetterQueue<H> {
    async fn run(
        &self,
        channel: &dyn BrokerChannel,
        queue_name: &str,
        mut queue_args: FieldTable,
    ) -> Result<(), anyhow::Error> {
        let dead_letter = format!("{queue_name}.deadletter");
        Bind {
            exchange: DeclareDurableExchange {
                name: dead_letter.clone(),
                kind: ExchangeKind::Fanout,
            },
            queue: DeclareDurableQueue,
            binding: RoutingKey(String::new()),
        }
        .run(channel, &dead_letter, FieldTable::default())
        .await?;

        queue_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dead_letter.into()),
        );
        self.0.run(channel, queue_name, queue_args).await
    }
}

/// Declares `<queue_name>-delayed` next to the queue declared by the inner hook.
///
/// Messages expiring in the delayed queue are dead-lettered, through the default
/// exchange, back to the consumer's queue. This is the topology
/// [`BrokerAction::Delayed`](crate::consumers::BrokerAction::Delayed) and
/// [`RetryWithDelay`](crate::consumers::hooks::failure::RetryWithDelay) rely on.
pub struct WithDelayedRetryQueue<H: ConsumerPreStartHook>(pub H);

#[async_trait]
impl<H: ConsumerPreStartHook> ConsumerPreStartHook for WithDelayedRetryQueue<H> {
    async fn run(
        &self,
        channel: &dyn BrokerChannel,
        queue_name: &str,
        queue_args: FieldTable,
    ) -> Result<(), anyhow::Error> {
        self.0.run(channel, queue_name, queue_args).await?;

        let mut delayed_args = FieldTable::default();
        delayed_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        delayed_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(queue_name.into()),
        );
        declare_queue(channel, &format!("{queue_name}-delayed"), true, delayed_args).await
    }
}

/// Declares the exchange, runs the `queue` hook, then binds the two with `binding`.
pub struct Bind<Exchange: ExchangeSetup, Queue: ConsumerPreStartHook, Binds: Binding> {
    pub exchange: Exchange,
    pub queue: Queue,
    pub binding: Binds,
}

#[async_trait]
impl<E: ExchangeSetup, Q: ConsumerPreStartHook, B: Binding> ConsumerPreStartHook for Bind<E, Q, B> {
    async fn run(
        &self,
        channel: &dyn BrokerChannel,
        queue_name: &str,
        queue_args: FieldTable,
    ) -> Result<(), anyhow::Error> {
        self.exchange.setup_exchange(channel).await?;
        self.queue.run(channel, queue_name, queue_args).await?;
        self.binding
            .bind(channel, self.exchange.exchange_name(), queue_name)
            .await
    }
}

#[async_trait]
/// Defines how to bind a queue to an exchange.
///
/// * [`Headers`] - for [headers exchanges](https://www.rabbitmq.com/tutorials/amqp-concepts.html#exchange-headers)
/// * [`RoutingKey`] - for direct and topic exchanges.
/// * `Vec<_>` - several bindings, e.g. `Vec<RoutingKey>`.
pub trait Binding: Send + Sync + 'static {
    async fn bind(
        &self,
        channel: &dyn BrokerChannel,
        exchange_name: &str,
        queue_name: &str,
    ) -> Result<(), anyhow::Error>;
}

/// Header values to match, as `(key, value)` pairs.
#[derive(Clone)]
pub enum Headers {
    /// `x-match: all`
    All(Vec<(String, String)>),
    /// `x-match: any`
    Any(Vec<(String, String)>),
}

#[async_trait]
impl Binding for Headers {
    async fn bind(
        &self,
        channel: &dyn BrokerChannel,
        exchange_name: &str,
        queue_name: &str,
    ) -> Result<(), anyhow::Error> {
        let (headers, x_match) = match self {
            Self::All(headers) => (headers, "all"),
            Self::Any(headers) => (headers, "any"),
        };
        let mut arguments: BTreeMap<ShortString, AMQPValue> = headers
            .iter()
            .map(|(key, value)| {
                (
                    key.as_str().into(),
                    LongString::from(value.as_str()).into(),
                )
            })
            .collect();
        arguments.insert("x-match".into(), LongString::from(x_match).into());

        channel
            .queue_bind(
                queue_name,
                exchange_name,
                "",
                QueueBindOptions::default(),
                arguments.into(),
            )
            .await?;
        Ok(())
    }
}

/// Binds with a routing key.
pub struct RoutingKey(pub String);

impl From<&str> for RoutingKey {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for RoutingKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[async_trait]
impl Binding for RoutingKey {
    async fn bind(
        &self,
        channel: &dyn BrokerChannel,
        exchange_name: &str,
        queue_name: &str,
    ) -> Result<(), anyhow::Error> {
        channel
            .queue_bind(
                queue_name,
                exchange_name,
                &self.0,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<B: Binding> Binding for Vec<B> {
    async fn bind(
        &self,
        channel: &dyn BrokerChannel,
        exchange_name: &str,
        queue_name: &str,
    ) -> Result<(), anyhow::Error> {
        for binding in self {
            binding.bind(channel, exchange_name, queue_name).await?;
        }
        Ok(())
    }
}

/// Makes the queue a [priority queue](https://www.rabbitmq.com/priority.html).
///
/// Like every queue argument, the maximum priority cannot be changed on an existing queue.
pub struct WithPriority<H: ConsumerPreStartHook> {
    pub queue: H,
    /// Between 1 and 255. Every level has a memory and CPU cost: keep it small.
    pub priority: u8,
}

#[async_trait]
impl<H: ConsumerPreStartHook> ConsumerPreStartHook for WithPriority<H> {
    async fn run(
        &self,
        channel: &dyn BrokerChannel,
        queue_name: &str,
        mut queue_args: FieldTable,
    ) -> Result<(), anyhow::Error> {
        queue_args.insert(
            "x-max-priority".into(),
            AMQPValue::ShortShortUInt(self.priority),
        );
        self.queue.run(channel, queue_name, queue_args).await
    }
}
