//! `carrot-dispatch` turns plain `async fn`s into RabbitMQ consumers, on top of [`lapin`].
//!
//! A handler declares what it needs through its parameters and what happened through its
//! return type; the runtime takes care of deserializing bodies, resolving services,
//! acknowledging deliveries and managing connections and channels.
//!
//! [`ConsumerServer`](crate::consumers::ConsumerServer) and
//! [`ConsumerDescriptor`](crate::consumers::ConsumerDescriptor) are the best starting
//! points to learn more about what `carrot-dispatch` provides.
//!
//! ## Example
//!
//! ```rust
//! use carrot_dispatch::amqp::{BasicProperties, InMemoryBroker};
//! use carrot_dispatch::consumers::{BrokerAction, ConsumerDescriptor, ConsumerServer, Message};
//! use carrot_dispatch::services::ServiceCollection;
//!
//! #[derive(serde::Deserialize)]
//! struct Greeting {
//!     name: String,
//! }
//!
//! async fn greet(greeting: Message<Greeting>) -> Result<BrokerAction, anyhow::Error> {
//!     anyhow::ensure!(!greeting.name.is_empty(), "nobody to greet");
//!     Ok(BrokerAction::Ack)
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), anyhow::Error> {
//! let broker = InMemoryBroker::new();
//! broker.declare_queue("greetings");
//!
//! let mut server = ConsumerServer::new(ServiceCollection::new().build());
//! server.add(ConsumerDescriptor::new("greetings", broker.clone(), greet)?)?;
//! server.start().await?;
//!
//! broker.enqueue("greetings", BasicProperties::default(), r#"{"name":"Ferris"}"#);
//! # tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//! server.stop().await;
//! server.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod amqp;
pub mod consumers;
pub mod serialization;
pub mod services;
