//! Everything that talks to the broker.
//!
//! The consumer runtime only sees [`BrokerConnection`] and [`BrokerChannel`]:
//! [`ConnectionFactory`] provides them over `lapin`, [`InMemoryBroker`] in-process.

mod broker;
pub mod configuration;
pub mod convenience;
mod factory;
mod lapin_broker;
mod memory;
mod shared;

pub use broker::{
    same_connection, BrokerChannel, BrokerConnection, BrokerError, ChannelProvider,
    ConnectionEvent, ConnectionProvider, DefaultChannelProvider, DeliveryStream, Envelope,
};
pub use factory::ConnectionFactory;
pub use lapin_broker::{LapinChannel, LapinConnection};
pub use memory::{
    BrokerOperation, InMemoryBroker, InMemoryChannel, InMemoryConnection, PublishedMessage,
    QueuedMessage,
};
pub use shared::SharedConnection;

pub use lapin::{options, types, BasicProperties, ExchangeKind};
