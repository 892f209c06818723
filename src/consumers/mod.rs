//! Facilities to consume messages from queues. Check out [`ConsumerServer`] and
//! [`ConsumerDescriptor`] as a starting point.
//!
//! # From a function to a consumer
//!
//! 1. A handler is an `async fn` whose parameters say what it needs: the message body
//!    ([`Message`]), headers ([`Header`]), services ([`Service`]), delivery metadata
//!    ([`QueueName`], [`RoutingKey`], ...). See the [`binding`] module for the full list.
//! 2. A [`Dispatcher`] checks the handler once, when a [`ConsumerDescriptor`] is created.
//! 3. A [`QueueConsumer`], built from the descriptor, consumes the queue and turns every
//!    handler outcome into a [`BrokerAction`]: ack, nack, reject, reply, forward, delay.
pub use action::{BrokerAction, Forward};
pub use binding::{
    ArgumentBinding, ChannelHandle, Connection, ConsumerTag, ContextValue, DeliveryMode,
    ExchangeName, FromDispatchContext, Header, HeaderKey, KeyedService, Message,
    OptionalMessage, QueueName, RoutingKey, Service, ServiceKey,
};
pub use consumer::{ConsumerState, QueueConsumer};
pub use context::{DispatchContext, LifetimeToken};
pub use descriptor::ConsumerDescriptor;
pub use dispatcher::Dispatcher;
pub use error::{ActionError, BindError, BuildError, ConsumerError, DescriptorError};
pub use extensions::{get_message_local_item, set_message_local_item};
pub use failure_hook::{ProcessFailureHook, SerializationFailureHook};
pub use handler::{
    sync_handler, Handler, HandlerOutcome, HandlerOutput, ResultAdapter, SyncArgs, SyncHandler,
};
pub use pre_start_hook::ConsumerPreStartHook;
pub use server::ConsumerServer;
pub use settings::{ConsumerSettings, QueueCheckRetry};

mod action;
pub mod binding;
mod consumer;
mod context;
mod descriptor;
mod dispatcher;
mod error;
mod extensions;
mod failure_hook;
mod handler;
pub mod hooks;
mod pre_start_hook;
mod server;
mod settings;
