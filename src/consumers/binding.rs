//! Handler arguments.
//!
//! Every handler parameter implements [`FromDispatchContext`]. The trait has two halves:
//! - [`FromDispatchContext::binding`] describes, once, where the value comes from. The
//!   descriptions of all parameters are checked when the handler is registered (exactly
//!   one message body, no unsupported parameter type);
//! - [`FromDispatchContext::from_context`] extracts the value for one delivery.
//!
//! | Parameter                     | Value                                               |
//! |-------------------------------|-----------------------------------------------------|
//! | [`Message<T>`]                | the deserialized body, which must be present        |
//! | [`OptionalMessage<T>`]        | the deserialized body, `None` if empty              |
//! | [`Header<K>`]                 | the value of the header named by `K`                |
//! | [`Service<T>`]                | `T`, resolved from the delivery's service scope     |
//! | [`KeyedService<T, K>`]        | `T` registered under the key named by `K`           |
//! | [`QueueName`]                 | the queue the delivery was consumed from            |
//! | [`ExchangeName`]              | the exchange the message was published to          |
//! | [`RoutingKey`]                | the routing key the message was published with     |
//! | [`ConsumerTag`]               | the tag of the subscription                         |
//! | [`Connection`]                | the broker connection                               |
//! | [`ChannelHandle`]             | the broker channel                                  |
//! | [`Envelope`]                  | the raw delivery                                    |
//! | [`BasicProperties`]           | the message properties                              |
//! | [`DeliveryMode`]              | transient or persistent                             |
//! | [`ServiceScope`]              | the delivery's service scope                        |
//! | [`LifetimeToken`]             | cancelled when the consumer is disposed             |
//! | `Arc<DispatchContext>`        | all of the above                                    |
//!
//! A bare `String` parameter is refused: wrap it in the newtype saying which string it is.
use crate::amqp::{convenience, BasicProperties, BrokerChannel, BrokerConnection, Envelope};
use crate::consumers::{BindError, DispatchContext, LifetimeToken};
use crate::services::{ServiceError, ServiceScope};
use amq_protocol_types::AMQPValue;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

pub(crate) type DeserializeFn =
    fn(serde_json::Value) -> Result<Box<dyn Any + Send>, serde_json::Error>;
pub(crate) type ServiceCheckFn = fn(&ServiceScope) -> Result<(), ServiceError>;

/// Where the value of a handler parameter comes from.
#[derive(Debug, Clone, Copy)]
pub enum ArgumentBinding {
    /// The deserialized message body.
    Body {
        type_name: &'static str,
        nullable: bool,
        #[doc(hidden)]
        deserialize: DeserializeFn,
    },
    Header {
        name: &'static str,
    },
    Service {
        type_name: &'static str,
        key: Option<&'static str>,
        #[doc(hidden)]
        check: ServiceCheckFn,
    },
    /// Taken from the delivery itself, inferred from the parameter type.
    Context(ContextValue),
    /// Refused when the handler is registered.
    Unsupported {
        type_name: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextValue {
    QueueName,
    Exchange,
    RoutingKey,
    ConsumerTag,
    Connection,
    Channel,
    Envelope,
    Properties,
    DeliveryMode,
    Services,
    Lifetime,
    Context,
}

/// A value that can be passed to a handler.
pub trait FromDispatchContext: Sized + Send + 'static {
    fn binding() -> ArgumentBinding;

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError>;
}

fn deserialize_body<T: DeserializeOwned + Send + 'static>(
    value: serde_json::Value,
) -> Result<Box<dyn Any + Send>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<T>(value)?))
}

/// The message body, deserialized as `T`.
///
/// Deliveries with an empty body are routed to the serialization failure hook: use
/// [`OptionalMessage`] to accept them.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T>(pub T);

impl<T> Message<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Message<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: DeserializeOwned + Send + 'static> FromDispatchContext for Message<T> {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Body {
            type_name: std::any::type_name::<T>(),
            nullable: false,
            deserialize: deserialize_body::<T>,
        }
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        context
            .take_message::<T>()
            .map(Message)
            .ok_or(BindError::BodyUnavailable)
    }
}

/// The message body, `None` if the delivery had an empty body.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionalMessage<T>(pub Option<T>);

impl<T: DeserializeOwned + Send + 'static> FromDispatchContext for OptionalMessage<T> {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Body {
            type_name: std::any::type_name::<T>(),
            nullable: true,
            deserialize: deserialize_body::<T>,
        }
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok(OptionalMessage(context.take_message::<T>()))
    }
}

/// Names a message header, see [`header_key!`](crate::header_key).
pub trait HeaderKey: 'static {
    const NAME: &'static str;
}

/// Declare a [`HeaderKey`].
///
/// ```rust
/// use carrot_dispatch::consumers::Header;
/// use carrot_dispatch::header_key;
///
/// header_key!(pub TenantId => "x-tenant-id");
///
/// async fn handler(tenant: Header<TenantId>) {
///     let _tenant: Option<String> = tenant.as_str().map(|t| t.into_owned());
/// }
/// ```
#[macro_export]
macro_rules! header_key {
    ($(#[$meta:meta])* $vis:vis $name:ident => $header:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        $vis struct $name;

        impl $crate::consumers::HeaderKey for $name {
            const NAME: &'static str = $header;
        }
    };
}

/// The value of the header named by `K`, if the message carries it.
pub struct Header<K> {
    value: Option<AMQPValue>,
    _key: PhantomData<fn() -> K>,
}

impl<K: HeaderKey> Header<K> {
    pub fn name(&self) -> &'static str {
        K::NAME
    }

    pub fn value(&self) -> Option<&AMQPValue> {
        self.value.as_ref()
    }

    /// The header value, if it is a string.
    pub fn as_str(&self) -> Option<std::borrow::Cow<'_, str>> {
        self.value.as_ref().and_then(convenience::header_text)
    }
}

impl<K: HeaderKey> FromDispatchContext for Header<K> {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Header { name: K::NAME }
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        let properties = &context.envelope().properties;
        let value = convenience::header(properties, K::NAME).cloned();
        Ok(Header {
            value,
            _key: PhantomData,
        })
    }
}

fn check_service<T: ?Sized + Send + Sync + 'static>(scope: &ServiceScope) -> Result<(), ServiceError> {
    scope.resolve::<T>().map(drop)
}

fn check_keyed_service<T: ?Sized + Send + Sync + 'static, K: ServiceKey>(
    scope: &ServiceScope,
) -> Result<(), ServiceError> {
    scope.resolve_keyed::<T>(K::KEY).map(drop)
}

/// A service resolved from the delivery's [`ServiceScope`].
pub struct Service<T: ?Sized>(pub Arc<T>);

impl<T: ?Sized> Deref for Service<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized + Send + Sync + 'static> FromDispatchContext for Service<T> {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Service {
            type_name: std::any::type_name::<T>(),
            key: None,
            check: check_service::<T>,
        }
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok(Service(context.services().resolve::<T>()?))
    }
}

/// Names a keyed service registration, see [`service_key!`](crate::service_key).
pub trait ServiceKey: 'static {
    const KEY: &'static str;
}

/// Declare a [`ServiceKey`].
#[macro_export]
macro_rules! service_key {
    ($(#[$meta:meta])* $vis:vis $name:ident => $key:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        $vis struct $name;

        impl $crate::consumers::ServiceKey for $name {
            const KEY: &'static str = $key;
        }
    };
}

/// A service registered under the key named by `K`.
pub struct KeyedService<T: ?Sized, K> {
    service: Arc<T>,
    _key: PhantomData<fn() -> K>,
}

impl<T: ?Sized, K> KeyedService<T, K> {
    pub fn into_inner(self) -> Arc<T> {
        self.service
    }
}

impl<T: ?Sized, K> Deref for KeyedService<T, K> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.service
    }
}

impl<T: ?Sized + Send + Sync + 'static, K: ServiceKey> FromDispatchContext for KeyedService<T, K> {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Service {
            type_name: std::any::type_name::<T>(),
            key: Some(K::KEY),
            check: check_keyed_service::<T, K>,
        }
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok(KeyedService {
            service: context.services().resolve_keyed::<T>(K::KEY)?,
            _key: PhantomData,
        })
    }
}

macro_rules! envelope_string {
    ($(#[$meta:meta])* $name:ident, $value:ident, |$context:ident| $extract:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl FromDispatchContext for $name {
            fn binding() -> ArgumentBinding {
                ArgumentBinding::Context(ContextValue::$value)
            }

            fn from_context($context: &Arc<DispatchContext>) -> Result<Self, BindError> {
                Ok($name($extract))
            }
        }
    };
}

envelope_string!(
    /// The queue the delivery was consumed from.
    QueueName, QueueName, |context| context.queue_name().to_owned()
);
envelope_string!(
    /// The exchange the message was published to. Empty for the default exchange.
    ExchangeName, Exchange, |context| context.envelope().exchange.to_string()
);
envelope_string!(
    /// The routing key the message was published with.
    RoutingKey, RoutingKey, |context| context.envelope().routing_key.to_string()
);
envelope_string!(ConsumerTag, ConsumerTag, |context| context
    .envelope()
    .consumer_tag
    .to_string());

impl FromDispatchContext for String {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Unsupported {
            type_name: "String",
            reason: "ambiguous string parameter, use QueueName, ExchangeName, RoutingKey or ConsumerTag",
        }
    }

    fn from_context(_context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Err(BindError::Unsupported {
            type_name: "String",
            reason: "ambiguous string parameter",
        })
    }
}

/// The connection the delivery was received on.
#[derive(Clone)]
pub struct Connection(pub Arc<dyn BrokerConnection>);

impl FromDispatchContext for Connection {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Context(ContextValue::Connection)
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok(Connection(context.connection().clone()))
    }
}

/// The channel the delivery was received on.
///
/// Settling the delivery through the channel bypasses the handler's return value: the
/// consumer does not know about it and may settle it a second time.
#[derive(Clone)]
pub struct ChannelHandle(pub Arc<dyn BrokerChannel>);

impl FromDispatchContext for ChannelHandle {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Context(ContextValue::Channel)
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok(ChannelHandle(context.channel().clone()))
    }
}

impl FromDispatchContext for Envelope {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Context(ContextValue::Envelope)
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok(context.envelope().clone())
    }
}

impl FromDispatchContext for BasicProperties {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Context(ContextValue::Properties)
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok(context.envelope().properties.clone())
    }
}

/// The AMQP delivery mode of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
    /// The publisher did not set a delivery mode.
    Unspecified,
}

impl From<Option<u8>> for DeliveryMode {
    fn from(mode: Option<u8>) -> Self {
        match mode {
            Some(2) => Self::Persistent,
            Some(1) => Self::Transient,
            _ => Self::Unspecified,
        }
    }
}

impl FromDispatchContext for DeliveryMode {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Context(ContextValue::DeliveryMode)
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok((*context.envelope().properties.delivery_mode()).into())
    }
}

impl FromDispatchContext for ServiceScope {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Context(ContextValue::Services)
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok(context.services().clone())
    }
}

impl FromDispatchContext for LifetimeToken {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Context(ContextValue::Lifetime)
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok(context.lifetime().clone())
    }
}

impl FromDispatchContext for Arc<DispatchContext> {
    fn binding() -> ArgumentBinding {
        ArgumentBinding::Context(ContextValue::Context)
    }

    fn from_context(context: &Arc<DispatchContext>) -> Result<Self, BindError> {
        Ok(context.clone())
    }
}
