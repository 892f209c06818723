use crate::amqp::BrokerError;
use crate::consumers::ConsumerState;
use crate::services::ServiceError;

/// A handler signature that cannot be turned into a [`Dispatcher`](crate::consumers::Dispatcher).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("A handler must take exactly one message body parameter, found {found}")]
    BodyParameterCount { found: usize },
    #[error("Parameter #{position} (`{type_name}`) cannot be bound: {reason}")]
    UnsupportedParameter {
        position: usize,
        type_name: &'static str,
        reason: &'static str,
    },
}

/// Invalid [`ConsumerDescriptor`](crate::consumers::ConsumerDescriptor) configuration.
#[derive(thiserror::Error, Debug)]
pub enum DescriptorError {
    #[error("The descriptor for queue `{0}` was already built into a consumer and can no longer be changed")]
    Locked(String),
    #[error("The prefetch count must be greater than zero")]
    InvalidPrefetch,
    #[error("The dispatch concurrency must be at least 1")]
    InvalidConcurrency,
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// A handler argument that could not be extracted from the [`DispatchContext`](crate::consumers::DispatchContext).
#[derive(thiserror::Error, Debug)]
pub enum BindError {
    #[error("The message body was already handed to another parameter")]
    BodyUnavailable,
    #[error("`{type_name}` is not a handler parameter: {reason}")]
    Unsupported {
        type_name: &'static str,
        reason: &'static str,
    },
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Failures of the [`QueueConsumer`](crate::consumers::QueueConsumer) lifecycle.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("Cannot {operation} a consumer in the {state:?} state")]
    InvalidState {
        operation: &'static str,
        state: ConsumerState,
    },
    #[error("Queue `{queue}` could not be found after {attempts} attempts")]
    QueueNotFound {
        queue: String,
        attempts: u32,
        #[source]
        source: BrokerError,
    },
    #[error("A pre-start hook failed for queue `{queue}`")]
    PreStartHook {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("A handler dependency of queue `{queue}` cannot be resolved")]
    Service {
        queue: String,
        #[source]
        source: ServiceError,
    },
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// A [`BrokerAction`](crate::consumers::BrokerAction) that could not be carried out.
#[derive(thiserror::Error, Debug)]
pub enum ActionError {
    #[error("The message has no reply-to address to send a reply to")]
    MissingReplyTo,
    #[error(transparent)]
    Serialization(#[from] crate::serialization::SerializationError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ActionError {
    /// `true` if the channel can no longer be used to settle the delivery.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::Broker(e) if e.is_channel_closed())
    }
}
