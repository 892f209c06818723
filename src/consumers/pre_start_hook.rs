use crate::amqp::types::FieldTable;
use crate::amqp::BrokerChannel;

/// Prepares the broker topology a consumer depends on.
///
/// A [`QueueConsumer`] never creates its queue: it only checks, with a passive declare,
/// that the queue is there. Register a pre-start hook on the descriptor when the consumer
/// should declare the queue (and the exchanges and bindings feeding it) itself.
///
/// Hooks run once per [`QueueConsumer::initialize`], in registration order, on the
/// consumer's own channel and before the queue check. `queue_args` carries the arguments
/// wrapping hooks (dead lettering, priority) add to the queue declaration. An error fails
/// the initialization.
///
/// Stock hooks live in [`hooks::pre_start`].
///
/// [`QueueConsumer`]: crate::consumers::QueueConsumer
/// [`QueueConsumer::initialize`]: crate::consumers::QueueConsumer::initialize
/// [`hooks::pre_start`]: crate::consumers::hooks::pre_start
#[async_trait::async_trait]
pub trait ConsumerPreStartHook: Send + Sync + 'static {
    async fn run(
        &self,
        channel: &dyn BrokerChannel,
        queue_name: &str,
        queue_args: FieldTable,
    ) -> Result<(), anyhow::Error>;
}

type _ObjectSafe = Box<dyn ConsumerPreStartHook>;
