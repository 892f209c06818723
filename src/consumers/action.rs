use crate::amqp::convenience::without_expiration;
use crate::amqp::types::ShortString;
use crate::amqp::BasicProperties;
use crate::consumers::{ActionError, DispatchContext};
use crate::serialization::{Payload, SerializationError};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// What to do with a delivery once it has been processed.
///
/// Handlers return a `BrokerAction` (directly or wrapped in a `Result`), failure hooks pick
/// one when processing goes wrong. The consumer executes exactly one action per delivery.
///
/// `Reply` and `Forward` publish but do not settle the delivery: combine them with a
/// settling action using [`BrokerAction::Compose`].
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerAction {
    /// Acknowledge the delivery.
    Ack,
    /// Negative-acknowledge the delivery: processing failed.
    ///
    /// With `requeue: false` the message is dead-lettered, if the queue has a dead letter
    /// exchange, or dropped.
    Nack { requeue: bool },
    /// Reject the delivery: the message itself is invalid.
    ///
    /// Same effect on the broker as [`BrokerAction::Nack`], kept apart so that the intent
    /// survives in logs and in the broker's statistics.
    Reject { requeue: bool },
    /// Publish `payload` to the `reply_to` address of the delivery.
    Reply(Payload),
    Forward(Forward),
    /// Publish a copy of the message to `{queue}-delayed` with the given TTL, then ack the
    /// delivery.
    ///
    /// The delayed queue is expected to dead-letter expired messages back to the original
    /// queue, see [`WithDelayedRetryQueue`](crate::consumers::hooks::pre_start::WithDelayedRetryQueue).
    /// Without a payload the original body is re-published.
    Delayed {
        payload: Option<Payload>,
        ttl: Duration,
    },
    /// Several actions for the same delivery.
    ///
    /// Publishing actions run first, settling actions last: a delivery is never acked
    /// before the messages it produced have been handed to the broker. Order is kept
    /// within each group.
    Compose(Vec<BrokerAction>),
}

/// Publish one or more payloads to an explicit destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    /// Overrides the `reply_to` property copied from the delivery.
    pub reply_to: Option<String>,
    pub payloads: Vec<Payload>,
}

impl Forward {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory: false,
            reply_to: None,
            payloads: Vec::new(),
        }
    }

    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payloads.push(payload.into());
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

impl From<Forward> for BrokerAction {
    fn from(forward: Forward) -> Self {
        Self::Forward(forward)
    }
}

impl BrokerAction {
    pub fn nack(requeue: bool) -> Self {
        Self::Nack { requeue }
    }

    pub fn reject(requeue: bool) -> Self {
        Self::Reject { requeue }
    }

    /// Reply with `body`, serialized with the consumer's serializer.
    pub fn reply_json<T: Serialize>(body: &T) -> Result<Self, SerializationError> {
        Payload::json(body).map(Self::Reply)
    }

    /// Re-publish the original message after `ttl`.
    pub fn delayed(ttl: Duration) -> Self {
        Self::Delayed { payload: None, ttl }
    }

    /// Shorthand for [`BrokerAction::Compose`].
    pub fn compose(actions: impl IntoIterator<Item = BrokerAction>) -> Self {
        Self::Compose(actions.into_iter().collect())
    }

    /// `true` if executing the action acks, nacks or rejects the delivery.
    pub fn settles(&self) -> bool {
        match self {
            Self::Ack | Self::Nack { .. } | Self::Reject { .. } | Self::Delayed { .. } => true,
            Self::Reply(_) | Self::Forward(_) => false,
            Self::Compose(actions) => actions.iter().any(Self::settles),
        }
    }

    fn flatten<'a>(&'a self, publishing: &mut Vec<&'a Self>, settling: &mut Vec<&'a Self>) {
        match self {
            Self::Compose(actions) => {
                for action in actions {
                    action.flatten(publishing, settling);
                }
            }
            // Delayed publishes and settles in one go: the ack must follow its own publish.
            action if action.settles() => settling.push(action),
            action => publishing.push(action),
        }
    }

    /// Carry out the action against the channel of `context`.
    pub async fn execute(&self, context: &DispatchContext) -> Result<(), ActionError> {
        let mut publishing = Vec::new();
        let mut settling = Vec::new();
        self.flatten(&mut publishing, &mut settling);
        for action in publishing.into_iter().chain(settling) {
            action.execute_single(context).await?;
        }
        Ok(())
    }

    async fn execute_single(&self, context: &DispatchContext) -> Result<(), ActionError> {
        let channel = context.channel();
        let delivery_tag = context.envelope().delivery_tag;
        match self {
            Self::Ack => {
                channel.basic_ack(delivery_tag).await?;
                context.mark_settled();
                tracing::debug!(delivery_tag, "Message acked");
            }
            Self::Nack { requeue } => {
                channel.basic_nack(delivery_tag, *requeue).await?;
                context.mark_settled();
                tracing::debug!(delivery_tag, requeue, "Message nacked");
            }
            Self::Reject { requeue } => {
                channel.basic_reject(delivery_tag, *requeue).await?;
                context.mark_settled();
                tracing::debug!(delivery_tag, requeue, "Message rejected");
            }
            Self::Reply(payload) => {
                let reply_to = context
                    .envelope()
                    .properties
                    .reply_to()
                    .clone()
                    .ok_or(ActionError::MissingReplyTo)?;
                let properties = stamp_ids(BasicProperties::default(), context);
                publish(context, "", reply_to.as_str(), false, properties, payload).await?;
            }
            Self::Forward(forward) => {
                let mut properties =
                    stamp_ids(without_expiration(&context.envelope().properties), context);
                if let Some(reply_to) = &forward.reply_to {
                    properties = properties.with_reply_to(reply_to.as_str().into());
                }
                for payload in &forward.payloads {
                    publish(
                        context,
                        &forward.exchange,
                        &forward.routing_key,
                        forward.mandatory,
                        properties.clone(),
                        payload,
                    )
                    .await?;
                }
            }
            Self::Delayed { payload, ttl } => {
                let properties = without_expiration(&context.envelope().properties)
                    .with_expiration(ttl.as_millis().to_string().into());
                let delayed_queue = format!("{}-delayed", context.queue_name());
                match payload {
                    Some(payload) => {
                        publish(context, "", &delayed_queue, false, properties, payload).await?
                    }
                    None => {
                        channel
                            .basic_publish(
                                "",
                                &delayed_queue,
                                false,
                                properties,
                                context.envelope().data.clone(),
                            )
                            .await?
                    }
                }
                channel.basic_ack(delivery_tag).await?;
                context.mark_settled();
                tracing::debug!(delivery_tag, ttl = ?ttl, "Message delayed");
            }
            // Flattened by `execute`.
            Self::Compose(_) => {}
        }
        Ok(())
    }
}

/// A new message id, correlated with the id of the delivery.
fn stamp_ids(properties: BasicProperties, context: &DispatchContext) -> BasicProperties {
    let properties = properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()));
    match context.envelope().properties.message_id() {
        Some(id) => properties.with_correlation_id(id.clone()),
        None => properties,
    }
}

async fn publish(
    context: &DispatchContext,
    exchange: &str,
    routing_key: &str,
    mandatory: bool,
    mut properties: BasicProperties,
    payload: &Payload,
) -> Result<(), ActionError> {
    let serializer = context.serializer();
    if let Some(content_type) = payload.content_type(serializer) {
        properties = properties.with_content_type(content_type.into());
    }
    let body = payload.encode(serializer, &properties)?;
    context
        .channel()
        .basic_publish(exchange, routing_key, mandatory, properties, body)
        .await?;
    Ok(())
}
