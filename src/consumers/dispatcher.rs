use crate::amqp::Envelope;
use crate::consumers::binding::ArgumentBinding;
use crate::consumers::handler::{Handler, HandlerOutcome, HandlerOutput, ResultAdapter};
use crate::consumers::{BindError, BrokerAction, BuildError, DispatchContext, ProcessFailureHook};
use crate::serialization::{SerializationError, Serializer};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

type BoxedCall = Arc<
    dyn Fn(&Arc<DispatchContext>) -> Result<BoxFuture<'static, HandlerOutcome>, BindError>
        + Send
        + Sync,
>;

/// A handler, checked and ready to process deliveries.
///
/// Building a `Dispatcher` inspects the handler signature once: where every parameter
/// comes from, which one is the message body and how the return value maps to a
/// [`BrokerAction`]. Nothing is looked up again per delivery.
#[derive(Clone)]
pub struct Dispatcher {
    parameters: Arc<[ArgumentBinding]>,
    body: ArgumentBinding,
    adapter: ResultAdapter,
    call: BoxedCall,
}

impl Dispatcher {
    /// Fails if the handler does not take exactly one message body, or takes a parameter
    /// that cannot be bound.
    pub fn new<H, Args>(handler: H) -> Result<Self, BuildError>
    where
        H: Handler<Args>,
    {
        let parameters = H::parameters();
        if let Some((position, type_name, reason)) =
            parameters.iter().enumerate().find_map(|(i, p)| match p {
                ArgumentBinding::Unsupported { type_name, reason } => Some((i, *type_name, *reason)),
                _ => None,
            })
        {
            return Err(BuildError::UnsupportedParameter {
                position,
                type_name,
                reason,
            });
        }

        let bodies: Vec<_> = parameters
            .iter()
            .filter(|p| matches!(p, ArgumentBinding::Body { .. }))
            .collect();
        let body = match bodies.as_slice() {
            [body] => **body,
            other => return Err(BuildError::BodyParameterCount { found: other.len() }),
        };

        let call: BoxedCall = Arc::new(
            move |context: &Arc<DispatchContext>| -> Result<BoxFuture<'static, HandlerOutcome>, BindError> {
                let future = handler.call(context)?;
                Ok(future
                    .map(<H::Output as HandlerOutput>::into_outcome)
                    .boxed())
            },
        );
        Ok(Self {
            parameters: parameters.into(),
            body,
            adapter: <H::Output as HandlerOutput>::ADAPTER,
            call,
        })
    }

    pub fn parameters(&self) -> &[ArgumentBinding] {
        &self.parameters
    }

    pub fn adapter(&self) -> ResultAdapter {
        self.adapter
    }

    /// The type name of the message body.
    pub fn message_type(&self) -> &'static str {
        match self.body {
            ArgumentBinding::Body { type_name, .. } => type_name,
            _ => "unknown",
        }
    }

    /// Service dependencies of the handler, as `(type name, key)`.
    pub fn services(&self) -> impl Iterator<Item = (&'static str, Option<&'static str>)> + '_ {
        self.parameters.iter().filter_map(|p| match p {
            ArgumentBinding::Service { type_name, key, .. } => Some((*type_name, *key)),
            _ => None,
        })
    }

    /// Decode the body of `envelope` into the handler's message type.
    ///
    /// `Ok(None)` for an empty body when the handler accepts one.
    pub fn deserialize(
        &self,
        serializer: &dyn Serializer,
        envelope: &Envelope,
    ) -> Result<Option<Box<dyn Any + Send>>, SerializationError> {
        let ArgumentBinding::Body {
            type_name,
            nullable,
            deserialize,
        } = self.body
        else {
            return Ok(None);
        };
        match serializer.deserialize(envelope)? {
            Some(value) => deserialize(value)
                .map(Some)
                .map_err(|source| SerializationError::Shape { type_name, source }),
            None if nullable => Ok(None),
            None => Err(SerializationError::MissingBody { type_name }),
        }
    }

    /// Invoke the handler and turn whatever happened into a [`BrokerAction`].
    ///
    /// Errors and panics, whether raised while the handler is called or while its future
    /// is polled, go through `on_failure`.
    pub async fn dispatch(
        &self,
        context: &Arc<DispatchContext>,
        on_failure: &dyn ProcessFailureHook,
    ) -> BrokerAction {
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.call)(context))) {
            Ok(Ok(future)) => AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| HandlerOutcome::Failed(panic_error(panic))),
            Ok(Err(e)) => HandlerOutcome::Failed(e.into()),
            Err(panic) => HandlerOutcome::Failed(panic_error(panic)),
        };
        match outcome {
            HandlerOutcome::Completed => BrokerAction::Ack,
            HandlerOutcome::Action(action) => action,
            HandlerOutcome::Failed(error) => {
                tracing::warn!(
                    queue_name = context.queue_name(),
                    delivery_tag = context.envelope().delivery_tag,
                    error = ?error,
                    "Handler failed"
                );
                on_failure.on_process_failure(context, &error).await
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("parameters", &self.parameters)
            .field("adapter", &self.adapter)
            .finish()
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".into());
    anyhow::anyhow!("The handler panicked: {message}")
}
