use crate::consumers::{BrokerAction, DispatchContext};
use crate::serialization::SerializationError;

#[async_trait::async_trait]
/// A hook to decide what happens to a delivery whose handler failed.
///
/// # Use case
///
/// The handler returned an error or panicked: should the message be retried, parked in
/// a dead letter queue, retried later?
///
/// The default, [`NackWithoutRequeue`], nacks the delivery without requeueing it: the
/// broker dead-letters it if the queue has a dead letter exchange, drops it otherwise.
///
/// # Plug and play implementations
///
/// You can find ready-to-go hooks in the [`hooks::failure`] module.
///
/// [`NackWithoutRequeue`]: crate::consumers::hooks::failure::NackWithoutRequeue
/// [`hooks::failure`]: crate::consumers::hooks::failure
pub trait ProcessFailureHook: Send + Sync + 'static {
    async fn on_process_failure(
        &self,
        context: &DispatchContext,
        error: &anyhow::Error,
    ) -> BrokerAction;
}

#[async_trait::async_trait]
/// A hook to decide what happens to a delivery whose body could not be deserialized.
///
/// The handler is never invoked for such a delivery. The default,
/// [`RejectWithoutRequeue`], rejects it without requeueing: a malformed message will not
/// become valid by being redelivered.
///
/// [`RejectWithoutRequeue`]: crate::consumers::hooks::failure::RejectWithoutRequeue
pub trait SerializationFailureHook: Send + Sync + 'static {
    async fn on_serialization_failure(
        &self,
        context: &DispatchContext,
        error: &SerializationError,
    ) -> BrokerAction;
}

/// assert they're object safe
type _CHECK = (
    Box<dyn ProcessFailureHook>,
    Box<dyn SerializationFailureHook>,
);
