//! A collection of failure hooks.
//!
//! Every hook here implements both [`ProcessFailureHook`] and [`SerializationFailureHook`].
use crate::consumers::{BrokerAction, DispatchContext, ProcessFailureHook, SerializationFailureHook};
use crate::serialization::SerializationError;
use std::time::Duration;

/// Nack the delivery, never requeue it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NackWithoutRequeue;

/// Reject the delivery, never requeue it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectWithoutRequeue;

/// Nack the delivery and requeue it: it becomes _immediately_ available again.
///
/// A message that always fails is redelivered forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRequeue;

/// Retry the message after `ttl`, through the `{queue}-delayed` queue.
///
/// Requires the topology set up by
/// [`WithDelayedRetryQueue`](crate::consumers::hooks::pre_start::WithDelayedRetryQueue).
#[derive(Debug, Clone, Copy)]
pub struct RetryWithDelay {
    pub ttl: Duration,
}

impl NackWithoutRequeue {
    fn action(&self) -> BrokerAction {
        BrokerAction::nack(false)
    }
}

impl RejectWithoutRequeue {
    fn action(&self) -> BrokerAction {
        BrokerAction::reject(false)
    }
}

impl AlwaysRequeue {
    fn action(&self) -> BrokerAction {
        BrokerAction::nack(true)
    }
}

impl RetryWithDelay {
    fn action(&self) -> BrokerAction {
        BrokerAction::delayed(self.ttl)
    }
}

macro_rules! failure_hook {
    ($hook:ty) => {
        #[async_trait::async_trait]
        impl ProcessFailureHook for $hook {
            async fn on_process_failure(
                &self,
                _context: &DispatchContext,
                _error: &anyhow::Error,
            ) -> BrokerAction {
                self.action()
            }
        }

        #[async_trait::async_trait]
        impl SerializationFailureHook for $hook {
            async fn on_serialization_failure(
                &self,
                _context: &DispatchContext,
                _error: &SerializationError,
            ) -> BrokerAction {
                self.action()
            }
        }
    };
}

failure_hook!(NackWithoutRequeue);
failure_hook!(RejectWithoutRequeue);
failure_hook!(AlwaysRequeue);
failure_hook!(RetryWithDelay);
