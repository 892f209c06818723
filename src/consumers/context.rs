use crate::amqp::{BrokerChannel, BrokerConnection, Envelope};
use crate::serialization::Serializer;
use crate::services::ServiceScope;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// Everything known about one delivery while it is being processed.
///
/// A context is created when the delivery is received and dropped once the
/// [`BrokerAction`](crate::consumers::BrokerAction) chosen for it has been executed.
/// Handlers can take `Arc<DispatchContext>` as an argument to access it directly.
pub struct DispatchContext {
    queue_name: String,
    envelope: Envelope,
    // Typed by the handler's body parameter; taken (once) when arguments are extracted.
    message: Mutex<Option<Box<dyn Any + Send>>>,
    has_message: bool,
    channel: Arc<dyn BrokerChannel>,
    connection: Arc<dyn BrokerConnection>,
    services: ServiceScope,
    serializer: Arc<dyn Serializer>,
    lifetime: LifetimeToken,
    settled: AtomicBool,
}

impl DispatchContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue_name: String,
        envelope: Envelope,
        message: Option<Box<dyn Any + Send>>,
        channel: Arc<dyn BrokerChannel>,
        connection: Arc<dyn BrokerConnection>,
        services: ServiceScope,
        serializer: Arc<dyn Serializer>,
        lifetime: LifetimeToken,
    ) -> Self {
        Self {
            queue_name,
            envelope,
            has_message: message.is_some(),
            message: Mutex::new(message),
            channel,
            connection,
            services,
            serializer,
            lifetime,
            settled: AtomicBool::new(false),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// `false` if the body was empty or could not be deserialized.
    pub fn has_message(&self) -> bool {
        self.has_message
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    /// The service scope of this delivery.
    pub fn services(&self) -> &ServiceScope {
        &self.services
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    pub fn lifetime(&self) -> &LifetimeToken {
        &self.lifetime
    }

    /// `true` once the delivery was acked, nacked or rejected.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_settled(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }

    /// Take the deserialized message out of the context.
    ///
    /// Returns `None` if there is no message, if it was already taken or if it is not a `T`.
    pub(crate) fn take_message<T: 'static>(&self) -> Option<T> {
        let mut slot = self.message.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.take()?.downcast::<T>() {
            Ok(message) => Some(*message),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }
}

/// Cancelled when the [`QueueConsumer`](crate::consumers::QueueConsumer) that received a
/// delivery is disposed.
///
/// Cancellation is cooperative: in-flight handlers are never aborted, they can check
/// [`LifetimeToken::is_cancelled`] or await [`LifetimeToken::cancelled`].
#[derive(Clone, Default)]
pub struct LifetimeToken {
    inner: Arc<TokenState>,
}

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl LifetimeToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before checking the flag, or a concurrent `cancel` is missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for LifetimeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifetimeToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
