use crate::amqp::types::{AMQPValue, FieldTable};
use crate::amqp::{
    same_connection, BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent,
    DeliveryStream, Envelope,
};
use crate::consumers::binding::ArgumentBinding;
use crate::consumers::descriptor::ConsumerConfig;
use crate::consumers::extensions::with_extensions;
use crate::consumers::{
    ConsumerError, DispatchContext, Dispatcher, LifetimeToken, ProcessFailureHook,
    SerializationFailureHook,
};
use crate::serialization::Serializer;
use crate::services::ServiceProvider;
use amq_protocol_types::DeliveryTag;
use futures_util::{stream::FuturesUnordered, FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use task_local_extensions::Extensions;
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Where a [`QueueConsumer`] is in its lifecycle.
///
/// ```text
/// Uninitialized -> Initialized -> Consuming -> Stopped -> Disposed
/// ```
///
/// Every state can go straight to `Disposed`. A stopped consumer cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Uninitialized,
    Initialized,
    Consuming,
    Stopped,
    Disposed,
}

struct Resources {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    /// `false` if the connection provider shares its connection with other consumers.
    owns_connection: bool,
    observer: JoinHandle<()>,
}

struct Subscription {
    consumer_tag: String,
    stop: oneshot::Sender<()>,
    receive_loop: JoinHandle<()>,
}

/// The consumer of one queue.
///
/// A `QueueConsumer` is created by [`ConsumerDescriptor::build`] and owns the channel it
/// consumes on. It owns the connection too, unless the connection provider hands the same
/// connection to every caller (see [`SharedConnection`]).
///
/// Deliveries go through the same steps:
/// - a fresh service scope is created;
/// - the body is deserialized into the handler's message type. If that fails, the
///   serialization failure hook picks the [`BrokerAction`] and the handler is skipped;
/// - otherwise the handler runs, and its return value (or the process failure hook, if it
///   failed) gives the [`BrokerAction`];
/// - the action is executed on the channel.
///
/// If anything in there fails or panics, the delivery is nacked without requeue.
///
/// [`ConsumerDescriptor::build`]: crate::consumers::ConsumerDescriptor::build
/// [`SharedConnection`]: crate::amqp::SharedConnection
/// [`BrokerAction`]: crate::consumers::BrokerAction
pub struct QueueConsumer {
    config: ConsumerConfig,
    services: ServiceProvider,
    lifetime: LifetimeToken,
    state: ConsumerState,
    resources: Option<Resources>,
    subscription: Option<Subscription>,
}

impl QueueConsumer {
    pub(crate) fn new(config: ConsumerConfig, services: ServiceProvider) -> Self {
        Self {
            config,
            services,
            lifetime: LifetimeToken::new(),
            state: ConsumerState::Uninitialized,
            resources: None,
            subscription: None,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// The tag of the active subscription, while consuming.
    pub fn consumer_tag(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.consumer_tag.as_str())
    }

    /// Whether disposing the consumer closes its connection. `false` until initialized.
    pub fn owns_connection(&self) -> bool {
        self.resources.as_ref().map_or(false, |r| r.owns_connection)
    }

    fn invalid_state(&self, operation: &'static str) -> ConsumerError {
        ConsumerError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// Connect, open the channel, set the queue up and check it is there.
    ///
    /// Steps, in order:
    /// 1. every service the handler depends on is resolved once, so that a missing
    ///    registration fails here rather than on the first delivery;
    /// 2. a connection is requested twice from the provider: getting the same connection
    ///    back means it is shared and must not be closed by this consumer;
    /// 3. the channel is opened and the pre-start hooks run on it;
    /// 4. the queue is checked with a passive declare, retried with backoff;
    /// 5. QoS is set to the prefetch count;
    /// 6. connection events are logged until the consumer is disposed.
    #[tracing::instrument(
        skip_all,
        name = "consumer_initialize",
        fields(queue_name = %self.config.queue_name)
    )]
    pub async fn initialize(&mut self) -> Result<(), ConsumerError> {
        if self.state != ConsumerState::Uninitialized {
            return Err(self.invalid_state("initialize"));
        }
        self.check_services()?;

        let provider = &self.config.connection_provider;
        let connection = provider.connect().await?;
        let owns_connection = match provider.connect().await {
            Ok(probe) if same_connection(&connection, &probe) => false,
            Ok(probe) => {
                if let Err(e) = probe.close().await {
                    tracing::warn!(error = %e, "Failed to close the probe connection");
                }
                true
            }
            Err(e) => {
                close_connection(&connection, true).await;
                return Err(e.into());
            }
        };

        let channel = match self.config.channel_provider.create_channel(&connection).await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection(&connection, owns_connection).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.prepare_channel(channel.as_ref()).await {
            if let Err(close_error) = channel.close().await {
                tracing::warn!(error = %close_error, "Failed to close the channel");
            }
            close_connection(&connection, owns_connection).await;
            return Err(e);
        }

        let observer = tokio::spawn(observe_connection(
            connection.events(),
            self.config.queue_name.clone(),
        ));
        self.resources = Some(Resources {
            connection,
            channel,
            owns_connection,
            observer,
        });
        self.state = ConsumerState::Initialized;
        tracing::info!(owns_connection, "Consumer initialized");
        Ok(())
    }

    fn check_services(&self) -> Result<(), ConsumerError> {
        let scope = self.services.create_scope();
        for parameter in self.config.dispatcher.parameters() {
            if let ArgumentBinding::Service { check, .. } = parameter {
                check(&scope).map_err(|source| {
                    tracing::error!(error = %source, "A handler dependency is not registered");
                    ConsumerError::Service {
                        queue: self.config.queue_name.clone(),
                        source,
                    }
                })?;
            }
        }
        Ok(())
    }

    async fn prepare_channel(&self, channel: &dyn BrokerChannel) -> Result<(), ConsumerError> {
        let queue_name = &self.config.queue_name;
        for hook in &self.config.pre_start_hooks {
            hook.run(channel, queue_name, FieldTable::default())
                .await
                .map_err(|source| ConsumerError::PreStartHook {
                    queue: queue_name.clone(),
                    source,
                })?;
        }
        self.check_queue(channel).await?;
        channel.basic_qos(self.config.prefetch_count).await?;
        Ok(())
    }

    async fn check_queue(&self, channel: &dyn BrokerChannel) -> Result<(), ConsumerError> {
        let retry = self.config.queue_check;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match channel.queue_declare_passive(&self.config.queue_name).await {
                Ok(()) => return Ok(()),
                Err(BrokerError::QueueNotFound(_)) if attempt < max_attempts => {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(attempt, delay = ?delay, "Queue not found, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source @ BrokerError::QueueNotFound(_)) => {
                    tracing::error!(attempts = attempt, "Queue not found");
                    return Err(ConsumerError::QueueNotFound {
                        queue: self.config.queue_name.clone(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Subscribe to the queue and start processing deliveries.
    #[tracing::instrument(
        skip_all,
        name = "consumer_start",
        fields(queue_name = %self.config.queue_name)
    )]
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        let resources = match (&self.resources, self.state) {
            (Some(resources), ConsumerState::Initialized) => resources,
            _ => return Err(self.invalid_state("start")),
        };

        let consumer_tag = self
            .config
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.config.queue_name, Uuid::new_v4()));
        let mut arguments = FieldTable::default();
        if let Some(priority) = self.config.priority {
            arguments.insert("x-priority".into(), AMQPValue::LongInt(priority));
        }
        let deliveries = resources
            .channel
            .basic_consume(
                &self.config.queue_name,
                &consumer_tag,
                self.config.exclusive,
                arguments,
            )
            .await?;

        let pipeline = Arc::new(Pipeline {
            queue_name: self.config.queue_name.clone(),
            dispatcher: self.config.dispatcher.clone(),
            serializer: self.config.serializer.clone(),
            process_failure_hook: self.config.process_failure_hook.clone(),
            serialization_failure_hook: self.config.serialization_failure_hook.clone(),
            channel: resources.channel.clone(),
            connection: resources.connection.clone(),
            services: self.services.clone(),
            lifetime: self.lifetime.clone(),
        });
        let (stop, stopped) = oneshot::channel();
        let receive_loop = tokio::spawn(receive(
            pipeline,
            deliveries,
            stopped,
            self.config.dispatch_concurrency,
        ));

        tracing::info!(consumer_tag = %consumer_tag, "Consumer started");
        self.subscription = Some(Subscription {
            consumer_tag,
            stop,
            receive_loop,
        });
        self.state = ConsumerState::Consuming;
        Ok(())
    }

    /// Cancel the subscription and wait for in-flight deliveries to be processed.
    ///
    /// Deliveries the broker already pushed (up to the prefetch count) but that were not
    /// handed to the handler yet are left alone: they stay unacknowledged until the
    /// channel is closed by [`QueueConsumer::dispose`], and the broker then requeues them.
    ///
    /// Does nothing unless the consumer is consuming.
    #[tracing::instrument(
        skip_all,
        name = "consumer_stop",
        fields(queue_name = %self.config.queue_name)
    )]
    pub async fn stop(&mut self) {
        if self.state != ConsumerState::Consuming {
            return;
        }
        if let Some(subscription) = self.subscription.take() {
            if let Some(resources) = &self.resources {
                if let Err(e) = resources
                    .channel
                    .basic_cancel(&subscription.consumer_tag)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to cancel the subscription");
                }
            }
            let _ = subscription.stop.send(());
            if let Err(e) = subscription.receive_loop.await {
                tracing::error!(error = %e, "The receive loop did not shut down cleanly");
            }
        }
        self.state = ConsumerState::Stopped;
        tracing::info!("Consumer stopped");
    }

    /// Release everything the consumer holds. Safe to call in any state, and more than once.
    ///
    /// The [`LifetimeToken`] handed to handlers is cancelled first.
    #[tracing::instrument(
        skip_all,
        name = "consumer_dispose",
        fields(queue_name = %self.config.queue_name)
    )]
    pub async fn dispose(&mut self) {
        if self.state == ConsumerState::Disposed {
            return;
        }
        self.lifetime.cancel();
        if let Some(resources) = &self.resources {
            resources.observer.abort();
        }
        self.stop().await;
        if let Some(resources) = self.resources.take() {
            if let Err(e) = resources.channel.close().await {
                tracing::warn!(error = %e, "Failed to close the channel");
            }
            close_connection(&resources.connection, resources.owns_connection).await;
        }
        self.state = ConsumerState::Disposed;
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        if let Some(resources) = &self.resources {
            resources.observer.abort();
        }
        if let Some(subscription) = &self.subscription {
            subscription.receive_loop.abort();
        }
    }
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("queue_name", &self.config.queue_name)
            .field("state", &self.state)
            .field("consumer_tag", &self.consumer_tag())
            .finish()
    }
}

async fn close_connection(connection: &Arc<dyn BrokerConnection>, owned: bool) {
    if !owned {
        return;
    }
    if let Err(e) = connection.close().await {
        tracing::warn!(error = %e, "Failed to close the connection");
    }
}

/// Connection events are logged, never acted upon: recovering from a lost connection
/// is left to whoever supervises the process.
async fn observe_connection(mut events: broadcast::Receiver<ConnectionEvent>, queue_name: String) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Blocked { reason }) => {
                tracing::warn!(queue_name = %queue_name, reason = %reason, "Connection blocked by the broker")
            }
            Ok(ConnectionEvent::Unblocked) => {
                tracing::info!(queue_name = %queue_name, "Connection unblocked")
            }
            Ok(ConnectionEvent::Shutdown { reason }) => {
                tracing::error!(
                    queue_name = %queue_name,
                    reason = %reason,
                    critical = true,
                    "Connection lost, the consumer will not receive messages anymore"
                );
                break;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(queue_name = %queue_name, missed, "Missed connection events")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Everything needed to process a delivery, shared by the deliveries of one subscription.
struct Pipeline {
    queue_name: String,
    dispatcher: Dispatcher,
    serializer: Arc<dyn Serializer>,
    process_failure_hook: Arc<dyn ProcessFailureHook>,
    serialization_failure_hook: Arc<dyn SerializationFailureHook>,
    channel: Arc<dyn BrokerChannel>,
    connection: Arc<dyn BrokerConnection>,
    services: ServiceProvider,
    lifetime: LifetimeToken,
}

#[tracing::instrument(
    skip_all,
    name = "consumer_receive",
    fields(queue_name = %pipeline.queue_name)
)]
async fn receive(
    pipeline: Arc<Pipeline>,
    mut deliveries: DeliveryStream,
    mut stop: oneshot::Receiver<()>,
    dispatch_concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(dispatch_concurrency));
    let mut task_handles = FuturesUnordered::new();

    'event_loop: loop {
        // A delivery is only pulled once a slot is free: with a concurrency of 1 deliveries
        // are processed one at a time, in order.
        let next = async {
            let permit = permits.clone().acquire_owned().await;
            (permit, deliveries.next().await)
        };
        tokio::select! {
            biased;

            _ = &mut stop => break 'event_loop,

            _ = task_handles.next(), if !task_handles.is_empty() => {}

            (permit, delivery) = next => {
                let Ok(permit) = permit else {
                    break 'event_loop;
                };
                match delivery {
                    None => {
                        tracing::info!("The subscription ended");
                        break 'event_loop;
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Consumer error");
                        break 'event_loop;
                    }
                    Some(Ok(envelope)) => {
                        let pipeline = pipeline.clone();
                        task_handles.push(tokio::spawn(async move {
                            pipeline.process(envelope).await;
                            drop(permit);
                        }));
                    }
                }
            }
        }
    }

    // In-flight deliveries complete before the loop returns.
    while task_handles.next().await.is_some() {}
}

impl Pipeline {
    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(queue_name = %self.queue_name, delivery_tag = envelope.delivery_tag),
        level = tracing::Level::DEBUG
    )]
    async fn process(&self, envelope: Envelope) {
        // The serializer is user code: a panic while decoding gets the same treatment as
        // one raised by the handler.
        let decoded = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let services = self.services.create_scope();
            let decoded = self
                .dispatcher
                .deserialize(self.serializer.as_ref(), &envelope);
            (services, decoded)
        }));
        let (services, decoded) = match decoded {
            Ok(decoded) => decoded,
            Err(_) => {
                tracing::error!("Message deserialization panicked");
                self.fallback_nack(envelope.delivery_tag, false).await;
                return;
            }
        };
        let (message, serialization_error) = match decoded {
            Ok(message) => (message, None),
            Err(e) => (None, Some(e)),
        };
        let context = Arc::new(DispatchContext::new(
            self.queue_name.clone(),
            envelope,
            message,
            self.channel.clone(),
            self.connection.clone(),
            services,
            self.serializer.clone(),
            self.lifetime.clone(),
        ));

        let processing = async {
            let action = match &serialization_error {
                Some(error) => {
                    tracing::warn!(
                        error = %error,
                        message_type = self.dispatcher.message_type(),
                        "Failed to deserialize the message"
                    );
                    self.serialization_failure_hook
                        .on_serialization_failure(&context, error)
                        .await
                }
                None => {
                    self.dispatcher
                        .dispatch(&context, self.process_failure_hook.as_ref())
                        .await
                }
            };
            tracing::debug!(action = ?action, "Executing broker action");
            action.execute(&context).await
        };
        let (_, outcome) = with_extensions(
            Extensions::default(),
            AssertUnwindSafe(processing).catch_unwind(),
        )
        .await;

        let delivery_tag = context.envelope().delivery_tag;
        match outcome {
            Ok(Ok(())) if context.is_settled() => {}
            Ok(Ok(())) => tracing::warn!(
                "The broker action did not ack, nack or reject the message: it stays unacknowledged"
            ),
            // Already acked, nacked or rejected: nothing left to fall back on.
            _ if context.is_settled() => {
                tracing::error!("Message processing failed after the delivery was settled")
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to execute the broker action");
                self.fallback_nack(delivery_tag, e.is_channel_closed()).await;
            }
            Err(_) => {
                tracing::error!("Message processing panicked");
                self.fallback_nack(delivery_tag, false).await;
            }
        }
    }

    /// Last resort: nack without requeue.
    async fn fallback_nack(&self, delivery_tag: DeliveryTag, channel_closed: bool) {
        if channel_closed || !self.channel.is_open() {
            tracing::error!(
                critical = true,
                "The channel is closed, the message may remain unacknowledged"
            );
            return;
        }
        if let Err(e) = self.channel.basic_nack(delivery_tag, false).await {
            tracing::error!(
                critical = true,
                error = %e,
                "Fallback nack failed, the message may remain unacknowledged"
            );
        }
    }
}
