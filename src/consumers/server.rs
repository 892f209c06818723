use crate::consumers::{ConsumerDescriptor, QueueConsumer};
use crate::services::ServiceProvider;
use anyhow::Context;
use futures_util::future::join_all;
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;

/// Runs the consumers of every registered queue in one process.
///
/// # How do I use a `ConsumerServer`?
///
/// Register a [`ConsumerDescriptor`] per queue with [`ConsumerServer::add`], then either
/// drive the lifecycle yourself ([`start`], [`stop`], [`dispose`]) or hand control over to
/// [`run_until_sigterm`].
///
/// ```rust,no_run
/// use carrot_dispatch::amqp::{ConnectionFactory, SharedConnection};
/// use carrot_dispatch::consumers::{ConsumerDescriptor, ConsumerServer, Message};
/// use carrot_dispatch::services::ServiceCollection;
/// use std::sync::Arc;
///
/// #[derive(serde::Deserialize)]
/// struct OrderPlaced {
///     id: u64,
/// }
///
/// async fn on_order_placed(order: Message<OrderPlaced>) {
///     println!("order {} placed", order.id);
/// }
///
/// # async fn run(factory: ConnectionFactory) -> Result<(), anyhow::Error> {
/// let connection = Arc::new(SharedConnection::new(factory));
/// let mut server = ConsumerServer::new(ServiceCollection::new().build());
/// server.add(ConsumerDescriptor::new("orders", connection, on_order_placed)?)?;
/// server.run_until_sigterm().await
/// # }
/// ```
///
/// # Lifecycle
///
/// - `start` builds one [`QueueConsumer`] per descriptor, then initializes and starts them
///   all concurrently. If any of them fails, every consumer is disposed once all startups
///   have completed and `start` fails: there is no partial start;
/// - `stop` stops the consumers in reverse registration order;
/// - `dispose` disposes them in reverse registration order. Calling it again is a no-op.
///
/// [`start`]: ConsumerServer::start
/// [`stop`]: ConsumerServer::stop
/// [`dispose`]: ConsumerServer::dispose
/// [`run_until_sigterm`]: ConsumerServer::run_until_sigterm
pub struct ConsumerServer {
    services: ServiceProvider,
    descriptors: Vec<ConsumerDescriptor>,
    consumers: Vec<QueueConsumer>,
    started: bool,
}

impl ConsumerServer {
    pub fn new(services: ServiceProvider) -> Self {
        Self {
            services,
            descriptors: Vec::new(),
            consumers: Vec::new(),
            started: false,
        }
    }

    /// Register a consumer. Fails once the server has been started.
    pub fn add(&mut self, descriptor: ConsumerDescriptor) -> Result<&mut Self, anyhow::Error> {
        if self.started {
            anyhow::bail!(
                "Cannot register a consumer for queue `{}`: the server has already been started",
                descriptor.queue_name()
            );
        }
        self.descriptors.push(descriptor);
        Ok(self)
    }

    pub fn descriptors(&self) -> &[ConsumerDescriptor] {
        &self.descriptors
    }

    /// The consumers built by [`ConsumerServer::start`], in registration order.
    pub fn consumers(&self) -> &[QueueConsumer] {
        &self.consumers
    }

    #[tracing::instrument(
        skip_all,
        name = "consumer_server_start",
        fields(consumers = self.descriptors.len())
    )]
    pub async fn start(&mut self) -> Result<(), anyhow::Error> {
        if self.started {
            anyhow::bail!("The consumer server has already been started");
        }
        self.started = true;

        let consumers = self
            .descriptors
            .iter_mut()
            .map(|descriptor| {
                let queue_name = descriptor.queue_name().to_owned();
                descriptor
                    .build(self.services.clone())
                    .with_context(|| format!("Failed to build the consumer for queue `{queue_name}`"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.consumers = consumers;

        // Every startup runs to completion: a consumer abandoned halfway through
        // `initialize` would hold on to a connection nobody can release.
        let outcomes = join_all(self.consumers.iter_mut().map(|consumer| async move {
            let queue_name = consumer.queue_name().to_owned();
            consumer
                .initialize()
                .await
                .with_context(|| format!("Failed to initialize the consumer for queue `{queue_name}`"))?;
            consumer
                .start()
                .await
                .with_context(|| format!("Failed to start the consumer for queue `{queue_name}`"))
        }))
        .await;
        if let Some(e) = outcomes.into_iter().find_map(Result::err) {
            tracing::error!(error = ?e, "The consumer server failed to start");
            self.dispose().await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop every consumer, last registered first.
    #[tracing::instrument(skip_all, name = "consumer_server_stop")]
    pub async fn stop(&mut self) {
        for consumer in self.consumers.iter_mut().rev() {
            consumer.stop().await;
        }
    }

    /// Dispose every consumer, last registered first, and forget them.
    #[tracing::instrument(skip_all, name = "consumer_server_dispose")]
    pub async fn dispose(&mut self) {
        for consumer in self.consumers.iter_mut().rev() {
            consumer.dispose().await;
        }
        self.consumers.clear();
    }

    /// Start consuming and keep going until the application receives SIGTERM.
    pub async fn run_until_sigterm(self) -> Result<(), anyhow::Error> {
        self.run_until_shutdown(ShutdownHandler::sigterm()?).await
    }

    /// Start consuming and keep going until `shutdown` is signalled, then stop and
    /// dispose every consumer.
    ///
    /// A failed start disposes whatever was started and returns the error.
    #[tracing::instrument(skip_all, name = "consumer_server_run")]
    pub async fn run_until_shutdown(
        mut self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), anyhow::Error> {
        if let Err(e) = self.start().await {
            self.dispose().await;
            return Err(e);
        }
        shutdown.wait_for_signal().await;
        tracing::info!("Consumer server received shutdown event");
        self.stop().await;
        self.dispose().await;
        Ok(())
    }
}
