use crate::amqp::{ChannelProvider, ConnectionProvider, DefaultChannelProvider};
use crate::consumers::handler::Handler;
use crate::consumers::hooks::failure::{NackWithoutRequeue, RejectWithoutRequeue};
use crate::consumers::{
    ConsumerPreStartHook, ConsumerSettings, DescriptorError, Dispatcher, ProcessFailureHook,
    QueueCheckRetry, QueueConsumer, SerializationFailureHook,
};
use crate::serialization::{JsonSerializer, Serializer};
use crate::services::ServiceProvider;
use std::sync::Arc;

const DEFAULT_PREFETCH_COUNT: u16 = 50;

/// Everything a [`QueueConsumer`] is made of, frozen when the descriptor is built.
#[derive(Clone)]
pub(crate) struct ConsumerConfig {
    pub(crate) queue_name: String,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) prefetch_count: u16,
    pub(crate) dispatch_concurrency: usize,
    pub(crate) exclusive: bool,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) priority: Option<i32>,
    pub(crate) connection_provider: Arc<dyn ConnectionProvider>,
    pub(crate) channel_provider: Arc<dyn ChannelProvider>,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) pre_start_hooks: Vec<Arc<dyn ConsumerPreStartHook>>,
    pub(crate) process_failure_hook: Arc<dyn ProcessFailureHook>,
    pub(crate) serialization_failure_hook: Arc<dyn SerializationFailureHook>,
    pub(crate) queue_check: QueueCheckRetry,
}

/// The registration of a handler on a queue.
///
/// The handler signature is checked when the descriptor is created: a handler without a
/// message body, or with more than one, is refused right away.
///
/// Everything else can be tuned until the descriptor is [built](ConsumerDescriptor::build)
/// into a [`QueueConsumer`]. From then on the descriptor is locked: every setter fails with
/// [`DescriptorError::Locked`].
///
/// | Option                   | Default                          |
/// |--------------------------|----------------------------------|
/// | prefetch count           | 50                               |
/// | dispatch concurrency     | 1 (deliveries processed in order)|
/// | exclusive                | `false`                          |
/// | consumer tag             | `{queue}-{uuid}`                 |
/// | serializer               | [`JsonSerializer`]               |
/// | process failure hook     | [`NackWithoutRequeue`]           |
/// | serialization failure hook | [`RejectWithoutRequeue`]       |
/// | queue check              | [`QueueCheckRetry::default`]     |
pub struct ConsumerDescriptor {
    config: ConsumerConfig,
    locked: bool,
}

impl ConsumerDescriptor {
    pub fn new<H, Args>(
        queue_name: impl Into<String>,
        connection_provider: impl ConnectionProvider,
        handler: H,
    ) -> Result<Self, DescriptorError>
    where
        H: Handler<Args>,
    {
        let queue_name = queue_name.into();
        let dispatcher = Dispatcher::new(handler).map_err(|e| {
            tracing::error!(queue_name = %queue_name, error = %e, "Invalid handler");
            e
        })?;
        Ok(Self {
            config: ConsumerConfig {
                queue_name,
                dispatcher,
                prefetch_count: DEFAULT_PREFETCH_COUNT,
                dispatch_concurrency: 1,
                exclusive: false,
                consumer_tag: None,
                priority: None,
                connection_provider: Arc::new(connection_provider),
                channel_provider: Arc::new(DefaultChannelProvider),
                serializer: Arc::new(JsonSerializer),
                pre_start_hooks: Vec::new(),
                process_failure_hook: Arc::new(NackWithoutRequeue),
                serialization_failure_hook: Arc::new(RejectWithoutRequeue),
                queue_check: QueueCheckRetry::default(),
            },
            locked: false,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.config.dispatcher
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn unlocked(&mut self) -> Result<&mut ConsumerConfig, DescriptorError> {
        match self.locked {
            true => Err(DescriptorError::Locked(self.config.queue_name.clone())),
            false => Ok(&mut self.config),
        }
    }

    /// The maximum number of unacknowledged deliveries the broker pushes to the consumer.
    pub fn prefetch_count(&mut self, prefetch_count: u16) -> Result<&mut Self, DescriptorError> {
        if prefetch_count == 0 {
            return Err(DescriptorError::InvalidPrefetch);
        }
        self.unlocked()?.prefetch_count = prefetch_count;
        Ok(self)
    }

    /// How many deliveries are processed at the same time.
    ///
    /// With more than one, handlers run concurrently and in no particular order.
    pub fn dispatch_concurrency(
        &mut self,
        dispatch_concurrency: usize,
    ) -> Result<&mut Self, DescriptorError> {
        if dispatch_concurrency == 0 {
            return Err(DescriptorError::InvalidConcurrency);
        }
        self.unlocked()?.dispatch_concurrency = dispatch_concurrency;
        Ok(self)
    }

    pub fn exclusive(&mut self, exclusive: bool) -> Result<&mut Self, DescriptorError> {
        self.unlocked()?.exclusive = exclusive;
        Ok(self)
    }

    pub fn consumer_tag(
        &mut self,
        consumer_tag: impl Into<String>,
    ) -> Result<&mut Self, DescriptorError> {
        self.unlocked()?.consumer_tag = Some(consumer_tag.into());
        Ok(self)
    }

    /// Consumer priority. See <https://www.rabbitmq.com/consumer-priority.html>.
    pub fn priority(&mut self, priority: i32) -> Result<&mut Self, DescriptorError> {
        self.unlocked()?.priority = Some(priority);
        Ok(self)
    }

    pub fn channel_provider(
        &mut self,
        channel_provider: impl ChannelProvider,
    ) -> Result<&mut Self, DescriptorError> {
        self.unlocked()?.channel_provider = Arc::new(channel_provider);
        Ok(self)
    }

    pub fn serializer(
        &mut self,
        serializer: impl Serializer,
    ) -> Result<&mut Self, DescriptorError> {
        self.unlocked()?.serializer = Arc::new(serializer);
        Ok(self)
    }

    /// Add a hook to run before consuming starts. Hooks run in the order they are added.
    pub fn pre_start_hook(
        &mut self,
        hook: impl ConsumerPreStartHook,
    ) -> Result<&mut Self, DescriptorError> {
        self.unlocked()?.pre_start_hooks.push(Arc::new(hook));
        Ok(self)
    }

    pub fn on_process_failure(
        &mut self,
        hook: impl ProcessFailureHook,
    ) -> Result<&mut Self, DescriptorError> {
        self.unlocked()?.process_failure_hook = Arc::new(hook);
        Ok(self)
    }

    pub fn on_serialization_failure(
        &mut self,
        hook: impl SerializationFailureHook,
    ) -> Result<&mut Self, DescriptorError> {
        self.unlocked()?.serialization_failure_hook = Arc::new(hook);
        Ok(self)
    }

    pub fn queue_check(&mut self, retry: QueueCheckRetry) -> Result<&mut Self, DescriptorError> {
        self.unlocked()?.queue_check = retry;
        Ok(self)
    }

    /// Apply every option set in `settings`.
    ///
    /// `settings` is validated as a whole first: on error the descriptor is left untouched.
    pub fn apply_settings(
        &mut self,
        settings: &ConsumerSettings,
    ) -> Result<&mut Self, DescriptorError> {
        self.unlocked()?;
        if settings.prefetch_count == Some(0) {
            return Err(DescriptorError::InvalidPrefetch);
        }
        if settings.dispatch_concurrency == Some(0) {
            return Err(DescriptorError::InvalidConcurrency);
        }
        if let Some(prefetch_count) = settings.prefetch_count {
            self.prefetch_count(prefetch_count)?;
        }
        if let Some(dispatch_concurrency) = settings.dispatch_concurrency {
            self.dispatch_concurrency(dispatch_concurrency)?;
        }
        if let Some(exclusive) = settings.exclusive {
            self.exclusive(exclusive)?;
        }
        if let Some(consumer_tag) = &settings.consumer_tag {
            self.consumer_tag(consumer_tag.clone())?;
        }
        if let Some(priority) = settings.priority {
            self.priority(priority)?;
        }
        if let Some(retry) = settings.queue_check {
            self.queue_check(retry)?;
        }
        Ok(self)
    }

    /// Create the [`QueueConsumer`] for this registration and lock the descriptor.
    ///
    /// Nothing is sent to the broker until the consumer is initialized.
    pub fn build(&mut self, services: ServiceProvider) -> Result<QueueConsumer, DescriptorError> {
        let config = self.unlocked()?.clone();
        self.locked = true;
        Ok(QueueConsumer::new(config, services))
    }
}

impl std::fmt::Debug for ConsumerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerDescriptor")
            .field("queue_name", &self.config.queue_name)
            .field("dispatcher", &self.config.dispatcher)
            .field("prefetch_count", &self.config.prefetch_count)
            .field("dispatch_concurrency", &self.config.dispatch_concurrency)
            .field("exclusive", &self.config.exclusive)
            .field("locked", &self.locked)
            .finish()
    }
}
