use super::intake::IntakeQueue;
use super::{ConsumerError, ConsumerOptions, ReceivedMessage};
use crate::configuration::RuntimeSettings;
use crate::pool::{ChannelHost, ChannelPool, PooledChannel};
use crate::sync::lock;
use crate::transport::{Delivery, DeliveryHandler, ShutdownReason};
use futures_util::Stream;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Pulls deliveries from a queue into a bounded intake queue.
///
/// Starting the consumer checks a channel out of the [`ChannelPool`] (an ackable one unless
/// `auto_ack` is set), sets its prefetch to `batch_size` and registers a delivery callback that
/// writes every delivery to the intake queue. Readers pull from the queue with
/// [`Consumer::read`], [`Consumer::read_until_empty`] or [`Consumer::stream`].
///
/// If the registration is shut down by the broker or the network while the consumer is running,
/// the consumer waits for its channel to be healthy again and resumes consuming, picking up the
/// consumer tag assigned by the broker client if the connection recovered on its own.
///
/// `Consumer` is a cheap handle: clones drive the same consumer.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<ConsumerShared>,
}

struct ConsumerShared {
    name: String,
    options: ConsumerOptions,
    pool: Arc<ChannelPool>,
    lifecycle: tokio::sync::Mutex<()>,
    status: Mutex<ConsumerStatus>,
    stop_signal: Mutex<CancellationToken>,
    session: Mutex<Option<Session>>,
    queue: RwLock<Arc<IntakeQueue>>,
}

/// What a running consumer holds on to.
struct Session {
    channel: Option<PooledChannel>,
    host: Arc<ChannelHost>,
    consumer_tag: String,
    handler: Arc<IntakeHandler>,
    /// Cancelled when the consumer is asked to stop.
    shutdown: CancellationToken,
    /// Cancelled to abort writes blocked on a full intake queue.
    intake: CancellationToken,
    supervising: bool,
}

impl Consumer {
    pub fn new(
        name: impl Into<String>,
        options: ConsumerOptions,
        pool: Arc<ChannelPool>,
    ) -> Result<Self, ConsumerError> {
        options.validate()?;
        Ok(Self {
            shared: Arc::new(ConsumerShared {
                name: name.into(),
                options,
                pool,
                lifecycle: tokio::sync::Mutex::new(()),
                status: Mutex::new(ConsumerStatus::Stopped),
                stop_signal: Mutex::new(CancellationToken::new()),
                session: Mutex::new(None),
                queue: RwLock::new(Arc::new(IntakeQueue::closed())),
            }),
        })
    }

    /// Build the consumer named `name` from the aggregate settings.
    pub fn from_settings(
        settings: &RuntimeSettings,
        name: &str,
        pool: Arc<ChannelPool>,
    ) -> Result<Self, ConsumerError> {
        let options = settings.consumer_options(name)?.clone();
        Self::new(name, options, pool)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.shared.options
    }

    pub fn status(&self) -> ConsumerStatus {
        *lock(&self.shared.status)
    }

    /// The tag of the consumer registration currently in effect.
    pub fn consumer_tag(&self) -> Option<String> {
        lock(&self.shared.session)
            .as_ref()
            .map(|session| session.consumer_tag.clone())
    }

    /// The channel the consumer is registered on, while it runs.
    pub fn channel(&self) -> Option<Arc<ChannelHost>> {
        lock(&self.shared.session)
            .as_ref()
            .map(|session| Arc::clone(&session.host))
    }

    /// Number of deliveries waiting in the intake queue.
    pub fn buffered(&self) -> usize {
        self.shared.queue().pending()
    }

    /// Start consuming.
    ///
    /// Does nothing if the consumer is disabled or running already. Registration is retried
    /// every `sleep_on_error` until it succeeds or [`Consumer::stop`] is called, in which case
    /// [`ConsumerError::Cancelled`] is returned.
    #[tracing::instrument(
        name = "consumer_start",
        skip(self),
        fields(consumer = %self.shared.name, queue_name = %self.shared.options.queue_name)
    )]
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        if !shared.options.enabled {
            tracing::info!("Consumer is disabled, not starting it");
            return Ok(());
        }
        if *lock(&shared.status) != ConsumerStatus::Stopped {
            return Ok(());
        }
        // Cancelled by any stop requested since the last stop went through, including one
        // waiting on the lifecycle lock behind this start.
        let shutdown = lock(&shared.stop_signal).clone();
        if shutdown.is_cancelled() {
            return Err(ConsumerError::Cancelled);
        }
        shared.set_status(ConsumerStatus::Starting);
        let queue = Arc::new(IntakeQueue::new(
            usize::from(shared.options.batch_size),
            shared.options.behavior_when_full,
        ));
        *shared.queue.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&queue);

        let ackable = !shared.options.auto_ack;
        let intake = CancellationToken::new();
        loop {
            let attempt = shared
                .open_session(&queue, ackable, &shutdown, &intake)
                .await;
            match attempt {
                Ok(session) => {
                    tracing::info!(
                        consumer_tag = %session.consumer_tag,
                        channel_id = session.host.id(),
                        "Consumer started"
                    );
                    *lock(&shared.session) = Some(session);
                    shared.set_status(ConsumerStatus::Started);
                    return Ok(());
                }
                Err(e) if e.is_terminal() => {
                    queue.close_writer();
                    shared.set_status(ConsumerStatus::Stopped);
                    if shutdown.is_cancelled() {
                        return Err(ConsumerError::Cancelled);
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to start consumer, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            queue.close_writer();
                            shared.set_status(ConsumerStatus::Stopped);
                            return Err(ConsumerError::Cancelled);
                        }
                        _ = tokio::time::sleep(shared.pool.options().sleep_on_error()) => {}
                    }
                }
            }
        }
    }

    /// Stop consuming.
    ///
    /// The intake queue stops accepting deliveries straight away. Then:
    /// - with `immediate`, the channel is closed and whatever sits in the intake queue is thrown
    ///   away. Those deliveries were never acknowledged: the broker delivers them again.
    /// - otherwise, the consumer registration is cancelled and the call returns once readers
    ///   have pulled every buffered delivery.
    #[tracing::instrument(
        name = "consumer_stop",
        skip(self),
        fields(consumer = %self.shared.name, queue_name = %self.shared.options.queue_name)
    )]
    pub async fn stop(&self, immediate: bool) -> Result<(), ConsumerError> {
        let shared = &self.shared;
        // Interrupt a start that is still retrying.
        lock(&shared.stop_signal).cancel();
        let _lifecycle = shared.lifecycle.lock().await;
        *lock(&shared.stop_signal) = CancellationToken::new();
        if *lock(&shared.status) != ConsumerStatus::Started {
            return Ok(());
        }
        shared.set_status(ConsumerStatus::Stopping);

        let session = lock(&shared.session).take();
        let queue = shared.queue();
        queue.close_writer();
        let Some(mut session) = session else {
            shared.set_status(ConsumerStatus::Stopped);
            return Ok(());
        };
        session.shutdown.cancel();
        let channel = session.channel.take();

        if immediate {
            session.intake.cancel();
            if let Some(channel) = channel {
                shared.pool.return_channel(channel, true).await;
            }
            let discarded = queue.abandon().await;
            tracing::info!(discarded, "Consumer stopped immediately");
        } else {
            if let Err(e) = session
                .host
                .channel()
                .basic_cancel(&session.consumer_tag)
                .await
            {
                tracing::debug!(error = %e, "Failed to cancel consumer registration");
            }
            queue.drained().await;
            if let Some(channel) = channel {
                let had_error = !session.host.healthy();
                shared.pool.return_channel(channel, had_error).await;
            }
            tracing::info!("Consumer stopped");
        }
        shared.set_status(ConsumerStatus::Stopped);
        Ok(())
    }

    /// Read the next delivery, waiting for one if the intake queue is empty.
    ///
    /// Fails with [`ConsumerError::QueueClosed`] once the consumer is stopped and the intake
    /// queue is empty.
    pub async fn read(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<ReceivedMessage>, ConsumerError> {
        self.shared.queue().read(cancel).await
    }

    /// Wait for a delivery, then take everything else the intake queue holds at that point.
    pub async fn read_until_empty(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<ReceivedMessage>>, ConsumerError> {
        let queue = self.shared.queue();
        let first = queue.read(cancel).await?;
        let mut messages = vec![first];
        messages.extend(queue.try_read_all());
        Ok(messages)
    }

    /// Deliveries as a stream.
    ///
    /// Every poll reads from the intake queue of the current run, so the stream can be taken
    /// before [`Consumer::start`] and follows the consumer across restarts. It ends at the first
    /// poll that finds the consumer stopped with an empty intake queue.
    pub fn stream(&self) -> impl Stream<Item = Arc<ReceivedMessage>> + Send + 'static {
        futures_util::stream::unfold(
            (Arc::clone(&self.shared), CancellationToken::new()),
            |(shared, cancel)| async move {
                let message = shared.queue().read(&cancel).await.ok()?;
                Some((message, (shared, cancel)))
            },
        )
    }
}

impl ConsumerShared {
    fn queue(&self) -> Arc<IntakeQueue> {
        Arc::clone(&self.queue.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn set_status(&self, status: ConsumerStatus) {
        *lock(&self.status) = status;
    }

    async fn open_session(
        self: &Arc<Self>,
        queue: &Arc<IntakeQueue>,
        ackable: bool,
        shutdown: &CancellationToken,
        intake: &CancellationToken,
    ) -> Result<Session, ConsumerError> {
        let channel = self.pool.acquire(ackable, shutdown).await?;
        let host = channel.host();
        let handler = Arc::new(IntakeHandler {
            queue: Arc::clone(queue),
            channel: Arc::clone(&host),
            ackable,
            intake: intake.clone(),
            consumer: Arc::downgrade(self),
        });
        match self.register(&host, &handler).await {
            Ok(consumer_tag) => Ok(Session {
                channel: Some(channel),
                host,
                consumer_tag,
                handler,
                shutdown: shutdown.clone(),
                intake: intake.clone(),
                supervising: false,
            }),
            Err(e) => {
                self.pool.return_channel(channel, true).await;
                Err(e)
            }
        }
    }

    async fn register(
        &self,
        host: &ChannelHost,
        handler: &Arc<IntakeHandler>,
    ) -> Result<String, ConsumerError> {
        let channel = host.channel();
        channel.basic_qos(self.options.batch_size).await?;
        let handler: Arc<dyn DeliveryHandler> = handler.clone();
        let consumer_tag = channel
            .basic_consume(
                &self.options.queue_name,
                &Uuid::new_v4().to_string(),
                self.options.auto_ack,
                host.consume_arguments(),
                handler,
            )
            .await?;
        Ok(consumer_tag)
    }

    fn on_unexpected_shutdown(self: &Arc<Self>, reason: ShutdownReason) {
        if *lock(&self.status) != ConsumerStatus::Started {
            return;
        }
        let (host, handler, shutdown) = {
            let mut session = lock(&self.session);
            let Some(session) = session.as_mut() else {
                return;
            };
            if session.supervising || session.shutdown.is_cancelled() {
                return;
            }
            session.supervising = true;
            (
                Arc::clone(&session.host),
                Arc::clone(&session.handler),
                session.shutdown.clone(),
            )
        };
        tracing::warn!(
            consumer = %self.name,
            %reason,
            "Consumer registration shut down unexpectedly, resuming once the channel is healthy"
        );
        tokio::spawn(Arc::clone(self).resume(host, handler, shutdown));
    }

    /// Re-establish the consumer registration after an unexpected shutdown.
    ///
    /// Deliveries received before the shutdown are not replayed: those that were not
    /// acknowledged are redelivered by the broker.
    #[tracing::instrument(name = "consumer_resume", skip_all, fields(consumer = %self.name))]
    async fn resume(
        self: Arc<Self>,
        host: Arc<ChannelHost>,
        handler: Arc<IntakeHandler>,
        shutdown: CancellationToken,
    ) {
        loop {
            if let Err(e) = self.pool.wait_until_healthy(&host, &shutdown).await {
                tracing::debug!(error = %e, "Gave up waiting for the channel");
                break;
            }
            if let Some(consumer_tag) = host.take_recovered_consumer_tag() {
                tracing::info!(%consumer_tag, "Consumer registration recovered by the broker client");
                self.update_consumer_tag(consumer_tag);
                break;
            }
            match self.register(&host, &handler).await {
                Ok(consumer_tag) => {
                    tracing::info!(%consumer_tag, "Consumer registration re-established");
                    self.update_consumer_tag(consumer_tag);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to re-register consumer, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.pool.options().sleep_on_error()) => {}
                    }
                }
            }
        }
        if let Some(session) = lock(&self.session).as_mut() {
            session.supervising = false;
        }
    }

    fn update_consumer_tag(&self, consumer_tag: String) {
        if let Some(session) = lock(&self.session).as_mut() {
            session.consumer_tag = consumer_tag;
        }
    }
}

/// Writes deliveries to the intake queue of a consumer.
struct IntakeHandler {
    queue: Arc<IntakeQueue>,
    channel: Arc<ChannelHost>,
    ackable: bool,
    intake: CancellationToken,
    consumer: Weak<ConsumerShared>,
}

#[async_trait::async_trait]
impl DeliveryHandler for IntakeHandler {
    async fn on_delivery(&self, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let message = Arc::new(ReceivedMessage::new(
            delivery,
            Arc::clone(&self.channel),
            self.ackable,
        ));
        if let Err(e) = self.queue.write(message, &self.intake).await {
            tracing::warn!(
                delivery_tag,
                channel_id = self.channel.id(),
                error = %e,
                "Dropped a delivery, it stays unacknowledged"
            );
        }
    }

    fn on_shutdown(&self, reason: ShutdownReason) {
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.on_unexpected_shutdown(reason);
        }
    }
}
