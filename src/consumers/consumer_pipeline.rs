use super::{Consumer, ConsumerError, ReceivedMessage};
use crate::pipeline::{Pipeline, PipelineError};
use crate::sync::lock;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How the feeder of a [`ConsumerPipeline`] pulls from the intake queue.
///
/// Both strategies submit every delivery, in intake order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedMode {
    /// Pull one delivery at a time and submit it.
    #[default]
    Stream,
    /// Wait for a delivery, then take everything the intake queue holds and submit it.
    Drain,
}

/// Feeds the deliveries of a [`Consumer`] into a [`Pipeline`].
///
/// Each delivery is converted into the pipeline input with `In::from` and submitted together with
/// the delivery itself, which is marked complete once the finalizer is done with it. With
/// `consumer_pipeline.wait_for_completion` set, the feeder waits for that before pulling the next
/// delivery: at most one delivery is inside the pipeline at any time.
///
/// Stopping completes the pipeline: a `ConsumerPipeline` runs once.
pub struct ConsumerPipeline<In, Out> {
    shared: Arc<Shared<In, Out>>,
}

struct Shared<In, Out> {
    consumer: Consumer,
    pipeline: Pipeline<In, Out>,
    wait_for_completion: bool,
    lifecycle: tokio::sync::Mutex<()>,
    feeder: Mutex<Option<Feeder>>,
    completed: watch::Sender<bool>,
}

struct Feeder {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl<In, Out> ConsumerPipeline<In, Out>
where
    In: From<Arc<ReceivedMessage>> + Send + 'static,
    Out: Send + 'static,
{
    /// `pipeline` must be finalized.
    pub fn new(consumer: Consumer, pipeline: Pipeline<In, Out>) -> Result<Self, ConsumerError> {
        if !pipeline.is_finalized() {
            return Err(PipelineError::NotFinalized(pipeline.name().to_owned()).into());
        }
        let wait_for_completion = consumer.options().consumer_pipeline.wait_for_completion;
        let (completed, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                consumer,
                pipeline,
                wait_for_completion,
                lifecycle: tokio::sync::Mutex::new(()),
                feeder: Mutex::new(None),
                completed,
            }),
        })
    }

    pub fn consumer(&self) -> &Consumer {
        &self.shared.consumer
    }

    pub fn pipeline(&self) -> &Pipeline<In, Out> {
        &self.shared.pipeline
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.feeder).is_some()
    }

    /// Start the consumer, then feed its deliveries to the pipeline.
    ///
    /// Does nothing if the pipeline is being fed already.
    #[tracing::instrument(
        name = "consumer_pipeline_start",
        skip(self),
        fields(consumer = %self.shared.consumer.name(), pipeline = %self.shared.pipeline.name())
    )]
    pub async fn start(&self, feed_mode: FeedMode) -> Result<(), ConsumerError> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        if lock(&shared.feeder).is_some() {
            return Ok(());
        }
        if *shared.completed.borrow() || !shared.pipeline.health().ready {
            return Err(PipelineError::Completed(shared.pipeline.name().to_owned()).into());
        }
        shared.consumer.start().await?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(shared).feed(feed_mode, cancel.clone()));
        *lock(&shared.feeder) = Some(Feeder { handle, cancel });
        tracing::info!(?feed_mode, "Consumer pipeline started");
        Ok(())
    }

    /// Stop feeding the pipeline and complete it.
    ///
    /// The consumer is stopped with the same `immediate` flag (see [`Consumer::stop`]): a
    /// graceful stop feeds every buffered delivery to the pipeline first. In both cases, the
    /// call returns once every delivery fed to the pipeline went through its finalizer.
    #[tracing::instrument(
        name = "consumer_pipeline_stop",
        skip(self),
        fields(consumer = %self.shared.consumer.name(), pipeline = %self.shared.pipeline.name())
    )]
    pub async fn stop(&self, immediate: bool) -> Result<(), ConsumerError> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        let Some(feeder) = lock(&shared.feeder).take() else {
            return Ok(());
        };
        if immediate {
            feeder.cancel.cancel();
        }
        let stopped = shared.consumer.stop(immediate).await;
        // A stopped consumer has a closed intake queue: the feeder is about to run dry.
        // Make sure it does not linger if the consumer could not be stopped.
        if stopped.is_err() {
            feeder.cancel.cancel();
        }
        if let Err(e) = feeder.handle.await {
            tracing::error!(error = %e, "Consumer pipeline feeder terminated abnormally");
        }
        let completion = shared.pipeline.await_completion().await;
        shared.completed.send_replace(true);
        tracing::info!("Consumer pipeline stopped");
        stopped?;
        completion?;
        Ok(())
    }

    /// Wait for [`ConsumerPipeline::stop`] to be done.
    pub async fn await_completion(&self) {
        let mut completed = self.shared.completed.subscribe();
        // The sender is owned by `self`: this cannot fail.
        let _ = completed.wait_for(|completed| *completed).await;
    }

    /// Start, run until `shutdown` fires, then stop gracefully.
    pub async fn run_until_cancelled(
        &self,
        feed_mode: FeedMode,
        shutdown: CancellationToken,
    ) -> Result<(), ConsumerError> {
        self.start(feed_mode).await?;
        shutdown.cancelled().await;
        self.stop(false).await
    }
}

impl<In, Out> Shared<In, Out>
where
    In: From<Arc<ReceivedMessage>> + Send + 'static,
    Out: Send + 'static,
{
    #[tracing::instrument(
        name = "consumer_pipeline_feed",
        skip_all,
        fields(consumer = %self.consumer.name(), pipeline = %self.pipeline.name())
    )]
    async fn feed(self: Arc<Self>, feed_mode: FeedMode, cancel: CancellationToken) {
        let outcome = match feed_mode {
            FeedMode::Stream => self.feed_one_by_one(&cancel).await,
            FeedMode::Drain => self.feed_batches(&cancel).await,
        };
        match outcome {
            Ok(()) | Err(ConsumerError::QueueClosed) | Err(ConsumerError::Cancelled) => {
                tracing::debug!("Consumer pipeline feeder is done");
            }
            Err(e) => tracing::error!(error = %e, "Consumer pipeline feeder failed"),
        }
    }

    async fn feed_one_by_one(&self, cancel: &CancellationToken) -> Result<(), ConsumerError> {
        loop {
            let message = self.consumer.read(cancel).await?;
            self.submit(message, cancel).await?;
        }
    }

    async fn feed_batches(&self, cancel: &CancellationToken) -> Result<(), ConsumerError> {
        loop {
            for message in self.consumer.read_until_empty(cancel).await? {
                self.submit(message, cancel).await?;
            }
        }
    }

    async fn submit(
        &self,
        message: Arc<ReceivedMessage>,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        let item = In::from(Arc::clone(&message));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConsumerError::Cancelled),
            submitted = self.pipeline.queue_for_execution_from(item, Arc::clone(&message)) => submitted?,
        }
        if self.wait_for_completion {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConsumerError::Cancelled),
                _ = message.completion() => {}
            }
        }
        Ok(())
    }
}
