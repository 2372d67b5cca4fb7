//! A multi-stage concurrent processing engine.
//!
//! A [`Pipeline`] is a chain of steps, each taking the output of the previous one, followed by a
//! finalizer that is handed every item once it went through the chain. Each step runs on its
//! own task, processes up to `parallelism` items concurrently and only pulls new items when the
//! buffer in front of the next step has room: a slow step slows down submissions instead of
//! piling up items in memory.
//!
//! A step failing (or panicking) on an item does not bring the pipeline down: the item skips the
//! remaining steps and reaches the finalizer with the fault attached. Faultable steps hand the
//! item back when they fail, so the finalizer still sees what earlier steps produced.
//!
//! ```no_run
//! use carrot_conveyor::pipeline::{Pipeline, PipelineOptions, StepOptions};
//!
//! # async fn run() -> Result<(), carrot_conveyor::pipeline::PipelineError> {
//! let mut pipeline = Pipeline::<u32, String>::new(PipelineOptions::new("doubler").parallelism(4));
//! pipeline
//!     .add_step("double", StepOptions::default(), |n: u32| async move {
//!         Ok::<_, anyhow::Error>(n * 2)
//!     })?
//!     .add_sync_step("format", StepOptions::default(), |n: u32| {
//!         Ok::<_, anyhow::Error>(n.to_string())
//!     })?;
//! pipeline.finalize(|processed| println!("{:?}", processed.value()))?;
//!
//! for n in 1..=5 {
//!     pipeline.queue_for_execution(n).await?;
//! }
//! pipeline.await_completion().await?;
//! # Ok(())
//! # }
//! ```
mod error;
mod fault;
mod health;
mod options;
mod processed;
mod step;
mod work_state;

pub use error::PipelineError;
pub use fault::{Faultable, Faulted, StepFault};
pub use health::{PipelineHealth, StepHealth};
pub use options::{PipelineOptions, ResolvedStepOptions, StepOptions};
pub use processed::Processed;
pub use step::PipelineStep;
pub use work_state::{Letter, WorkState};

use crate::consumers::ReceivedMessage;
use crate::sync::lock;
use fault::join_error_message;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use health::PipelineMetrics;
use step::{downcast, Envelope, StepFn};
use std::any::{type_name, TypeId};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

type FinalizeFn<Out> = Arc<dyn Fn(Processed<Out>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A typed chain of steps from `In` to `Out`.
///
/// Steps are appended with [`Pipeline::add_step`] and [`Pipeline::add_sync_step`]; each must
/// take the output type of the previous step. [`Pipeline::finalize`] checks that the chain ends
/// with `Out`, spawns the stages and freezes the pipeline: from then on items can be submitted
/// with [`Pipeline::queue_for_execution`].
pub struct Pipeline<In, Out> {
    options: PipelineOptions,
    steps: Vec<Arc<PipelineStep>>,
    tail: (TypeId, &'static str),
    metrics: Arc<PipelineMetrics>,
    running: Option<Running>,
    _types: PhantomData<fn(In) -> Out>,
}

struct Running {
    input: Mutex<Option<mpsc::Sender<Envelope>>>,
    finalizer: Mutex<Option<JoinHandle<()>>>,
    completed: Arc<watch::Sender<bool>>,
    next_sequence: AtomicU64,
    health_stop: CancellationToken,
}

impl<In, Out> Pipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            steps: Vec::new(),
            tail: (TypeId::of::<In>(), type_name::<In>()),
            metrics: Arc::default(),
            running: None,
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn steps(&self) -> &[Arc<PipelineStep>] {
        &self.steps
    }

    pub fn is_finalized(&self) -> bool {
        self.running.is_some()
    }

    /// Append an asynchronous step taking `I`, the output type of the previous step.
    pub fn add_step<I, O, E, F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: StepOptions,
        step: F,
    ) -> Result<&mut Self, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Into<anyhow::Error> + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        let name = name.into();
        self.check_input::<I>(&name)?;
        self.push::<I, O>(name, options, StepFn::from_async(step));
        Ok(self)
    }

    /// Append a blocking step taking `I`, the output type of the previous step.
    ///
    /// The step runs on the blocking thread pool.
    pub fn add_sync_step<I, O, E, F>(
        &mut self,
        name: impl Into<String>,
        options: StepOptions,
        step: F,
    ) -> Result<&mut Self, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Into<anyhow::Error> + 'static,
        F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    {
        let name = name.into();
        self.check_input::<I>(&name)?;
        self.push::<I, O>(name, options, StepFn::from_sync(step));
        Ok(self)
    }

    /// Append an asynchronous step over a [`Faultable`] item, the output type of the previous step.
    ///
    /// On failure the step returns the item in a [`Faulted`]: the fault is recorded on the item,
    /// which skips the remaining steps and reaches the finalizer.
    pub fn add_faultable_step<T, F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: StepOptions,
        step: F,
    ) -> Result<&mut Self, PipelineError>
    where
        T: Faultable,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Faulted<T>>> + Send + 'static,
    {
        let name = name.into();
        self.check_input::<T>(&name)?;
        self.push::<T, T>(name, options, StepFn::faultable_async(step));
        Ok(self)
    }

    /// Append a blocking step working in place on a [`Faultable`] item.
    pub fn add_sync_faultable_step<T, E, F>(
        &mut self,
        name: impl Into<String>,
        options: StepOptions,
        step: F,
    ) -> Result<&mut Self, PipelineError>
    where
        T: Faultable,
        E: Into<anyhow::Error> + 'static,
        F: Fn(&mut T) -> Result<(), E> + Send + Sync + 'static,
    {
        let name = name.into();
        self.check_input::<T>(&name)?;
        self.push::<T, T>(name, options, StepFn::faultable_sync(step));
        Ok(self)
    }

    /// Terminate the pipeline with a finalizer and start it.
    ///
    /// The finalizer is called once per submitted item, one item at a time, in the order items
    /// come out of the last step. Must be called from within a Tokio runtime.
    pub fn finalize<F>(&mut self, finalizer: F) -> Result<(), PipelineError>
    where
        F: Fn(Processed<Out>) + Send + Sync + 'static,
    {
        self.start(Arc::new(
            move |processed: Processed<Out>| -> BoxFuture<'static, ()> {
                finalizer(processed);
                Box::pin(std::future::ready(()))
            },
        ))
    }

    /// Same as [`Pipeline::finalize`], with an asynchronous finalizer.
    pub fn finalize_async<F, Fut>(&mut self, finalizer: F) -> Result<(), PipelineError>
    where
        F: Fn(Processed<Out>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start(Arc::new(
            move |processed: Processed<Out>| -> BoxFuture<'static, ()> {
                Box::pin(finalizer(processed))
            },
        ))
    }

    /// Submit an item, waiting for room in the first buffer.
    pub async fn queue_for_execution(&self, item: In) -> Result<(), PipelineError> {
        self.submit(item, None).await
    }

    /// Submit an item produced from `origin`.
    ///
    /// `origin` is marked complete once the finalizer is done with the item.
    pub async fn queue_for_execution_from(
        &self,
        item: In,
        origin: Arc<ReceivedMessage>,
    ) -> Result<(), PipelineError> {
        self.submit(item, Some(origin)).await
    }

    /// Stop accepting items and wait for every accepted item to go through the finalizer.
    pub async fn await_completion(&self) -> Result<(), PipelineError> {
        let running = self.running()?;
        lock(&running.input).take();
        let finalizer = lock(&running.finalizer).take();
        if let Some(finalizer) = finalizer {
            if let Err(e) = finalizer.await {
                running.completed.send_replace(true);
                running.health_stop.cancel();
                return Err(anyhow::anyhow!(
                    "the finalizer of pipeline `{}` terminated abnormally: {}",
                    self.options.name,
                    join_error_message(e)
                )
                .into());
            }
        }
        let mut completed = running.completed.subscribe();
        // The sender is owned by `running`: this cannot fail.
        let _ = completed.wait_for(|completed| *completed).await;
        running.health_stop.cancel();
        Ok(())
    }

    pub fn health(&self) -> PipelineHealth {
        PipelineHealth {
            name: self.options.name.clone(),
            ready: self
                .running
                .as_ref()
                .map(|running| lock(&running.input).is_some())
                .unwrap_or(false),
            completed: self
                .running
                .as_ref()
                .map(|running| *running.completed.borrow())
                .unwrap_or(false),
            submitted: self.metrics.submitted.load(Ordering::SeqCst),
            processed: self.metrics.processed.load(Ordering::SeqCst),
            faulted: self.metrics.faulted.load(Ordering::SeqCst),
            faulted_steps: self
                .steps
                .iter()
                .filter_map(|step| StepHealth::of(step))
                .collect(),
        }
    }

    fn check_input<I: 'static>(&self, step: &str) -> Result<(), PipelineError> {
        if self.running.is_some() {
            return Err(PipelineError::AlreadyFinalized(self.options.name.clone()));
        }
        if self.tail.0 != TypeId::of::<I>() {
            return Err(PipelineError::StepTypeMismatch {
                step: step.to_owned(),
                expected: type_name::<I>(),
                found: self.tail.1,
            });
        }
        Ok(())
    }

    fn push<I: 'static, O: 'static>(&mut self, name: String, options: StepOptions, run: StepFn) {
        let step = PipelineStep::new(
            self.steps.len(),
            name,
            options.resolve(&self.options),
            run,
            (TypeId::of::<I>(), type_name::<I>()),
            (TypeId::of::<O>(), type_name::<O>()),
        );
        self.tail = (step.output_type_id(), step.output_type());
        self.steps.push(Arc::new(step));
    }

    fn start(&mut self, finalizer: FinalizeFn<Out>) -> Result<(), PipelineError> {
        if self.running.is_some() {
            return Err(PipelineError::AlreadyFinalized(self.options.name.clone()));
        }
        if self.tail.0 != TypeId::of::<Out>() {
            return Err(PipelineError::OutputTypeMismatch {
                expected: type_name::<Out>(),
                found: self.tail.1,
            });
        }
        if let Some(last) = self.steps.last() {
            last.mark_last();
        }

        let default_buffer = self.options.buffer_size.max(1);
        let buffer_in_front_of = |index: usize| {
            self.steps
                .get(index)
                .map(|step| step.options().buffer_size)
                .unwrap_or(default_buffer)
        };
        let (input, mut receiver) = mpsc::channel(buffer_in_front_of(0));
        for (index, step) in self.steps.iter().enumerate() {
            let (sender, next) = mpsc::channel(buffer_in_front_of(index + 1));
            tokio::spawn(run_stage(Arc::clone(step), receiver, sender));
            receiver = next;
        }

        let (completed, _) = watch::channel(false);
        let completed = Arc::new(completed);
        let finalizer = tokio::spawn(run_finalizer(
            self.options.name.clone(),
            receiver,
            finalizer,
            Arc::clone(&self.metrics),
            Arc::clone(&completed),
        ));
        let health_stop = CancellationToken::new();
        tokio::spawn(health::monitor(
            self.options.name.clone(),
            self.steps.clone(),
            self.options.health_check_interval,
            health_stop.clone(),
        ));

        self.running = Some(Running {
            input: Mutex::new(Some(input)),
            finalizer: Mutex::new(Some(finalizer)),
            completed,
            next_sequence: AtomicU64::new(0),
            health_stop,
        });
        tracing::info!(
            pipeline = %self.options.name,
            steps = self.steps.len(),
            "Pipeline is ready"
        );
        Ok(())
    }

    fn running(&self) -> Result<&Running, PipelineError> {
        self.running
            .as_ref()
            .ok_or_else(|| PipelineError::NotFinalized(self.options.name.clone()))
    }

    async fn submit(
        &self,
        item: In,
        origin: Option<Arc<ReceivedMessage>>,
    ) -> Result<(), PipelineError> {
        let running = self.running()?;
        let sender = lock(&running.input)
            .clone()
            .ok_or_else(|| PipelineError::Completed(self.options.name.clone()))?;
        let envelope = Envelope {
            sequence: running.next_sequence.fetch_add(1, Ordering::SeqCst),
            item: Some(Box::new(item)),
            fault: None,
            origin,
        };
        sender
            .send(envelope)
            .await
            .map_err(|_| PipelineError::Completed(self.options.name.clone()))?;
        self.metrics.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<In, Out> Drop for Pipeline<In, Out> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.health_stop.cancel();
        }
    }
}

async fn run_stage(
    step: Arc<PipelineStep>,
    input: mpsc::Receiver<Envelope>,
    output: mpsc::Sender<Envelope>,
) {
    let options = step.options();
    let executions =
        ReceiverStream::new(input).map(move |envelope| Arc::clone(&step).execute(envelope));
    if options.ensure_ordered {
        forward(executions.buffered(options.parallelism), output).await;
    } else {
        forward(executions.buffer_unordered(options.parallelism), output).await;
    }
}

async fn forward(stream: impl Stream<Item = Envelope>, output: mpsc::Sender<Envelope>) {
    futures_util::pin_mut!(stream);
    while let Some(envelope) = stream.next().await {
        if output.send(envelope).await.is_err() {
            break;
        }
    }
}

async fn run_finalizer<Out: Send + 'static>(
    name: String,
    mut input: mpsc::Receiver<Envelope>,
    finalizer: FinalizeFn<Out>,
    metrics: Arc<PipelineMetrics>,
    completed: Arc<watch::Sender<bool>>,
) {
    while let Some(envelope) = input.recv().await {
        let Envelope {
            sequence,
            item,
            fault,
            origin,
        } = envelope;
        let processed = match (item.map(downcast::<Out>), fault) {
            (Some(Ok(output)), None) => Processed::done(sequence, output, origin.clone()),
            (item, Some(fault)) => {
                Processed::faulted(sequence, fault, item.and_then(Result::ok), origin.clone())
            }
            (item, None) => {
                let error = match item {
                    Some(Err(e)) => e,
                    _ => anyhow::anyhow!("the item went missing"),
                };
                tracing::error!(pipeline = %name, sequence, error = %error, "Dropping a malformed item");
                if let Some(origin) = origin {
                    origin.complete();
                }
                continue;
            }
        };
        metrics.record(processed.is_faulted());

        let finalizer = Arc::clone(&finalizer);
        if let Err(e) = tokio::spawn(async move { finalizer(processed).await }).await {
            tracing::error!(
                pipeline = %name,
                sequence,
                error = %join_error_message(e),
                "Pipeline finalizer panicked"
            );
        }
        if let Some(origin) = origin {
            origin.complete();
        }
    }
    completed.send_replace(true);
    tracing::debug!(pipeline = %name, "Pipeline completed");
}
