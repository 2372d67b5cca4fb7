use super::fault::join_error_message;
use super::options::ResolvedStepOptions;
use super::{Faultable, Faulted, StepFault};
use crate::consumers::ReceivedMessage;
use crate::sync::lock;
use anyhow::anyhow;
use futures_util::future::BoxFuture;
use std::any::{Any, TypeId};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) type Item = Box<dyn Any + Send>;
type AsyncFn = Arc<dyn Fn(Item) -> BoxFuture<'static, Result<Item, StepFailure>> + Send + Sync>;
type SyncFn = Arc<dyn Fn(Item) -> Result<Item, StepFailure> + Send + Sync>;
type MarkFaulted = fn(&mut Item, &StepFault);

/// What travels between stages.
///
/// A faulted envelope skips the remaining stages. It still carries the item if the failing step
/// handed it back.
pub(crate) struct Envelope {
    pub(crate) sequence: u64,
    pub(crate) item: Option<Item>,
    pub(crate) fault: Option<StepFault>,
    pub(crate) origin: Option<Arc<ReceivedMessage>>,
}

/// A failed execution, with the item when the step gave it back.
struct StepFailure {
    error: anyhow::Error,
    item: Option<Item>,
}

impl StepFailure {
    fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: error.into(),
            item: None,
        }
    }
}

impl From<anyhow::Error> for StepFailure {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

enum StepKind {
    Async(AsyncFn),
    Sync(SyncFn),
}

pub(crate) struct StepFn {
    kind: StepKind,
    mark_faulted: Option<MarkFaulted>,
}

impl StepFn {
    pub(crate) fn from_async<I, O, E, F, Fut>(step: F) -> Self
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Into<anyhow::Error> + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        let run = move |input: Item| -> BoxFuture<'static, Result<Item, StepFailure>> {
            match downcast::<I>(input) {
                Ok(input) => {
                    let output = step(input);
                    Box::pin(async move {
                        let output = output.await.map_err(|e| StepFailure::new(e))?;
                        Ok(Box::new(output) as Item)
                    })
                }
                Err(e) => Box::pin(std::future::ready(Err(e.into()))),
            }
        };
        Self {
            kind: StepKind::Async(Arc::new(run)),
            mark_faulted: None,
        }
    }

    pub(crate) fn from_sync<I, O, E, F>(step: F) -> Self
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Into<anyhow::Error> + 'static,
        F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    {
        let run = move |input: Item| -> Result<Item, StepFailure> {
            let output = step(downcast::<I>(input)?).map_err(|e| StepFailure::new(e))?;
            Ok(Box::new(output) as Item)
        };
        Self {
            kind: StepKind::Sync(Arc::new(run)),
            mark_faulted: None,
        }
    }

    /// An asynchronous step that hands the item back when it fails.
    pub(crate) fn faultable_async<T, F, Fut>(step: F) -> Self
    where
        T: Faultable,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Faulted<T>>> + Send + 'static,
    {
        let run = move |input: Item| -> BoxFuture<'static, Result<Item, StepFailure>> {
            match downcast::<T>(input) {
                Ok(input) => {
                    let output = step(input);
                    Box::pin(async move {
                        match output.await {
                            Ok(item) => Ok(Box::new(item) as Item),
                            Err(Faulted { item, error }) => Err(StepFailure {
                                error,
                                item: Some(Box::new(item) as Item),
                            }),
                        }
                    })
                }
                Err(e) => Box::pin(std::future::ready(Err(e.into()))),
            }
        };
        Self {
            kind: StepKind::Async(Arc::new(run)),
            mark_faulted: Some(mark_faulted::<T> as MarkFaulted),
        }
    }

    /// A blocking step working on the item in place: the item survives a failure.
    pub(crate) fn faultable_sync<T, E, F>(step: F) -> Self
    where
        T: Faultable,
        E: Into<anyhow::Error> + 'static,
        F: Fn(&mut T) -> Result<(), E> + Send + Sync + 'static,
    {
        let run = move |input: Item| -> Result<Item, StepFailure> {
            let mut item = downcast::<T>(input)?;
            match step(&mut item) {
                Ok(()) => Ok(Box::new(item) as Item),
                Err(e) => Err(StepFailure {
                    error: e.into(),
                    item: Some(Box::new(item) as Item),
                }),
            }
        };
        Self {
            kind: StepKind::Sync(Arc::new(run)),
            mark_faulted: Some(mark_faulted::<T> as MarkFaulted),
        }
    }
}

fn mark_faulted<T: Faultable>(item: &mut Item, fault: &StepFault) {
    if let Some(item) = (**item).downcast_mut::<T>() {
        item.set_fault(fault.clone());
    }
}

pub(crate) fn downcast<T: 'static>(item: Item) -> anyhow::Result<T> {
    item.downcast::<T>()
        .map(|item| *item)
        .map_err(|_| anyhow!("expected an item of type `{}`", std::any::type_name::<T>()))
}

/// A step of a [`Pipeline`](super::Pipeline).
pub struct PipelineStep {
    index: usize,
    name: String,
    options: ResolvedStepOptions,
    run: StepFn,
    input: (TypeId, &'static str),
    output: (TypeId, &'static str),
    is_last: AtomicBool,
    faults: AtomicU64,
    last_fault: Mutex<Option<StepFault>>,
    unreported: AtomicBool,
}

impl std::fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStep")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("is_async", &self.is_async())
            .field("input", &self.input.1)
            .field("output", &self.output.1)
            .field("options", &self.options)
            .finish()
    }
}

impl PipelineStep {
    pub(crate) fn new(
        index: usize,
        name: String,
        options: ResolvedStepOptions,
        run: StepFn,
        input: (TypeId, &'static str),
        output: (TypeId, &'static str),
    ) -> Self {
        Self {
            index,
            name,
            options,
            run,
            input,
            output,
            is_last: AtomicBool::new(false),
            faults: AtomicU64::new(0),
            last_fault: Mutex::new(None),
            unreported: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_async(&self) -> bool {
        matches!(self.run.kind, StepKind::Async(_))
    }

    pub fn is_last(&self) -> bool {
        self.is_last.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> ResolvedStepOptions {
        self.options
    }

    pub fn input_type(&self) -> &'static str {
        self.input.1
    }

    pub fn output_type(&self) -> &'static str {
        self.output.1
    }

    /// Number of items this step failed on.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::SeqCst)
    }

    /// The most recent failure of this step.
    pub fn fault(&self) -> Option<StepFault> {
        lock(&self.last_fault).clone()
    }

    pub(crate) fn output_type_id(&self) -> TypeId {
        self.output.0
    }

    pub(crate) fn mark_last(&self) {
        self.is_last.store(true, Ordering::SeqCst);
    }

    /// The latest fault, if it was not handed out by a previous call.
    pub(crate) fn take_unreported_fault(&self) -> Option<StepFault> {
        if self.unreported.swap(false, Ordering::SeqCst) {
            self.fault()
        } else {
            None
        }
    }

    /// Run the step on one item. Faulted items go through untouched.
    ///
    /// The step runs in a task of its own so that a panic only takes down the item.
    pub(crate) async fn execute(self: Arc<Self>, envelope: Envelope) -> Envelope {
        let Envelope {
            sequence,
            item,
            fault,
            origin,
        } = envelope;
        let input = match (item, fault) {
            (Some(input), None) => input,
            (item, fault) => {
                return Envelope {
                    sequence,
                    item,
                    fault,
                    origin,
                }
            }
        };
        let outcome = match &self.run.kind {
            StepKind::Async(step) => {
                let step = Arc::clone(step);
                tokio::spawn(async move { step(input).await }).await
            }
            StepKind::Sync(step) => {
                let step = Arc::clone(step);
                tokio::task::spawn_blocking(move || step(input)).await
            }
        };
        let (item, fault) = match outcome {
            Ok(Ok(output)) => (Some(output), None),
            Ok(Err(StepFailure { error, item })) => {
                let fault = self.record_fault(sequence, error, false);
                let item = item.map(|mut item| {
                    if let Some(mark_faulted) = self.run.mark_faulted {
                        mark_faulted(&mut item, &fault);
                    }
                    item
                });
                (item, Some(fault))
            }
            Err(join_error) => {
                let error = anyhow!(join_error_message(join_error));
                (None, Some(self.record_fault(sequence, error, true)))
            }
        };
        Envelope {
            sequence,
            item,
            fault,
            origin,
        }
    }

    fn record_fault(&self, sequence: u64, error: anyhow::Error, panicked: bool) -> StepFault {
        let fault = StepFault::new(self.index, self.name.clone(), error, panicked);
        tracing::debug!(
            step = %self.name,
            step_index = self.index,
            sequence,
            error = %fault,
            "Pipeline step failed"
        );
        *lock(&self.last_fault) = Some(fault.clone());
        self.faults.fetch_add(1, Ordering::SeqCst);
        self.unreported.store(true, Ordering::SeqCst);
        fault
    }
}
