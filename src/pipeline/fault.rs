use std::sync::Arc;

/// The failure of one step on one item.
///
/// Faults never escape the pipeline: the faulted item skips the remaining steps and reaches the
/// finalizer with the fault attached (see [`Processed`](super::Processed)). Faultable steps also
/// record it on the item itself (see [`Faultable`]).
#[derive(thiserror::Error, Debug, Clone)]
#[error("Step {step_index} (`{step_name}`) failed: {error}")]
pub struct StepFault {
    step_index: usize,
    step_name: String,
    panicked: bool,
    error: Arc<anyhow::Error>,
}

impl StepFault {
    pub(crate) fn new(
        step_index: usize,
        step_name: impl Into<String>,
        error: anyhow::Error,
        panicked: bool,
    ) -> Self {
        Self {
            step_index,
            step_name: step_name.into(),
            panicked,
            error: Arc::new(error),
        }
    }

    /// Position of the failing step in the pipeline, starting from 0.
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Whether the step panicked rather than returning an error.
    pub fn panicked(&self) -> bool {
        self.panicked
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Look for an error of type `E` in the chain of the captured error.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

/// Items that can carry the fault of the step that failed on them.
///
/// Steps added with [`Pipeline::add_faultable_step`](super::Pipeline::add_faultable_step) or
/// [`Pipeline::add_sync_faultable_step`](super::Pipeline::add_sync_faultable_step) keep their item
/// when they fail: the fault is recorded on it and the item reaches the finalizer as it was.
pub trait Faultable: Send + 'static {
    fn set_fault(&mut self, fault: StepFault);

    fn fault(&self) -> Option<&StepFault>;

    fn is_faulted(&self) -> bool {
        self.fault().is_some()
    }
}

/// The failure of a faultable step, handing the item back.
#[derive(Debug)]
pub struct Faulted<T> {
    pub item: T,
    pub error: anyhow::Error,
}

impl<T> Faulted<T> {
    pub fn new(item: T, error: impl Into<anyhow::Error>) -> Self {
        Self {
            item,
            error: error.into(),
        }
    }
}

/// Turn a task failure into a readable message.
pub(crate) fn join_error_message(error: tokio::task::JoinError) -> String {
    if error.is_cancelled() {
        return "the step was cancelled".into();
    }
    let panic = error.into_panic();
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "the step panicked".into()
    }
}
