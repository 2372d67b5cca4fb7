use super::PipelineStep;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counters shared by the stages of a running pipeline.
#[derive(Debug, Default)]
pub(crate) struct PipelineMetrics {
    pub(crate) submitted: AtomicU64,
    pub(crate) processed: AtomicU64,
    pub(crate) faulted: AtomicU64,
}

impl PipelineMetrics {
    pub(crate) fn record(&self, faulted: bool) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        if faulted {
            self.faulted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Snapshot of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineHealth {
    pub name: String,
    /// Whether the pipeline was finalized and accepts items.
    pub ready: bool,
    /// Whether every accepted item went through the finalizer after completion was requested.
    pub completed: bool,
    pub submitted: u64,
    /// Items that reached the finalizer, faulted or not.
    pub processed: u64,
    pub faulted: u64,
    /// Steps that failed at least once.
    pub faulted_steps: Vec<StepHealth>,
}

impl PipelineHealth {
    /// No step failed so far.
    pub fn is_healthy(&self) -> bool {
        self.faulted_steps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepHealth {
    pub index: usize,
    pub name: String,
    pub faults: u64,
    pub last_fault: Option<String>,
}

impl StepHealth {
    pub(crate) fn of(step: &PipelineStep) -> Option<Self> {
        let faults = step.fault_count();
        (faults > 0).then(|| Self {
            index: step.index(),
            name: step.name().to_owned(),
            faults,
            last_fault: step.fault().map(|fault| fault.to_string()),
        })
    }
}

/// Periodically report the faults captured by the steps since the previous check.
pub(crate) async fn monitor(
    name: String,
    steps: Vec<Arc<PipelineStep>>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for step in &steps {
            if let Some(fault) = step.take_unreported_fault() {
                tracing::warn!(
                    pipeline = %name,
                    step = %step.name(),
                    step_index = step.index(),
                    faults = step.fault_count(),
                    error = %fault,
                    "Pipeline step is faulted"
                );
            }
        }
    }
    tracing::debug!(pipeline = %name, "Pipeline health check stopped");
}
