use std::time::Duration;

/// Defaults applied to every step of a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Used in logs.
    pub name: String,
    /// How many items a step processes concurrently.
    pub parallelism: usize,
    /// Whether a step emits its outputs in the order its inputs came in.
    pub ensure_ordered: bool,
    /// Capacity of the buffer in front of each step (and of the finalizer).
    /// Submissions wait while it is full.
    pub buffer_size: usize,
    /// Interval between two checks for faults captured by the steps.
    pub health_check_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            name: "pipeline".into(),
            parallelism: 1,
            ensure_ordered: true,
            buffer_size: 100,
            health_check_interval: Duration::from_secs(10),
        }
    }
}

impl PipelineOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn ensure_ordered(mut self, ensure_ordered: bool) -> Self {
        self.ensure_ordered = ensure_ordered;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }
}

/// Per-step overrides of [`PipelineOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOptions {
    pub parallelism: Option<usize>,
    pub ensure_ordered: Option<bool>,
    pub buffer_size: Option<usize>,
}

impl StepOptions {
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn ensure_ordered(mut self, ensure_ordered: bool) -> Self {
        self.ensure_ordered = Some(ensure_ordered);
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    pub(crate) fn resolve(&self, defaults: &PipelineOptions) -> ResolvedStepOptions {
        ResolvedStepOptions {
            parallelism: self.parallelism.unwrap_or(defaults.parallelism).max(1),
            ensure_ordered: self.ensure_ordered.unwrap_or(defaults.ensure_ordered),
            buffer_size: self.buffer_size.unwrap_or(defaults.buffer_size).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedStepOptions {
    pub parallelism: usize,
    pub ensure_ordered: bool,
    pub buffer_size: usize,
}
