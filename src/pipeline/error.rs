/// Pipeline error.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// A step was appended whose input type is not the output type of the previous step.
    #[error("Step `{step}` takes `{expected}` as input, but the previous step produces `{found}`")]
    StepTypeMismatch {
        step: String,
        expected: &'static str,
        found: &'static str,
    },
    /// The pipeline was finalized while its last step does not produce the declared output.
    #[error("The pipeline produces `{found}`, but `{expected}` was declared as its output")]
    OutputTypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("The pipeline `{0}` is finalized: no more steps can be added")]
    AlreadyFinalized(String),
    #[error("The pipeline `{0}` is not finalized yet")]
    NotFinalized(String),
    /// Completion was requested: the pipeline does not take new items.
    #[error("The pipeline `{0}` does not accept new items")]
    Completed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
