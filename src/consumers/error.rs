use crate::configuration::ConfigurationError;
use crate::transport::TransportError;

/// Consumer error.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    /// The intake queue has been closed and everything it held has been read.
    #[error("The intake queue is closed and empty")]
    QueueClosed,
    /// The caller's cancellation token fired, or the consumer was stopped, while waiting.
    #[error("The operation was cancelled")]
    Cancelled,
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Pool(#[from] crate::pool::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Pipeline(#[from] crate::pipeline::PipelineError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConsumerError {
    /// Whether retrying the operation is pointless.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Configuration(_)
                | Self::Pipeline(_)
                | Self::Pool(crate::pool::Error::Cancelled | crate::pool::Error::Closed)
        )
    }
}
