use crate::configuration::ConfigurationError;
use crate::transport::TransportError;

/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The caller's cancellation token fired while waiting.
    #[error("The operation was cancelled")]
    Cancelled,
    /// The pool has been shut down.
    #[error("The pool has been shut down")]
    Closed,
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self::Transport(err.into())
    }
}

impl From<deadpool::managed::PoolError<Error>> for Error {
    fn from(err: deadpool::managed::PoolError<Error>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            deadpool::managed::PoolError::Closed => Self::Closed,
            err => Self::Other(anyhow::anyhow!("{err}")),
        }
    }
}
