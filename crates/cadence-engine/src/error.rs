use cadence_core::CadenceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CadenceError),

    #[error("job {0} already has a running loop")]
    AlreadyRunning(String),

    #[error("job {0} is running; stop it first")]
    JobRunning(String),

    #[error("job {0} is not running")]
    NotRunning(String),

    #[error("job {0} is stopping")]
    Stopping(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
