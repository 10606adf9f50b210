use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid job id '{0}': must be 3-64 lowercase alphanumeric characters or hyphens")]
    InvalidJobId(String),

    #[error("invalid job config: {0}")]
    InvalidConfig(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("job {0} is finalized; no further activity can be recorded")]
    JobFinalized(String),

    #[error("entity not found: {0}")]
    EntityNotFound(u64),

    #[error("corrupt snapshot for job {id}: {reason}")]
    CorruptSnapshot { id: String, reason: String },

    #[error("unsupported snapshot schema version {0}")]
    UnsupportedSchema(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, CadenceError>;
