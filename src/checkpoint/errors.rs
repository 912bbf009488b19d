//! Checkpoint scheduler errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("database is not attached to this checkpointer")]
    NotAttached,

    #[error("database is already attached to this checkpointer")]
    AlreadyAttached,

    #[error("checkpoint executor has shut down")]
    ShutDown,

    #[error("invalid checkpoint config: {0}")]
    InvalidConfig(String),

    #[error("spawn checkpoint worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;
