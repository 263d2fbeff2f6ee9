use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("database error: {0}")]
    Database(String),

    #[error("no actor registered under name '{0}'")]
    UnknownActor(String),
}
