use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("Topic Error - {0}")]
    Topic(String),

    #[error("Illegal Config Update - {0}")]
    ConfigUpdate(String),

    #[error("Unsupported Format - {0}")]
    UnsupportedFormat(String),

    #[error("Worker Error - {0}")]
    Worker(String),

    #[error("Task Error - {0}")]
    Task(String),
}
