use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Unknown resource class: {0}")]
    UnknownResourceClass(String),

    #[error("Invalid resource spec: {0}")]
    InvalidResourceSpec(String),

    #[error("Payload store error at {path}: {source}")]
    Payload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Dispatcher is not running")]
    DispatcherUnavailable,

    #[error("Executor is not accepting work")]
    ExecutorUnavailable,
}

impl BatchError {
    pub fn payload(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BatchError::Payload {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
