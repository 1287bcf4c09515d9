use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Direction error: {0}")]
    Direction(String),
    #[error("I/O error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("Invalid format: {0}")]
    Format(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Handle closed: {0}")]
    Closed(String),
}

impl GpioError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        GpioError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for failures of the underlying control files or readiness wait.
    pub fn is_io(&self) -> bool {
        matches!(self, GpioError::Io { .. })
    }
}
