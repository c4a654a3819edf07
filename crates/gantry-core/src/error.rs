use std::path::PathBuf;
use thiserror::Error;

/// Core error type for gantry operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unable to start application from {entry}: {message}")]
    AppStart { entry: PathBuf, message: String },

    #[error("Application startup timed out after {timeout_ms}ms")]
    AppStartTimeout { timeout_ms: u64 },

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
