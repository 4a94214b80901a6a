//! Error taxonomy shared by every layer of the orchestration.
//!
//! Orchestration errors (installation, configuration, parameters) always
//! reach the caller. `BackendExecution` is the only variant subject to the
//! `raise_error` toggle of a sorter run. `ResultParsing` always propagates.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SortError {
    #[error("sorter '{backend}' is not installed.\n{instructions}")]
    Installation {
        backend: String,
        instructions: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown parameters for '{backend}': {}", unknown.join(", "))]
    Parameter {
        backend: String,
        unknown: Vec<String>,
    },
    #[error("{backend} failed: {message}")]
    BackendExecution { backend: String, message: String },
    #[error("could not parse {backend} output in {}: {message}", folder.display())]
    ResultParsing {
        backend: String,
        folder: PathBuf,
        message: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SortError>;

impl SortError {
    pub fn execution(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendExecution {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn parsing(
        backend: impl Into<String>,
        folder: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::ResultParsing {
            backend: backend.into(),
            folder: folder.into(),
            message: message.into(),
        }
    }

    /// Whether `raise_error=false` is allowed to swallow this error.
    pub fn is_execution_failure(&self) -> bool {
        matches!(self, Self::BackendExecution { .. })
    }
}
