use std::path::PathBuf;

use thiserror::Error;

use faultline_core::InitError;

use crate::structured_log::LogValidationError;

/// Errors surfaced by the harness binary and runner.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Init(#[from] InitError),
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("unknown disposition '{0}', expected restore|armed")]
    UnknownDisposition(String),
    #[error("{failed} of {total} scenarios failed")]
    Failed { failed: usize, total: usize },
    #[error("{} invalid line(s) in {}", .errors.len(), .path.display())]
    InvalidLog {
        path: PathBuf,
        errors: Vec<LogValidationError>,
    },
}
