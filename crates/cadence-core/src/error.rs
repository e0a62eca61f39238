//! Analysis error types
//!
//! Low confidence, chunk truncation and nested pool requests are not errors:
//! they are reported on the [`AnalysisResult`](crate::analysis::AnalysisResult)
//! or absorbed by the orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to the caller of an analysis
///
/// Serializable so a failure inside a worker process reaches the coordinator intact.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum AnalysisError {
    #[error("Unusable audio input: {0}")]
    Decode(String),

    #[error("Empty signal ({duration:.3}s of audio, peak {peak:.2e})")]
    EmptySignal { duration: f64, peak: f32 },

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for AnalysisError {
    fn from(err: std::io::Error) -> Self {
        AnalysisError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
