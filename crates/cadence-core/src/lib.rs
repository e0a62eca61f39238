//! Cadence Core - tempo and key estimation for decoded audio
//!
//! This crate turns a decoded signal into a tempo, a musical key and an energy
//! rating, each with a confidence:
//!
//! 1. **Analysis**: [`Analyzer`] extracts spectral features in time-boxed
//!    chunks, runs the tempo and key estimators, then applies the optional
//!    [`CalibrationSet`] learned from reference libraries.
//!
//! 2. **Orchestration**: [`Orchestrator`] runs many analyses on a bounded
//!    worker pool. Jobs can run on the worker thread or in their own process
//!    (see [`WorkerIsolation`]).
//!
//! Binaries using process isolation must call `procspawn::init()` at the start
//! of `main`.

pub mod analysis;
pub mod calibration;
pub mod config;
pub mod error;
pub mod features;
pub mod key;
pub mod orchestrator;
pub mod signal;
pub mod tempo;

pub use analysis::{AnalysisResult, AnalyzeOptions, Analyzer};
pub use calibration::{CalibrationSet, CalibrationTrace};
pub use config::{AnalysisConfig, AnalysisMode, WorkerIsolation};
pub use error::{AnalysisError, Result};
pub use key::{Key, KeyEstimate, Mode, PitchClass};
pub use orchestrator::{AnalysisJob, JobHandle, JobId, JobStatus, Orchestrator, PoolCapability};
pub use signal::AudioSignal;
pub use tempo::TempoEstimate;
