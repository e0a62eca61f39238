//! What a pool worker does with a job

use super::job::AnalysisJob;
use super::subprocess::SubprocessRunner;
use super::PoolCapability;
use crate::analysis::{AnalysisResult, Analyzer};
use crate::calibration::CalibrationSet;
use crate::config::{AnalysisConfig, WorkerIsolation};
use crate::error::Result;
use std::sync::Arc;

/// Passed to every running job
///
/// Pool workers always hand out [`PoolCapability::InlineOnly`]: anything a job
/// starts runs on the job's own thread.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub capability: PoolCapability,
    pub config: Arc<AnalysisConfig>,
}

/// Executes one job to completion
pub trait JobRunner: Send + Sync {
    fn run(&self, job: &AnalysisJob, context: &JobContext) -> Result<AnalysisResult>;
}

impl<F> JobRunner for F
where
    F: Fn(&AnalysisJob, &JobContext) -> Result<AnalysisResult> + Send + Sync,
{
    fn run(&self, job: &AnalysisJob, context: &JobContext) -> Result<AnalysisResult> {
        self(job, context)
    }
}

/// Analyses on the worker thread itself
#[derive(Debug, Clone)]
pub struct InProcessRunner {
    analyzer: Analyzer,
}

impl InProcessRunner {
    pub fn new(analyzer: Analyzer) -> Self {
        Self { analyzer }
    }
}

impl JobRunner for InProcessRunner {
    fn run(&self, job: &AnalysisJob, _context: &JobContext) -> Result<AnalysisResult> {
        log::debug!("run: {} in process", job.id);
        self.analyzer.analyze_with(&job.signal, &job.options)
    }
}

/// Runner matching the configured worker isolation
pub fn runner_for(config: Arc<AnalysisConfig>, calibration: Arc<CalibrationSet>) -> Arc<dyn JobRunner> {
    match config.orchestrator.isolation {
        WorkerIsolation::Process => Arc::new(SubprocessRunner::new(config, calibration)),
        WorkerIsolation::Thread => Arc::new(InProcessRunner::new(Analyzer::with_spectral(config, calibration))),
    }
}
