//! Process-isolated job execution
//!
//! Each job runs in a fresh worker process spawned with procspawn. A crash or
//! runaway allocation in one analysis then takes down only its own process.
//!
//! Samples travel through a temp file rather than procspawn's IPC channel:
//! a full-length track is tens of megabytes of f32 data, which the IPC
//! serialization handles badly. Only the file path and small arguments
//! cross the process boundary.
//!
//! The binary hosting the orchestrator must call `procspawn::init()` first
//! thing in `main`.

use super::job::AnalysisJob;
use super::runner::{JobContext, JobRunner};
use crate::analysis::{AnalysisResult, AnalyzeOptions, Analyzer};
use crate::calibration::CalibrationSet;
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::signal::AudioSignal;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Extra wall-clock allowance on top of the chunk budgets for process startup
const PROCESS_GRACE: Duration = Duration::from_secs(30);

/// RAII guard for temp file cleanup, deletes the file on drop
struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            // Fine if it was never created
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to clean up temp file {:?}: {}", self.path, e);
            }
        }
    }
}

/// Arguments shipped to the worker process
type WorkerArgs = (String, usize, u32, u16, AnalyzeOptions, AnalysisConfig, CalibrationSet);

/// Runs each job in its own worker process
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    config: Arc<AnalysisConfig>,
    calibration: Arc<CalibrationSet>,
}

impl SubprocessRunner {
    pub fn new(config: Arc<AnalysisConfig>, calibration: Arc<CalibrationSet>) -> Self {
        Self { config, calibration }
    }

    /// Upper bound on how long a worker process may take for a signal
    fn process_budget(&self, signal: &AudioSignal) -> Option<Duration> {
        let orchestrator = &self.config.orchestrator;
        let timeout = orchestrator.chunk_timeout()?;
        let chunks = (signal.duration() / orchestrator.chunk_seconds).ceil().max(1.0);
        Some(timeout.mul_f64(chunks) + PROCESS_GRACE)
    }
}

impl JobRunner for SubprocessRunner {
    fn run(&self, job: &AnalysisJob, _context: &JobContext) -> Result<AnalysisResult> {
        let temp_path = std::env::temp_dir().join(format!(
            "cadence_{}_{}.f32",
            std::process::id(),
            job.id.value()
        ));
        let _temp_guard = TempFileGuard::new(temp_path.clone());

        write_samples(&temp_path, &job.signal.samples)?;

        let args: WorkerArgs = (
            temp_path.to_string_lossy().to_string(),
            job.signal.samples.len(),
            job.signal.sample_rate,
            job.signal.channels,
            job.options.clone(),
            (*self.config).clone(),
            (*self.calibration).clone(),
        );
        log::debug!("run: {} in worker process ({} samples)", job.id, args.1);

        let mut handle = procspawn::spawn(
            args,
            |(path, count, sample_rate, channels, options, config, calibration): WorkerArgs| {
                let samples = read_samples(&PathBuf::from(path), count)?;
                let signal = AudioSignal::new(samples, sample_rate, channels);
                let analyzer = Analyzer::with_spectral(Arc::new(config), Arc::new(calibration));
                analyzer.analyze_with(&signal, &options)
            },
        );

        match self.process_budget(&job.signal) {
            Some(budget) => match handle.join_timeout(budget) {
                Ok(result) => result,
                Err(e) if e.is_timeout() => {
                    log::warn!("run: {} worker process exceeded {:?}, killing it", job.id, budget);
                    let _ = handle.kill();
                    Err(AnalysisError::Worker(format!("{} worker process timed out", job.id)))
                }
                Err(e) => Err(worker_failed(job, e)),
            },
            None => handle.join().unwrap_or_else(|e| Err(worker_failed(job, e))),
        }
    }
}

fn worker_failed(job: &AnalysisJob, error: procspawn::SpawnError) -> AnalysisError {
    AnalysisError::Worker(format!("{} worker process failed: {}", job.id, error))
}

fn write_samples(path: &Path, samples: &[f32]) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for sample in samples {
        file.write_all(&sample.to_le_bytes())?;
    }
    file.flush()?;
    Ok(())
}

fn read_samples(path: &Path, count: usize) -> Result<Vec<f32>> {
    let mut file = std::fs::File::open(path)?;
    let mut bytes = vec![0u8; count * std::mem::size_of::<f32>()];
    file.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
