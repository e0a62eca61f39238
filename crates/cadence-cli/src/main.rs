//! Cadence Analyze - batch tempo and key analysis of WAV files
//!
//! Usage: cadence-analyze [--config PATH] [--genre NAME] [--threads] FILE.wav...
//! (see `--help`)
//!
//! Prints one JSON object per input file on stdout.

use anyhow::{bail, Context, Result};
use clap::Parser;
use cadence_core::config::{default_config_path, load_config};
use cadence_core::orchestrator::runner_for;
use cadence_core::{
    AnalysisJob, AnalysisResult, AnalyzeOptions, AudioSignal, CalibrationSet, JobStatus, Orchestrator,
    PoolCapability, WorkerIsolation,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Batch tempo and key analysis of WAV files
#[derive(Parser, Debug)]
#[command(name = "cadence-analyze")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Genre hint applied to every file for calibration
    #[arg(short, long)]
    genre: Option<String>,

    /// Run jobs on pool threads instead of worker processes
    #[arg(long)]
    threads: bool,

    /// WAV files to analyse
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

/// Decode an uncompressed WAV file to interleaved f32 samples
fn read_wav(path: &Path) -> Result<AudioSignal> {
    let mut reader = hound::WavReader::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("Failed to decode {:?}", path))?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << spec.bits_per_sample.saturating_sub(1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .with_context(|| format!("Failed to decode {:?}", path))?
        }
    };
    Ok(AudioSignal::new(samples, spec.sample_rate, spec.channels))
}

#[derive(Serialize)]
struct FileReport<'a> {
    file: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn print_report(report: &FileReport<'_>) -> Result<()> {
    println!("{}", serde_json::to_string(report).context("Failed to serialize result")?);
    Ok(())
}

fn main() -> Result<()> {
    // Worker processes re-enter here and never return from init
    procspawn::init();

    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path);
    if args.threads {
        config.orchestrator.isolation = WorkerIsolation::Thread;
    }
    let config = Arc::new(config);
    let calibration = Arc::new(CalibrationSet::load_or_empty(config.calibration.rules_path.as_deref()));

    let mut jobs = Vec::new();
    let mut queued_files = Vec::new();
    let mut failures = 0usize;
    for file in &args.files {
        match read_wav(file) {
            Ok(signal) => {
                let options = AnalyzeOptions {
                    duration_hint: None,
                    genre: args.genre.clone(),
                };
                jobs.push(AnalysisJob::with_options(signal, options));
                queued_files.push(file);
            }
            Err(e) => {
                log::warn!("main: skipping {:?}: {:#}", file, e);
                failures += 1;
                print_report(&FileReport {
                    file: file.display().to_string(),
                    status: "failed",
                    result: None,
                    error: Some(format!("{:#}", e)),
                })?;
            }
        }
    }

    log::info!("main: analysing {} files", jobs.len());
    let runner = runner_for(Arc::clone(&config), calibration);
    let orchestrator = Orchestrator::start(config, runner, PoolCapability::MayCreatePool)
        .context("Failed to start the analysis pool")?;

    for (file, (id, status)) in queued_files.into_iter().zip(orchestrator.run_batch(jobs)) {
        log::debug!("main: {} finished for {:?}", id, file);
        let (label, error) = match &status {
            JobStatus::Completed(_) => ("completed", None),
            JobStatus::TimedOut(_) => ("timed_out", None),
            JobStatus::Failed(e) => {
                failures += 1;
                ("failed", Some(e.to_string()))
            }
            JobStatus::Queued | JobStatus::Running => ("unfinished", None),
        };
        print_report(&FileReport {
            file: file.display().to_string(),
            status: label,
            result: status.result(),
            error,
        })?;
    }

    if failures > 0 {
        bail!("{} of {} files could not be analysed", failures, args.files.len());
    }
    Ok(())
}
