//! Execution orchestrator
//!
//! Runs many analyses concurrently on a fixed-size worker pool.
//!
//! ```text
//! submit ──► bounded queue ──► scheduler thread ──► slot? ──► rayon pool
//!   ▲                                                            │
//!   └──────────── JobHandle ◄──── reply channel ◄────────────────┘
//! ```
//!
//! # Nested pools
//!
//! Only the top-level coordinator may create a pool. Creation takes a
//! [`PoolCapability`], and workers always pass [`PoolCapability::InlineOnly`]
//! to the jobs they run. A job that tries to start its own orchestrator gets
//! one that executes submissions synchronously on the job's own thread, so a
//! saturated pool can never wait on itself.

mod job;
mod runner;
mod subprocess;

pub use job::{AnalysisJob, JobHandle, JobId, JobStatus};
pub use runner::{runner_for, InProcessRunner, JobContext, JobRunner};
pub use subprocess::SubprocessRunner;

use crate::analysis::AnalysisResult;
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crossbeam::channel::{self, Receiver, Sender};
use job::{PHASE_FINISHED, PHASE_QUEUED, PHASE_RUNNING};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Whether the holder may create a worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCapability {
    /// Top-level coordinator
    MayCreatePool,
    /// Inside a worker: run everything on the current thread
    InlineOnly,
}

enum SchedulerCommand {
    Run(QueuedJob),
    Shutdown,
}

struct QueuedJob {
    job: AnalysisJob,
    phase: Arc<AtomicU8>,
    reply_tx: Sender<Result<AnalysisResult>>,
}

enum Execution {
    Pool {
        queue_tx: Sender<SchedulerCommand>,
        scheduler: Option<JoinHandle<()>>,
    },
    Inline {
        runner: Arc<dyn JobRunner>,
        context: JobContext,
    },
}

/// Schedules analysis jobs over a bounded worker pool
pub struct Orchestrator {
    execution: Execution,
}

impl Orchestrator {
    /// Start an orchestrator
    ///
    /// With [`PoolCapability::MayCreatePool`] this builds the worker pool and
    /// the scheduler thread. With [`PoolCapability::InlineOnly`] no threads are
    /// created and every job runs inside `submit`.
    pub fn start(
        config: Arc<AnalysisConfig>,
        runner: Arc<dyn JobRunner>,
        capability: PoolCapability,
    ) -> Result<Self> {
        let worker_context = JobContext {
            capability: PoolCapability::InlineOnly,
            config: Arc::clone(&config),
        };

        if capability == PoolCapability::InlineOnly {
            log::warn!("start: pool requested from inside a worker, jobs will run inline on the caller's thread");
            return Ok(Self {
                execution: Execution::Inline {
                    runner,
                    context: worker_context,
                },
            });
        }

        let pool_size = config.orchestrator.pool_size.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|i| format!("analysis-worker-{}", i))
            .build()
            .map_err(|e| AnalysisError::Worker(format!("Failed to create worker pool: {}", e)))?;

        let (queue_tx, queue_rx) = channel::bounded(config.orchestrator.queue_capacity.max(1));
        let scheduler = thread::Builder::new()
            .name("analysis-scheduler".to_string())
            .spawn(move || Self::run(pool, pool_size, runner, worker_context, queue_rx))?;

        log::info!(
            "start: {} workers, queue capacity {}",
            pool_size,
            config.orchestrator.queue_capacity
        );
        Ok(Self {
            execution: Execution::Pool {
                queue_tx,
                scheduler: Some(scheduler),
            },
        })
    }

    /// Whether jobs run on a pool (false for inline orchestrators)
    pub fn has_pool(&self) -> bool {
        matches!(self.execution, Execution::Pool { .. })
    }

    /// Queue a job, blocking while the queue is full
    ///
    /// Inline orchestrators run the job before returning.
    pub fn submit(&self, job: AnalysisJob) -> JobHandle {
        let id = job.id;
        let (reply_tx, reply_rx) = channel::bounded(1);
        let phase = Arc::new(AtomicU8::new(PHASE_QUEUED));
        let handle = JobHandle::new(id, Arc::clone(&phase), reply_rx);

        match &self.execution {
            Execution::Inline { runner, context } => {
                phase.store(PHASE_RUNNING, Ordering::Release);
                let result = run_guarded(runner.as_ref(), &job, context);
                phase.store(PHASE_FINISHED, Ordering::Release);
                let _ = reply_tx.send(result);
            }
            Execution::Pool { queue_tx, .. } => {
                let queued = QueuedJob { job, phase, reply_tx };
                if queue_tx.send(SchedulerCommand::Run(queued)).is_err() {
                    // The dropped reply sender fails the handle
                    log::error!("submit: scheduler is gone, {} cannot run", id);
                }
            }
        }
        handle
    }

    /// Submit every job and wait for all of them
    ///
    /// Results come back in submission order, each tagged with its job id.
    pub fn run_batch(&self, jobs: Vec<AnalysisJob>) -> Vec<(JobId, JobStatus)> {
        let total = jobs.len();
        let handles: Vec<JobHandle> = jobs.into_iter().map(|job| self.submit(job)).collect();
        let results: Vec<(JobId, JobStatus)> = handles
            .into_iter()
            .map(|handle| (handle.id(), handle.join()))
            .collect();

        let failed = results
            .iter()
            .filter(|(_, status)| matches!(status, JobStatus::Failed(_)))
            .count();
        let timed_out = results
            .iter()
            .filter(|(_, status)| matches!(status, JobStatus::TimedOut(_)))
            .count();
        log::info!(
            "run_batch: {} jobs, {} failed, {} truncated",
            total,
            failed,
            timed_out
        );
        results
    }

    /// Scheduler loop: one job per free slot, in queue order
    fn run(
        pool: rayon::ThreadPool,
        pool_size: usize,
        runner: Arc<dyn JobRunner>,
        context: JobContext,
        queue_rx: Receiver<SchedulerCommand>,
    ) {
        let (slot_tx, slot_rx) = channel::bounded(pool_size);
        for _ in 0..pool_size {
            let _ = slot_tx.send(());
        }

        while let Ok(command) = queue_rx.recv() {
            let queued = match command {
                SchedulerCommand::Run(queued) => queued,
                SchedulerCommand::Shutdown => break,
            };
            if slot_rx.recv().is_err() {
                break;
            }

            let runner = Arc::clone(&runner);
            let context = context.clone();
            let slot_tx = slot_tx.clone();
            pool.spawn(move || {
                queued.phase.store(PHASE_RUNNING, Ordering::Release);
                log::debug!("run: {} started", queued.job.id);
                let result = run_guarded(runner.as_ref(), &queued.job, &context);
                queued.phase.store(PHASE_FINISHED, Ordering::Release);
                let _ = queued.reply_tx.send(result);
                let _ = slot_tx.send(());
            });
        }

        // Let in-flight jobs finish before the pool goes away
        for _ in 0..pool_size {
            let _ = slot_rx.recv();
        }
        log::debug!("run: scheduler stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Execution::Pool { queue_tx, scheduler } = &mut self.execution {
            let _ = queue_tx.send(SchedulerCommand::Shutdown);
            if let Some(handle) = scheduler.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Run a job, turning a panic into a worker failure
fn run_guarded(runner: &dyn JobRunner, job: &AnalysisJob, context: &JobContext) -> Result<AnalysisResult> {
    panic::catch_unwind(AssertUnwindSafe(|| runner.run(job, context))).unwrap_or_else(|_| {
        log::error!("run_guarded: {} panicked", job.id);
        Err(AnalysisError::Worker(format!("{} panicked", job.id)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Analyzer, ChunkReport};
    use crate::calibration::{CalibrationSet, CalibrationTrace};
    use crate::config::AnalysisMode;
    use crate::key::KeyEstimate;
    use crate::signal::AudioSignal;
    use std::time::{Duration, Instant};

    fn fake_result(bpm: f64) -> AnalysisResult {
        AnalysisResult {
            bpm,
            bpm_confidence: 0.9,
            bpm_low_confidence: false,
            key: KeyEstimate::undetermined(),
            key_modulating: false,
            energy: 0.5,
            signal_duration: 1.0,
            mode: AnalysisMode::ShortClip,
            calibration: CalibrationTrace::default(),
            chunks: ChunkReport::default(),
        }
    }

    fn job(len: usize) -> AnalysisJob {
        AnalysisJob::new(AudioSignal::mono(vec![0.1; len], 22050))
    }

    fn config(pool_size: usize) -> Arc<AnalysisConfig> {
        let mut config = AnalysisConfig::default();
        config.orchestrator.pool_size = pool_size;
        config.orchestrator.queue_capacity = 2;
        Arc::new(config)
    }

    /// Reports the sample count as BPM so results can be matched to jobs
    fn counting_runner() -> Arc<dyn JobRunner> {
        Arc::new(|job: &AnalysisJob, _: &JobContext| -> Result<AnalysisResult> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(fake_result(job.signal.samples.len() as f64))
        })
    }

    #[test]
    fn test_batch_results_match_jobs() {
        let orchestrator = Orchestrator::start(config(3), counting_runner(), PoolCapability::MayCreatePool).unwrap();
        assert!(orchestrator.has_pool());

        let jobs: Vec<AnalysisJob> = (1..=10).map(job).collect();
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        let results = orchestrator.run_batch(jobs);

        assert_eq!(results.len(), 10);
        for (i, (id, status)) in results.iter().enumerate() {
            assert_eq!(*id, ids[i]);
            assert_eq!(status.result().map(|r| r.bpm), Some((i + 1) as f64));
        }
    }

    #[test]
    fn test_nested_orchestrator_runs_inline() {
        let outer_runner: Arc<dyn JobRunner> = Arc::new(|job: &AnalysisJob, ctx: &JobContext| -> Result<AnalysisResult> {
            assert_eq!(ctx.capability, PoolCapability::InlineOnly);
            let nested = Orchestrator::start(Arc::clone(&ctx.config), counting_runner(), ctx.capability)?;
            assert!(!nested.has_pool());
            let mut handle = nested.submit(AnalysisJob::new(job.signal.clone()));
            match handle.wait(Duration::from_secs(1)) {
                JobStatus::Completed(result) => Ok(*result),
                other => Err(AnalysisError::Worker(format!("nested job ended as {:?}", other))),
            }
        });
        // A single worker: a nested pool would have nowhere to run
        let orchestrator = Orchestrator::start(config(1), outer_runner, PoolCapability::MayCreatePool).unwrap();

        let started = Instant::now();
        let mut handle = orchestrator.submit(job(7));
        let status = handle.wait(Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(status.result().map(|r| r.bpm), Some(7.0));
    }

    #[test]
    fn test_inline_orchestrator_finishes_inside_submit() {
        let orchestrator = Orchestrator::start(config(2), counting_runner(), PoolCapability::InlineOnly).unwrap();
        let mut handle = orchestrator.submit(job(3));
        assert!(matches!(handle.status(), JobStatus::Completed(_)));
    }

    #[test]
    fn test_status_moves_through_lifecycle() {
        let (release_tx, release_rx) = channel::unbounded::<()>();
        let gated: Arc<dyn JobRunner> = Arc::new(move |job: &AnalysisJob, _: &JobContext| -> Result<AnalysisResult> {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok(fake_result(job.signal.samples.len() as f64))
        });
        let orchestrator = Orchestrator::start(config(1), gated, PoolCapability::MayCreatePool).unwrap();

        let mut first = orchestrator.submit(job(1));
        let mut second = orchestrator.submit(job(2));
        // Give the scheduler time to start the first job
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(first.status(), JobStatus::Running);
        assert_eq!(second.status(), JobStatus::Queued);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        assert!(matches!(first.wait(Duration::from_secs(2)), JobStatus::Completed(_)));
        assert!(matches!(second.wait(Duration::from_secs(2)), JobStatus::Completed(_)));
    }

    #[test]
    fn test_failures_and_truncation_are_terminal() {
        let runner: Arc<dyn JobRunner> = Arc::new(|job: &AnalysisJob, _: &JobContext| -> Result<AnalysisResult> {
            match job.signal.samples.len() {
                1 => Err(AnalysisError::Decode("bad header".to_string())),
                2 => panic!("extractor bug"),
                _ => {
                    let mut result = fake_result(120.0);
                    result.chunks.truncated = true;
                    Ok(result)
                }
            }
        });
        let orchestrator = Orchestrator::start(config(2), runner, PoolCapability::MayCreatePool).unwrap();
        let results = orchestrator.run_batch(vec![job(1), job(2), job(3)]);

        assert_eq!(results[0].1, JobStatus::Failed(AnalysisError::Decode("bad header".to_string())));
        assert!(matches!(results[1].1, JobStatus::Failed(AnalysisError::Worker(_))));
        assert!(matches!(&results[2].1, JobStatus::TimedOut(r) if r.bpm == 120.0));
        assert!(results.iter().all(|(_, status)| status.is_terminal()));
    }

    #[test]
    fn test_in_process_runner_analyzes_jobs() {
        let config = config(2);
        let analyzer = Analyzer::with_spectral(Arc::clone(&config), Arc::new(CalibrationSet::default()));
        let runner = Arc::new(InProcessRunner::new(analyzer));
        let orchestrator = Orchestrator::start(config, runner, PoolCapability::MayCreatePool).unwrap();

        let silent = orchestrator.submit(AnalysisJob::new(AudioSignal::mono(vec![0.0; 22050], 22050)));
        assert!(matches!(silent.join(), JobStatus::Failed(AnalysisError::EmptySignal { .. })));

        let tone: Vec<f32> = (0..22050 * 3)
            .map(|i| (std::f32::consts::TAU * 440.0 * i as f32 / 22050.0).sin() * 0.5)
            .collect();
        let status = orchestrator.submit(AnalysisJob::new(AudioSignal::mono(tone, 22050))).join();
        let result = status.result().unwrap();
        assert_eq!(result.mode, AnalysisMode::ShortClip);
        assert!((result.signal_duration - 3.0).abs() < 1e-9);
    }
}
