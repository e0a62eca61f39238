//! Jobs, their handles and their lifecycle
//!
//! Queued → Running → {Completed | TimedOut | Failed}

use crate::analysis::{AnalysisResult, AnalyzeOptions};
use crate::error::{AnalysisError, Result};
use crate::signal::AudioSignal;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique job identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// One signal to analyse
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub id: JobId,
    pub signal: AudioSignal,
    pub options: AnalyzeOptions,
}

impl AnalysisJob {
    pub fn new(signal: AudioSignal) -> Self {
        Self::with_options(signal, AnalyzeOptions::default())
    }

    pub fn with_options(signal: AudioSignal, options: AnalyzeOptions) -> Self {
        Self {
            id: JobId::next(),
            signal,
            options,
        }
    }
}

/// Where a job is in its lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed(Box<AnalysisResult>),
    /// Chunks were abandoned; the result covers the audio analysed in time
    TimedOut(Box<AnalysisResult>),
    Failed(AnalysisError),
}

impl JobStatus {
    pub(crate) fn from_result(result: Result<AnalysisResult>) -> Self {
        match result {
            Ok(result) if result.is_truncated() => JobStatus::TimedOut(Box::new(result)),
            Ok(result) => JobStatus::Completed(Box::new(result)),
            Err(e) => JobStatus::Failed(e),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// The result of a finished job, truncated or not
    pub fn result(&self) -> Option<&AnalysisResult> {
        match self {
            JobStatus::Completed(result) | JobStatus::TimedOut(result) => Some(result),
            _ => None,
        }
    }
}

pub(crate) const PHASE_QUEUED: u8 = 0;
pub(crate) const PHASE_RUNNING: u8 = 1;
pub(crate) const PHASE_FINISHED: u8 = 2;

/// Caller's side of a submitted job
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    phase: Arc<AtomicU8>,
    reply_rx: Receiver<Result<AnalysisResult>>,
    outcome: Option<JobStatus>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, phase: Arc<AtomicU8>, reply_rx: Receiver<Result<AnalysisResult>>) -> Self {
        Self {
            id,
            phase,
            reply_rx,
            outcome: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Current status without blocking
    pub fn status(&mut self) -> JobStatus {
        self.wait(Duration::ZERO)
    }

    /// Wait up to `timeout` for the job to finish
    ///
    /// Returns `Queued` or `Running` when it is still in flight.
    pub fn wait(&mut self, timeout: Duration) -> JobStatus {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let received = if timeout.is_zero() {
            self.reply_rx.try_recv().map_err(|e| {
                if e.is_empty() {
                    RecvTimeoutError::Timeout
                } else {
                    RecvTimeoutError::Disconnected
                }
            })
        } else {
            self.reply_rx.recv_timeout(timeout)
        };

        match received {
            Ok(result) => self.finish(result),
            Err(RecvTimeoutError::Timeout) => match self.phase.load(Ordering::Acquire) {
                PHASE_QUEUED => JobStatus::Queued,
                _ => JobStatus::Running,
            },
            Err(RecvTimeoutError::Disconnected) => self.finish(Err(AnalysisError::Worker(format!(
                "{} was dropped before it finished",
                self.id
            )))),
        }
    }

    /// Block until the job finishes
    pub fn join(mut self) -> JobStatus {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        let result = self.reply_rx.recv().unwrap_or_else(|_| {
            Err(AnalysisError::Worker(format!("{} was dropped before it finished", self.id)))
        });
        JobStatus::from_result(result)
    }

    fn finish(&mut self, result: Result<AnalysisResult>) -> JobStatus {
        let status = JobStatus::from_result(result);
        self.outcome = Some(status.clone());
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    #[test]
    fn test_job_ids_are_unique() {
        let a = AnalysisJob::new(AudioSignal::mono(vec![0.0; 4], 22050));
        let b = AnalysisJob::new(AudioSignal::mono(vec![0.0; 4], 22050));
        assert_ne!(a.id, b.id);
        assert!(a.id.to_string().starts_with("job-"));
    }

    #[test]
    fn test_handle_reports_phase_until_reply() {
        let phase = Arc::new(AtomicU8::new(PHASE_QUEUED));
        let (tx, rx) = channel::bounded(1);
        let mut handle = JobHandle::new(JobId::next(), Arc::clone(&phase), rx);

        assert_eq!(handle.status(), JobStatus::Queued);
        phase.store(PHASE_RUNNING, Ordering::Release);
        assert_eq!(handle.wait(Duration::from_millis(5)), JobStatus::Running);

        tx.send(Err(AnalysisError::Decode("bad".to_string()))).unwrap();
        let failed = JobStatus::Failed(AnalysisError::Decode("bad".to_string()));
        assert_eq!(handle.status(), failed);
        // The outcome sticks after the channel is gone
        drop(tx);
        assert_eq!(handle.wait(Duration::from_millis(5)), failed);
    }

    #[test]
    fn test_dropped_sender_fails_the_job() {
        let (tx, rx) = channel::bounded::<Result<AnalysisResult>>(1);
        let handle = JobHandle::new(JobId::next(), Arc::new(AtomicU8::new(PHASE_RUNNING)), rx);
        drop(tx);
        assert!(matches!(handle.join(), JobStatus::Failed(AnalysisError::Worker(_))));
    }
}
