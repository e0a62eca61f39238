//! Time-boxed chunked feature extraction
//!
//! A prepared signal is cut into fixed-length chunks on feature frame
//! boundaries. Each chunk is extracted on its own thread and awaited for at
//! most `chunk_timeout`. A chunk that misses the budget is skipped and its
//! thread abandoned; after `max_consecutive_slow_chunks` misses in a row the
//! remaining chunks are dropped and the run is marked truncated, so one
//! pathological input costs at most `max_consecutive_slow_chunks * timeout`
//! of waiting beyond its useful work.
//!
//! Abandoned threads cannot be cancelled and keep running outside the worker
//! pool. They still count against their job: while
//! `max_consecutive_slow_chunks` of them are alive no further chunk is
//! started and the run is truncated, so a job never holds more than that many
//! threads on top of its pool slot. Process isolation reclaims them when the
//! worker process exits.

use crate::config::OrchestratorConfig;
use crate::error::{AnalysisError, Result};
use crate::features::{FeatureExtractor, FeatureSet};
use crate::key::KeyEstimate;
use crate::signal::MonoSignal;
use crossbeam::channel::{self, RecvTimeoutError};
use std::ops::Range;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Frame ranges of consecutive chunks
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChunkPlan {
    pub ranges: Vec<Range<usize>>,
}

impl ChunkPlan {
    pub fn new(total_frames: usize, frame_rate: f64, chunk_seconds: f64) -> Self {
        let chunk_frames = ((chunk_seconds * frame_rate).round() as usize).max(1);
        let ranges = (0..total_frames)
            .step_by(chunk_frames)
            .map(|start| start..(start + chunk_frames).min(total_frames))
            .collect();
        Self { ranges }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }
}

/// Features gathered by a chunked run
#[derive(Debug, Clone)]
pub(crate) struct ChunkRun {
    /// Concatenated features of every chunk that finished in time
    pub features: FeatureSet,
    /// Where each finished chunk sits inside `features`
    pub spans: Vec<Range<usize>>,
    pub total: usize,
    pub truncated: bool,
}

/// Extract a prepared signal chunk by chunk under the configured budget
pub(crate) fn extract_chunked(
    extractor: &Arc<dyn FeatureExtractor>,
    signal: &MonoSignal,
    config: &OrchestratorConfig,
) -> Result<ChunkRun> {
    let frame_rate = extractor.frame_rate(signal);
    let plan = ChunkPlan::new(extractor.frame_count(signal), frame_rate, config.chunk_seconds);
    let timeout = config.chunk_timeout();

    let mut run = ChunkRun {
        features: FeatureSet::empty(frame_rate),
        spans: Vec::with_capacity(plan.len()),
        total: plan.len(),
        truncated: false,
    };
    let mut consecutive_slow = 0u32;
    let mut stragglers: Vec<JoinHandle<()>> = Vec::new();
    let straggler_limit = config.max_consecutive_slow_chunks as usize;

    for (index, range) in plan.ranges.iter().enumerate() {
        stragglers.retain(|handle| !handle.is_finished());
        if stragglers.len() >= straggler_limit {
            log::warn!(
                "extract_chunked: {} abandoned chunks still running, dropping {} remaining chunks",
                stragglers.len(),
                plan.len() - index
            );
            run.truncated = true;
            break;
        }

        let chunk = match timeout {
            None => Some(extractor.extract_frames(signal, range.clone())?),
            Some(budget) => match extract_timed(extractor, signal, range.clone(), index, budget)? {
                Timed::Done(chunk) => Some(chunk),
                Timed::Late(handle) => {
                    stragglers.push(handle);
                    None
                }
            },
        };

        match chunk {
            Some(chunk) => {
                consecutive_slow = 0;
                let start = run.features.len();
                run.features.append(chunk);
                run.spans.push(start..run.features.len());
            }
            None => {
                consecutive_slow += 1;
                log::warn!(
                    "extract_chunked: chunk {}/{} (frames {:?}) exceeded {:.1}s budget ({} in a row)",
                    index + 1,
                    plan.len(),
                    range,
                    config.chunk_timeout_seconds,
                    consecutive_slow
                );
                if consecutive_slow >= config.max_consecutive_slow_chunks {
                    log::warn!(
                        "extract_chunked: abandoning {} remaining chunks, result will be truncated",
                        plan.len() - index - 1
                    );
                    run.truncated = true;
                    break;
                }
            }
        }
    }

    Ok(run)
}

enum Timed {
    Done(FeatureSet),
    /// Missed the budget; the thread is still extracting
    Late(JoinHandle<()>),
}

/// One chunk on a helper thread
fn extract_timed(
    extractor: &Arc<dyn FeatureExtractor>,
    signal: &MonoSignal,
    frames: Range<usize>,
    index: usize,
    budget: Duration,
) -> Result<Timed> {
    let (tx, rx) = channel::bounded(1);
    let worker_extractor = Arc::clone(extractor);
    let worker_signal = signal.clone();
    let started = Instant::now();

    let handle = std::thread::Builder::new()
        .name(format!("analysis-chunk-{}", index))
        .spawn(move || {
            // The receiver is gone when the chunk was abandoned
            let _ = tx.send(worker_extractor.extract_frames(&worker_signal, frames));
        })?;

    match rx.recv_timeout(budget) {
        Ok(result) => {
            log::debug!(
                "extract_timed: chunk {} done in {:.1}ms",
                index,
                started.elapsed().as_secs_f64() * 1000.0
            );
            result.map(Timed::Done)
        }
        Err(RecvTimeoutError::Timeout) => Ok(Timed::Late(handle)),
        Err(RecvTimeoutError::Disconnected) => Err(AnalysisError::Worker(format!(
            "chunk {} worker exited without a result",
            index
        ))),
    }
}

/// Agreement between per-chunk estimates
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ChunkAgreement {
    /// Largest relative deviation of a chunk tempo from the weighted median
    pub bpm_spread: f32,
    /// Confidence-weighted circular spread of chunk key roots (semitones)
    pub key_dispersion: f32,
}

/// Tempo spread and key dispersion across chunk estimates
///
/// Takes `(bpm, confidence)` pairs and chunk keys; `None` for fewer than two
/// usable chunks.
pub(crate) fn agreement(tempos: &[(f64, f32)], keys: &[KeyEstimate]) -> Option<ChunkAgreement> {
    let tempos: Vec<(f64, f32)> = tempos.iter().copied().filter(|&(bpm, _)| bpm > 0.0).collect();
    if tempos.len() < 2 && keys.len() < 2 {
        return None;
    }

    let bpm_spread = weighted_median(&tempos)
        .map(|median| {
            tempos
                .iter()
                .map(|&(bpm, _)| ((bpm - median).abs() / median) as f32)
                .fold(0.0f32, f32::max)
        })
        .unwrap_or(0.0);

    Some(ChunkAgreement {
        bpm_spread,
        key_dispersion: key_dispersion(keys),
    })
}

fn weighted_median(values: &[(f64, f32)]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    // Zero-confidence chunks still count a little
    let weight = |c: f32| c.max(0.01) as f64;
    let half = sorted.iter().map(|&(_, c)| weight(c)).sum::<f64>() / 2.0;
    let mut acc = 0.0;
    for &(bpm, confidence) in &sorted {
        acc += weight(confidence);
        if acc >= half {
            return Some(bpm);
        }
    }
    sorted.last().map(|&(bpm, _)| bpm)
}

/// Circular standard deviation of key roots on the pitch-class circle
fn key_dispersion(keys: &[KeyEstimate]) -> f32 {
    let (mut x, mut y, mut total) = (0.0f64, 0.0f64, 0.0f64);
    for key in keys {
        let weight = key.confidence.max(0.0) as f64;
        let angle = std::f64::consts::TAU * key.root.index() as f64 / 12.0;
        x += weight * angle.cos();
        y += weight * angle.sin();
        total += weight;
    }
    if total <= 0.0 {
        return 0.0;
    }
    let resultant = ((x * x + y * y).sqrt() / total).clamp(0.0, 1.0);
    if resultant <= 1e-9 {
        return 6.0;
    }
    let radians = (-2.0 * resultant.ln()).sqrt();
    (radians * 12.0 / std::f64::consts::TAU).min(6.0) as f32
}
