//! One complete analysis: features, estimators, calibration
//!
//! [`Analyzer`] owns everything an analysis reads: the immutable config, the
//! calibration set and a feature extractor. `analyze` has no hidden state, so
//! the same signal under the same config always yields the same result.
//!
//! ```text
//! AudioSignal ─► prepare ─► chunked extraction ─► FeatureSet
//!                                                   │
//!                        ┌──────────────────────────┼───────────────┐
//!                        ▼                          ▼               ▼
//!                  TempoEstimator             KeyEstimator     energy
//!                        └──────────► chunk agreement ◄───────┘
//!                                           │
//!                                           ▼
//!                                  CalibrationSet::apply ─► AnalysisResult
//! ```

mod chunks;
mod energy;

pub use energy::EnergyProfile;

use crate::calibration::{CalibrationContext, CalibrationSet, CalibrationTrace, Estimates};
use crate::config::{AnalysisConfig, AnalysisMode};
use crate::error::Result;
use crate::features::{FeatureExtractor, FeatureSet, SpectralExtractor};
use crate::key::{KeyEstimate, KeyEstimator};
use crate::signal::AudioSignal;
use crate::tempo::{TempoEstimate, TempoEstimator, TempoInput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Hint and measured duration may disagree by this much before a warning (seconds)
const DURATION_HINT_TOLERANCE: f64 = 1.0;

/// How the chunked extraction went
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkReport {
    /// Chunks whose features made it into the result
    pub evaluated: usize,
    pub total: usize,
    /// Remaining chunks were abandoned after repeated timeouts
    pub truncated: bool,
    /// Largest relative deviation of a chunk tempo from the median (full songs)
    pub bpm_spread: Option<f32>,
    /// Spread of chunk key roots in semitones (full songs)
    pub key_dispersion: Option<f32>,
}

/// Final result of one analysis
///
/// Contains no timing data: repeated analyses of one signal compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Tempo in BPM, 0 when no periodicity was found
    pub bpm: f64,
    pub bpm_confidence: f32,
    pub bpm_low_confidence: bool,
    pub key: KeyEstimate,
    /// Chunk keys wander too far for one key to describe the track
    pub key_modulating: bool,
    /// Perceived energy 0..1
    pub energy: f32,
    /// Measured duration of the analysed signal (seconds)
    pub signal_duration: f64,
    pub mode: AnalysisMode,
    pub calibration: CalibrationTrace,
    pub chunks: ChunkReport,
}

impl AnalysisResult {
    pub fn key_confidence(&self) -> f32 {
        self.key.confidence
    }

    pub fn is_truncated(&self) -> bool {
        self.chunks.truncated
    }
}

/// Caller-supplied facts about a signal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeOptions {
    /// Duration reported by the decoder; only checked against the samples
    pub duration_hint: Option<f64>,
    /// Genre tag consulted by genre-restricted calibration rules
    pub genre: Option<String>,
}

/// Runs complete analyses; cheap to share between threads
#[derive(Clone)]
pub struct Analyzer {
    config: Arc<AnalysisConfig>,
    calibration: Arc<CalibrationSet>,
    extractor: Arc<dyn FeatureExtractor>,
    tempo: TempoEstimator,
    key: KeyEstimator,
}

impl std::fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyzer")
            .field("extractor", &self.extractor.name())
            .field("calibrated", &!self.calibration.is_empty())
            .finish()
    }
}

impl Analyzer {
    pub fn new(
        config: Arc<AnalysisConfig>,
        calibration: Arc<CalibrationSet>,
        extractor: Arc<dyn FeatureExtractor>,
    ) -> Self {
        let tempo = TempoEstimator::new(&config.tempo);
        let key = KeyEstimator::new(&config.key);
        Self {
            config,
            calibration,
            extractor,
            tempo,
            key,
        }
    }

    /// Analyzer with the built-in spectral extractor
    pub fn with_spectral(config: Arc<AnalysisConfig>, calibration: Arc<CalibrationSet>) -> Self {
        let extractor = Arc::new(SpectralExtractor::new(&config.features));
        Self::new(config, calibration, extractor)
    }

    /// Analyze a decoded signal
    ///
    /// Fails with `Decode` or `EmptySignal` for unusable input. Low confidence
    /// and chunk truncation are reported on the result.
    pub fn analyze(&self, signal: &AudioSignal, duration_hint: Option<f64>) -> Result<AnalysisResult> {
        self.analyze_with(
            signal,
            &AnalyzeOptions {
                duration_hint,
                genre: None,
            },
        )
    }

    /// Analyze with a genre tag for calibration
    pub fn analyze_with(&self, signal: &AudioSignal, options: &AnalyzeOptions) -> Result<AnalysisResult> {
        let mono = self.extractor.prepare(signal)?;
        let duration = mono.duration;
        if let Some(hint) = options.duration_hint {
            if (hint - duration).abs() > DURATION_HINT_TOLERANCE {
                log::warn!(
                    "analyze: duration hint {:.1}s disagrees with {:.1}s of samples, using the samples",
                    hint,
                    duration
                );
            }
        }

        let mode = self.config.mode_for(duration);
        log::debug!(
            "analyze: {:.1}s signal as {} with {} extractor",
            duration,
            mode,
            self.extractor.name()
        );

        let run = chunks::extract_chunked(&self.extractor, &mono, &self.config.orchestrator)?;
        let features = &run.features;
        let energy = energy::measure(features);

        let tempo = self.estimate_tempo(features, energy.loudness, mode);
        let mut key = self.key.estimate(&features.chroma, features.frame_rate, mode);

        let mut report = ChunkReport {
            evaluated: run.spans.len(),
            total: run.total,
            truncated: run.truncated,
            bpm_spread: None,
            key_dispersion: None,
        };
        let mut key_modulating = false;
        if mode == AnalysisMode::FullSong && run.spans.len() >= 2 {
            if let Some(agreement) = self.chunk_agreement(&run) {
                report.bpm_spread = Some(agreement.bpm_spread);
                report.key_dispersion = Some(agreement.key_dispersion);
                if agreement.key_dispersion > self.config.key.modulation_dispersion_semitones {
                    key_modulating = true;
                    key.confidence = key.confidence.min(self.config.key.modulation_confidence_cap);
                    log::info!(
                        "analyze: chunk keys spread {:.1} semitones, reporting {} as modulating",
                        agreement.key_dispersion,
                        key.key()
                    );
                }
            }
        }

        let raw = Estimates {
            bpm: tempo.bpm,
            bpm_confidence: tempo.confidence,
            key: key.key(),
            key_confidence: key.confidence,
            energy: energy.energy,
        };
        let context = CalibrationContext {
            duration,
            genre: options.genre.as_deref(),
            key_confidence_cap: key_modulating.then_some(self.config.key.modulation_confidence_cap),
        };
        let (calibrated, trace) = self.calibration.apply(&raw, &context, &self.config);

        let key_confidence = calibrated.key_confidence;
        let result = AnalysisResult {
            bpm: calibrated.bpm,
            bpm_confidence: calibrated.bpm_confidence,
            bpm_low_confidence: tempo.low_confidence,
            key: KeyEstimate::new(
                calibrated.key,
                key_confidence,
                key_confidence < self.config.key.confidence_threshold(mode),
            ),
            key_modulating,
            energy: calibrated.energy,
            signal_duration: duration,
            mode,
            calibration: trace,
            chunks: report,
        };

        if result.is_truncated() {
            log::warn!(
                "analyze: truncated after {}/{} chunks, {:.1} BPM / {} from partial audio",
                result.chunks.evaluated,
                result.chunks.total,
                result.bpm,
                result.key.key()
            );
        } else {
            log::info!(
                "analyze: {:.1} BPM ({:.2}), {} ({:.2}), energy {:.2}",
                result.bpm,
                result.bpm_confidence,
                result.key.key(),
                result.key.confidence,
                result.energy
            );
        }
        Ok(result)
    }

    fn estimate_tempo(&self, features: &FeatureSet, loudness: f32, mode: AnalysisMode) -> TempoEstimate {
        self.tempo.estimate(
            &TempoInput {
                beat_strength: &features.beat_strength,
                onset_strength: &features.onset_strength,
                frame_rate: features.frame_rate,
                duration: features.duration(),
                energy: loudness,
            },
            mode,
        )
    }

    /// Re-run both estimators on every chunk and measure how well they agree
    fn chunk_agreement(&self, run: &chunks::ChunkRun) -> Option<chunks::ChunkAgreement> {
        let mut tempos = Vec::with_capacity(run.spans.len());
        let mut keys = Vec::with_capacity(run.spans.len());
        for span in &run.spans {
            let chunk = run.features.slice(span.clone());
            let loudness = energy::measure(&chunk).loudness;
            let tempo = self.estimate_tempo(&chunk, loudness, AnalysisMode::ShortClip);
            tempos.push((tempo.bpm, tempo.confidence));
            keys.push(self.key.estimate(&chunk.chroma, chunk.frame_rate, AnalysisMode::ShortClip));
        }
        chunks::agreement(&tempos, &keys)
    }
}
