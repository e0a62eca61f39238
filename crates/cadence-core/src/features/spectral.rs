//! STFT-based feature extractor
//!
//! Pure Rust, thread-safe and deterministic:
//! - Hann-windowed frames, `frame_size` samples every `hop_size` samples
//! - Beat strength: positive log-magnitude flux below `beat_band_max_hz`
//! - Onset strength: positive log-magnitude flux over the whole spectrum
//! - Chroma: bin power folded onto the nearest equal-tempered pitch class
//!   between `chroma_min_hz` and `chroma_max_hz`

use super::{FeatureExtractor, FeatureSet};
use crate::config::FeatureConfig;
use crate::error::{AnalysisError, Result};
use crate::signal::{AudioSignal, MonoSignal};
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::ops::Range;
use std::sync::Arc;

/// Log compression applied to magnitudes before taking flux
const FLUX_COMPRESSION: f32 = 100.0;

/// Default [`FeatureExtractor`]
pub struct SpectralExtractor {
    config: FeatureConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    /// Pitch class for each FFT bin, `None` outside the chroma band
    bin_pitch_class: Vec<Option<usize>>,
    /// Bins `1..beat_bins` feed the beat-strength curve
    beat_bins: usize,
}

impl SpectralExtractor {
    pub fn new(config: &FeatureConfig) -> Self {
        let mut config = config.clone();
        config.validate();

        let n_fft = config.frame_size;
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);

        let window = (0..n_fft)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / n_fft as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();

        let n_bins = n_fft / 2 + 1;
        let bin_hz = config.sample_rate as f32 / n_fft as f32;
        let bin_pitch_class = (0..n_bins)
            .map(|bin| {
                let hz = bin as f32 * bin_hz;
                if hz < config.chroma_min_hz || hz > config.chroma_max_hz {
                    return None;
                }
                let midi = 69.0 + 12.0 * (hz / 440.0).log2();
                Some((midi.round() as i64).rem_euclid(12) as usize)
            })
            .collect();
        let beat_bins = ((config.beat_band_max_hz / bin_hz).ceil() as usize).clamp(2, n_bins);

        Self {
            config,
            fft,
            window,
            bin_pitch_class,
            beat_bins,
        }
    }

    /// Load one windowed frame, zero padded past the end of the signal
    fn load_frame(&self, samples: &[f32], frame: usize, buf: &mut [f32]) -> f32 {
        let start = frame * self.config.hop_size;
        let mut energy = 0.0f32;
        for (i, slot) in buf.iter_mut().enumerate() {
            let sample = samples.get(start + i).copied().unwrap_or(0.0);
            energy += sample * sample;
            *slot = sample * self.window[i];
        }
        (energy / buf.len() as f32).sqrt()
    }
}

impl FeatureExtractor for SpectralExtractor {
    fn name(&self) -> &'static str {
        "spectral"
    }

    fn prepare(&self, signal: &AudioSignal) -> Result<MonoSignal> {
        signal.prepare(&self.config)
    }

    fn frame_count(&self, signal: &MonoSignal) -> usize {
        let len = signal.samples.len();
        if len <= self.config.frame_size {
            1
        } else {
            (len - self.config.frame_size) / self.config.hop_size + 1
        }
    }

    fn frame_rate(&self, _signal: &MonoSignal) -> f64 {
        self.config.frame_rate()
    }

    fn extract_frames(&self, signal: &MonoSignal, frames: Range<usize>) -> Result<FeatureSet> {
        let end = frames.end.min(self.frame_count(signal));
        let start = frames.start.min(end);
        let count = end - start;

        let mut features = FeatureSet {
            beat_strength: Vec::with_capacity(count),
            onset_strength: Vec::with_capacity(count),
            chroma: Vec::with_capacity(count),
            rms: Vec::with_capacity(count),
            frame_rate: self.config.frame_rate(),
        };
        if count == 0 {
            return Ok(features);
        }

        let mut frame_buf = self.fft.make_input_vec();
        let mut spectrum = self.fft.make_output_vec();
        let mut scratch = self.fft.make_scratch_vec();
        let mut previous: Option<Vec<f32>> = None;

        // Flux at `start` needs the frame before it, so a range never depends on
        // how the signal was chunked.
        for frame in start.saturating_sub(1)..end {
            let rms = self.load_frame(&signal.samples, frame, &mut frame_buf);
            self.fft
                .process_with_scratch(&mut frame_buf, &mut spectrum, &mut scratch)
                .map_err(|e| AnalysisError::Decode(format!("FFT failed: {:?}", e)))?;

            let compressed: Vec<f32> = spectrum
                .iter()
                .map(|c: &Complex<f32>| (1.0 + FLUX_COMPRESSION * c.norm()).ln())
                .collect();

            if frame < start {
                previous = Some(compressed);
                continue;
            }

            let (beat, onset) = match &previous {
                Some(prev) => {
                    let mut beat = 0.0f32;
                    let mut onset = 0.0f32;
                    for (bin, (cur, old)) in compressed.iter().zip(prev.iter()).enumerate().skip(1) {
                        let rise = (cur - old).max(0.0);
                        onset += rise;
                        if bin < self.beat_bins {
                            beat += rise;
                        }
                    }
                    (beat, onset)
                }
                None => (0.0, 0.0),
            };

            let mut chroma = [0.0f32; 12];
            for (c, pitch_class) in spectrum.iter().zip(self.bin_pitch_class.iter()) {
                if let Some(pc) = pitch_class {
                    chroma[*pc] += c.norm_sqr();
                }
            }
            let peak = chroma.iter().fold(0.0f32, |acc, v| acc.max(*v));
            if peak > 0.0 {
                chroma.iter_mut().for_each(|v| *v /= peak);
            }

            features.beat_strength.push(beat);
            features.onset_strength.push(onset);
            features.chroma.push(chroma);
            features.rms.push(rms);
            previous = Some(compressed);
        }

        Ok(features)
    }
}
