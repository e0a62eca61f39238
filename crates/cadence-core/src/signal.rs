//! Decoded audio input
//!
//! [`AudioSignal`] is what callers hand to the analyzer: interleaved samples
//! produced by whatever decoder sits in front of the core. [`MonoSignal`] is the
//! validated, downmixed and resampled form the feature extractor consumes.

use crate::config::FeatureConfig;
use crate::error::{AnalysisError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Decoded audio, interleaved when `channels > 1`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSignal {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSignal {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    /// Number of sample frames (samples per channel)
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frame_count() as f64 / self.sample_rate as f64
        }
    }

    /// Check the buffer describes usable audio
    pub fn check(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(AnalysisError::Decode("sample rate is zero".to_string()));
        }
        if self.channels == 0 {
            return Err(AnalysisError::Decode("channel count is zero".to_string()));
        }
        if self.samples.len() % self.channels as usize != 0 {
            return Err(AnalysisError::Decode(format!(
                "{} samples do not divide into {} channels",
                self.samples.len(),
                self.channels
            )));
        }
        if let Some(pos) = self.samples.iter().position(|s| !s.is_finite()) {
            return Err(AnalysisError::Decode(format!(
                "non-finite sample at index {}",
                pos
            )));
        }
        Ok(())
    }

    /// Validate, downmix and resample for feature extraction
    ///
    /// Fails with `Decode` for malformed buffers and `EmptySignal` for signals
    /// that are too short or silent to analyse.
    pub fn prepare(&self, config: &FeatureConfig) -> Result<MonoSignal> {
        self.check()?;

        let duration = self.duration();
        let peak = self.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        if duration < config.min_signal_seconds.max(f64::EPSILON) || peak <= config.silence_peak {
            return Err(AnalysisError::EmptySignal { duration, peak });
        }

        let mono = downmix(&self.samples, self.channels as usize);
        let samples = if self.sample_rate == config.sample_rate {
            mono
        } else {
            resample_linear(&mono, self.sample_rate as f64, config.sample_rate as f64)
        };

        Ok(MonoSignal {
            samples: samples.into(),
            sample_rate: config.sample_rate,
            duration,
        })
    }
}

/// Mono samples at the analysis rate
///
/// Cheap to clone; chunk workers share the same buffer.
#[derive(Debug, Clone)]
pub struct MonoSignal {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    /// Duration of the original signal in seconds
    pub duration: f64,
}

fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return samples.to_vec();
    }
    let scale = 1.0 / channels as f32;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

/// Simple linear interpolation resampling
fn resample_linear(samples: &[f32], from_sr: f64, to_sr: f64) -> Vec<f32> {
    let ratio = from_sr / to_sr;
    let output_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else if idx < samples.len() {
            samples[idx]
        } else {
            0.0
        };
        output.push(sample);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(seconds: f64, sample_rate: u32) -> Vec<f32> {
        (0..(seconds * sample_rate as f64) as usize)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_duration_counts_frames_not_samples() {
        let signal = AudioSignal::new(vec![0.0; 44100 * 2], 44100, 2);
        assert_eq!(signal.frame_count(), 44100);
        assert!((signal.duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_buffers_are_decode_errors() {
        let config = FeatureConfig::default();

        let zero_rate = AudioSignal::new(vec![0.1; 100], 0, 1);
        assert!(matches!(zero_rate.prepare(&config), Err(AnalysisError::Decode(_))));

        let misaligned = AudioSignal::new(vec![0.1; 101], 22050, 2);
        assert!(matches!(misaligned.prepare(&config), Err(AnalysisError::Decode(_))));

        let mut samples = tone(1.0, 22050);
        samples[10] = f32::NAN;
        let nan = AudioSignal::mono(samples, 22050);
        assert!(matches!(nan.prepare(&config), Err(AnalysisError::Decode(_))));
    }

    #[test]
    fn test_empty_and_silent_signals() {
        let config = FeatureConfig::default();

        let empty = AudioSignal::mono(Vec::new(), 22050);
        assert!(matches!(empty.prepare(&config), Err(AnalysisError::EmptySignal { .. })));

        let silent = AudioSignal::mono(vec![0.0; 22050 * 5], 22050);
        assert!(matches!(silent.prepare(&config), Err(AnalysisError::EmptySignal { .. })));
    }

    #[test]
    fn test_prepare_downmixes_and_resamples() {
        let config = FeatureConfig::default();
        let left = tone(2.0, 44100);
        let interleaved: Vec<f32> = left.iter().flat_map(|&s| [s, s]).collect();
        let signal = AudioSignal::new(interleaved, 44100, 2);

        let mono = signal.prepare(&config).unwrap();
        assert_eq!(mono.sample_rate, 22050);
        assert_eq!(mono.samples.len(), 44100);
        assert!((mono.duration - 2.0).abs() < 1e-9);
    }
}
