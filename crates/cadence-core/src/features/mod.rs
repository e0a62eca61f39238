//! Feature adapter
//!
//! The estimators never look at samples. They consume a [`FeatureSet`]: frame
//! aligned beat-strength and onset-strength curves, a 12-bin chroma sequence and
//! per-frame RMS. A [`FeatureExtractor`] produces it from decoded audio.
//!
//! Extraction is frame-addressable: features for `0..n` equal the concatenation
//! of features for `0..k` and `k..n`. The analyzer relies on this to run long
//! signals as a sequence of time-boxed chunks.

mod spectral;

pub use spectral::SpectralExtractor;

use crate::error::Result;
use crate::signal::{AudioSignal, MonoSignal};
use std::ops::Range;

/// Low-level features for one signal (or one contiguous frame range of it)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureSet {
    /// Low band spectral flux (kick and bass attacks)
    pub beat_strength: Vec<f32>,
    /// Full band spectral flux
    pub onset_strength: Vec<f32>,
    /// Per-frame pitch class energy, C = 0, normalised to a max of 1
    pub chroma: Vec<[f32; 12]>,
    /// Per-frame RMS of the unwindowed frame
    pub rms: Vec<f32>,
    /// Feature frames per second
    pub frame_rate: f64,
}

impl FeatureSet {
    pub fn empty(frame_rate: f64) -> Self {
        Self {
            frame_rate,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.onset_strength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.onset_strength.is_empty()
    }

    /// Seconds of audio covered
    pub fn duration(&self) -> f64 {
        if self.frame_rate > 0.0 {
            self.len() as f64 / self.frame_rate
        } else {
            0.0
        }
    }

    /// Append the features of the following frame range
    pub fn append(&mut self, next: FeatureSet) {
        self.beat_strength.extend(next.beat_strength);
        self.onset_strength.extend(next.onset_strength);
        self.chroma.extend(next.chroma);
        self.rms.extend(next.rms);
    }

    /// Copy out a frame range, clamped to the available frames
    pub fn slice(&self, frames: Range<usize>) -> FeatureSet {
        let end = frames.end.min(self.len());
        let start = frames.start.min(end);
        FeatureSet {
            beat_strength: self.beat_strength[start..end].to_vec(),
            onset_strength: self.onset_strength[start..end].to_vec(),
            chroma: self.chroma[start..end].to_vec(),
            rms: self.rms[start..end].to_vec(),
            frame_rate: self.frame_rate,
        }
    }
}

/// Produces features from decoded audio
///
/// Implementations must be deterministic: the same input always yields
/// bit-identical features.
pub trait FeatureExtractor: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Validate, downmix and resample a decoded signal
    fn prepare(&self, signal: &AudioSignal) -> Result<MonoSignal>;

    /// Number of feature frames a prepared signal yields
    fn frame_count(&self, signal: &MonoSignal) -> usize;

    /// Feature frames per second for a prepared signal
    fn frame_rate(&self, signal: &MonoSignal) -> f64;

    /// Features for a frame range of a prepared signal
    fn extract_frames(&self, signal: &MonoSignal, frames: Range<usize>) -> Result<FeatureSet>;

    /// Features for a whole decoded signal
    ///
    /// Fails with `Decode` for malformed audio and `EmptySignal` for zero-length
    /// or silent input.
    fn extract_features(&self, signal: &AudioSignal) -> Result<FeatureSet> {
        let mono = self.prepare(signal)?;
        let frames = self.frame_count(&mono);
        self.extract_frames(&mono, 0..frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> FeatureSet {
        FeatureSet {
            beat_strength: (0..len).map(|i| i as f32).collect(),
            onset_strength: (0..len).map(|i| i as f32 * 2.0).collect(),
            chroma: vec![[0.0; 12]; len],
            rms: vec![0.5; len],
            frame_rate: 10.0,
        }
    }

    #[test]
    fn test_slice_then_append_restores_set() {
        let full = ramp(25);
        let mut joined = full.slice(0..10);
        joined.append(full.slice(10..25));
        assert_eq!(joined, full);
    }

    #[test]
    fn test_slice_clamps_out_of_range() {
        let full = ramp(5);
        assert_eq!(full.slice(3..100).len(), 2);
        assert!(full.slice(10..20).is_empty());
    }

    #[test]
    fn test_duration_follows_frame_rate() {
        let full = ramp(100);
        assert!((full.duration() - 10.0).abs() < 1e-9);
    }
}
