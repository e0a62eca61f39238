//! Perceived energy from RMS and onset density

use crate::features::FeatureSet;

/// Floor of the loudness scale (dBFS)
const LOUDNESS_FLOOR_DB: f32 = -60.0;

/// Onset frames above mean + one deviation at which density saturates
const DENSITY_SATURATION: f32 = 0.25;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyProfile {
    /// 90th percentile frame level mapped from -60..0 dBFS onto 0..1
    pub loudness: f32,
    /// Share of strongly accented frames, saturating at one in four
    pub pulse_density: f32,
    /// `0.7 * loudness + 0.3 * pulse_density`
    pub energy: f32,
}

pub fn measure(features: &FeatureSet) -> EnergyProfile {
    if features.rms.is_empty() {
        return EnergyProfile::default();
    }

    let mut levels: Vec<f32> = features
        .rms
        .iter()
        .map(|&rms| 20.0 * rms.max(1e-6).log10())
        .collect();
    levels.sort_by(|a, b| a.total_cmp(b));
    let p90 = levels[((levels.len() - 1) as f32 * 0.9) as usize];
    let loudness = ((p90 - LOUDNESS_FLOOR_DB) / -LOUDNESS_FLOOR_DB).clamp(0.0, 1.0);

    let pulse_density = pulse_density(&features.onset_strength);

    EnergyProfile {
        loudness,
        pulse_density,
        energy: (0.7 * loudness + 0.3 * pulse_density).clamp(0.0, 1.0),
    }
}

fn pulse_density(onset: &[f32]) -> f32 {
    if onset.is_empty() {
        return 0.0;
    }
    let n = onset.len() as f32;
    let mean = onset.iter().sum::<f32>() / n;
    let std = (onset.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
    if std <= f32::EPSILON {
        return 0.0;
    }
    let accented = onset.iter().filter(|&&v| v > mean + std).count() as f32;
    (accented / n / DENSITY_SATURATION).clamp(0.0, 1.0)
}
