//! Base tempo detectors
//!
//! Two independent periodicity estimators over frame-rate curves:
//! - beat detector: normalised autocorrelation of the beat-strength curve
//! - onset detector: pulse-train (comb) scoring of the onset-strength curve
//!
//! Both choose their peak under a log-normal tempo prior centred on 120 BPM
//! (one octave standard deviation) and report the raw periodicity strength
//! as the candidate score.

use super::{CandidateSource, TempoCandidate};
use crate::config::TempoConfig;

/// Grid step for the comb detector (BPM)
const COMB_STEP_BPM: f64 = 0.5;

/// Tempo prior weight, 1.0 at 120 BPM
pub(crate) fn tempo_prior(bpm: f64) -> f64 {
    let octaves = (bpm / 120.0).log2();
    (-0.5 * octaves * octaves).exp()
}

/// Autocorrelation peak of the beat-strength curve
pub(crate) fn beat_candidate(
    curve: &[f32],
    frame_rate: f64,
    config: &TempoConfig,
) -> Option<TempoCandidate> {
    let n = curve.len();
    if n < 8 || frame_rate <= 0.0 {
        return None;
    }

    let mean = curve.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let centered: Vec<f64> = curve.iter().map(|&v| v as f64 - mean).collect();
    let energy: f64 = centered.iter().map(|v| v * v).sum();
    if energy <= f64::EPSILON {
        return None;
    }

    let min_lag = ((60.0 * frame_rate / config.max_bpm).floor() as usize).max(1);
    let max_lag = ((60.0 * frame_rate / config.min_bpm).ceil() as usize).min(n - 2);
    if min_lag + 1 >= max_lag {
        return None;
    }

    // Biased estimate: longer lags overlap fewer frames and score slightly lower
    let acf: Vec<f64> = (0..=max_lag + 1)
        .map(|lag| {
            centered[..n - lag]
                .iter()
                .zip(&centered[lag..])
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / energy
        })
        .collect();

    let mut best: Option<(f64, f64, f64)> = None; // (weighted, lag, strength)
    for lag in min_lag.max(1)..=max_lag {
        let (prev, cur, next) = (acf[lag - 1], acf[lag], acf[lag + 1]);
        if cur <= 0.0 || cur <= prev || cur < next {
            continue;
        }
        // Parabolic interpolation around the integer peak
        let denom = prev - 2.0 * cur + next;
        let offset = if denom.abs() > 1e-12 {
            (0.5 * (prev - next) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };
        let refined_lag = lag as f64 + offset;
        let bpm = 60.0 * frame_rate / refined_lag;
        if bpm < config.min_bpm || bpm > config.max_bpm {
            continue;
        }
        let weighted = cur * tempo_prior(bpm);
        if best.map_or(true, |(w, _, _)| weighted > w) {
            best = Some((weighted, refined_lag, cur));
        }
    }

    best.map(|(_, lag, strength)| TempoCandidate {
        bpm: 60.0 * frame_rate / lag,
        score: strength.clamp(0.0, 1.0) as f32,
        source: CandidateSource::Beat,
    })
}

/// Best pulse-train match over a BPM grid on the onset-strength curve
pub(crate) fn onset_candidate(
    curve: &[f32],
    frame_rate: f64,
    config: &TempoConfig,
) -> Option<TempoCandidate> {
    let n = curve.len();
    if n < 8 || frame_rate <= 0.0 {
        return None;
    }

    let mean = curve.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let peak = curve.iter().fold(0.0f64, |acc, &v| acc.max(v as f64));
    if peak - mean <= f64::EPSILON {
        return None;
    }

    let steps = ((config.max_bpm - config.min_bpm) / COMB_STEP_BPM).floor() as usize;
    let mut best: Option<(f64, f64, f64)> = None; // (weighted, bpm, strength)
    for step in 0..=steps {
        let bpm = config.min_bpm + step as f64 * COMB_STEP_BPM;
        let period = 60.0 * frame_rate / bpm;
        // Need at least two full periods to call anything a pulse
        if period < 1.0 || period * 2.0 > n as f64 {
            continue;
        }
        let (_, on_mean) = best_phase(curve, period);
        let strength = ((on_mean - mean) / (peak - mean)).clamp(0.0, 1.0);
        if strength <= 0.0 {
            continue;
        }
        let weighted = strength * tempo_prior(bpm);
        if best.map_or(true, |(w, _, _)| weighted > w) {
            best = Some((weighted, bpm, strength));
        }
    }

    best.map(|(_, bpm, strength)| TempoCandidate {
        bpm,
        score: strength as f32,
        source: CandidateSource::Onset,
    })
}

/// Phase (in frames) whose pulse train collects the most curve energy,
/// with the mean curve value on that train
pub(crate) fn best_phase(curve: &[f32], period: f64) -> (usize, f64) {
    let phases = (period.floor() as usize).max(1);
    let mut best = (0usize, f64::MIN);
    for phase in 0..phases {
        let mean = pulse_mean(curve, phase as f64, period, |frame| curve[frame] as f64);
        if mean > best.1 {
            best = (phase, mean);
        }
    }
    best
}

/// Mean of `value(frame)` over the pulse train `start + k * period`
pub(crate) fn pulse_mean(
    curve: &[f32],
    start: f64,
    period: f64,
    value: impl Fn(usize) -> f64,
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    let mut position = start;
    while position.round() < curve.len() as f64 {
        sum += value(position.round() as usize);
        count += 1;
        position += period;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
