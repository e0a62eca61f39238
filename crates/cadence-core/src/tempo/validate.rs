//! Octave validation from on-beat vs off-beat onset energy
//!
//! At the true tempo, onsets pile up on the beat and the half-beat midpoints
//! stay comparatively quiet. Octave validation only runs on full songs, where
//! enough bars repeat for the comparison to hold. The non-octave corrections
//! (intermediate and mid-tempo) use the same separation measure.

use super::detect::{best_phase, pulse_mean};

/// Offset added to the off-beat mean so silent gaps don't divide by zero
const OFF_BEAT_FLOOR: f64 = 0.01;

/// Octave preference weight
fn octave_preference(bpm: f64) -> f64 {
    if (80.0..=140.0).contains(&bpm) {
        1.40
    } else if (40.0..80.0).contains(&bpm) || (bpm > 140.0 && bpm <= 180.0) {
        1.10
    } else {
        0.90
    }
}

/// On-beat / off-beat onset energy ratio at the best pulse phase
///
/// `None` when the curve holds fewer than four beats at this tempo.
pub(crate) fn onset_separation(bpm: f64, onset: &[f32], frame_rate: f64) -> Option<f64> {
    if bpm <= 0.0 || frame_rate <= 0.0 {
        return None;
    }
    let period = 60.0 * frame_rate / bpm;
    if period < 2.0 || (onset.len() as f64) < period * 4.0 {
        return None;
    }

    let peak = onset.iter().fold(0.0f32, |acc, &v| acc.max(v));
    if peak <= 0.0 {
        return None;
    }
    let normalized: Vec<f32> = onset.iter().map(|&v| v / peak).collect();
    let last = normalized.len() - 1;

    let (phase, _) = best_phase(&normalized, period);
    let on = pulse_mean(&normalized, phase as f64, period, |frame| {
        normalized[frame.saturating_sub(1)..=(frame + 1).min(last)]
            .iter()
            .fold(0.0f32, |acc, &v| acc.max(v)) as f64
    });
    let off = pulse_mean(&normalized, phase as f64 + period / 2.0, period, |frame| {
        let window = &normalized[frame.saturating_sub(1)..=(frame + 1).min(last)];
        window.iter().map(|&v| v as f64).sum::<f64>() / window.len() as f64
    });

    Some(on / (off + OFF_BEAT_FLOOR))
}

/// Re-check `bpm` against its half and double
///
/// Returns the tempo to keep and whether it changed. An alternative must beat
/// the current tempo's weighted separation by `improvement`.
pub(crate) fn validate_octave(
    bpm: f64,
    onset: &[f32],
    frame_rate: f64,
    bpm_range: (f64, f64),
    improvement: f64,
) -> (f64, bool) {
    let Some(current) = onset_separation(bpm, onset, frame_rate) else {
        return (bpm, false);
    };

    let mut best_bpm = bpm;
    let mut best_score = current * octave_preference(bpm);
    let threshold = best_score * improvement;

    for alternative in [bpm * 0.5, bpm * 2.0] {
        if alternative < bpm_range.0 || alternative > bpm_range.1 {
            continue;
        }
        let Some(separation) = onset_separation(alternative, onset, frame_rate) else {
            continue;
        };
        let score = separation * octave_preference(alternative);
        if score > threshold && score > best_score {
            best_score = score;
            best_bpm = alternative;
        }
    }

    log::debug!(
        "validate_octave: {:.1} BPM -> {:.1} BPM (weighted separation {:.2})",
        bpm,
        best_bpm,
        best_score
    );
    (best_bpm, (best_bpm - bpm).abs() > f64::EPSILON)
}

/// Preference for tempos near the 118-128 BPM dance band
///
/// Half, double, quarter and quadruple readings inside 60-180 BPM count too.
pub(crate) fn tempo_alignment(bpm: f64) -> f64 {
    if bpm <= 0.0 {
        return 0.0;
    }
    let band = |bpm: f64| {
        if (118.0..=128.0).contains(&bpm) {
            1.0
        } else if (105.0..=140.0).contains(&bpm) {
            0.85
        } else if (90.0..=105.0).contains(&bpm) || (140.0..=155.0).contains(&bpm) {
            0.7
        } else {
            (1.0 - (bpm - 125.0).abs() / 100.0).max(0.2)
        }
    };

    let mut best = band(bpm);
    for related in [bpm * 0.5, bpm * 2.0, bpm * 0.25, bpm * 4.0] {
        if (60.0..=180.0).contains(&related) {
            best = best.max(band(related));
        }
    }
    best
}

/// Try each `factors` multiple of `bpm` and keep the best one that beats the
/// running best weighted separation by `improvement`
fn correct_by_ratio(
    bpm: f64,
    onset: &[f32],
    frame_rate: f64,
    factors: &[f64],
    max_bpm: f64,
    improvement: f64,
    weight: impl Fn(f64) -> f64,
) -> Option<f64> {
    let mut best_score = onset_separation(bpm, onset, frame_rate)? * weight(bpm);
    let mut corrected = None;

    for &factor in factors {
        let candidate = bpm * factor;
        if candidate > max_bpm {
            continue;
        }
        let Some(separation) = onset_separation(candidate, onset, frame_rate) else {
            continue;
        };
        let score = separation * weight(candidate);
        if score > best_score * improvement {
            best_score = score;
            corrected = Some(candidate);
        }
    }
    corrected
}

/// Slow, loud tempos that are really a 5:6 or 4:5 reading of a faster beat
///
/// Returns the corrected tempo, or `None` to keep `bpm`.
pub(crate) fn correct_intermediate(
    bpm: f64,
    onset: &[f32],
    frame_rate: f64,
    factors: &[f64],
    max_bpm: f64,
    improvement: f64,
) -> Option<f64> {
    let corrected = correct_by_ratio(bpm, onset, frame_rate, factors, max_bpm, improvement, |_| 1.0);
    if let Some(to) = corrected {
        log::debug!("correct_intermediate: {:.1} BPM -> {:.1} BPM", bpm, to);
    }
    corrected
}

/// Mid tempos that are really the 2:3 reading of a faster beat
///
/// Separation is weighted toward dance-band tempos. Returns the corrected
/// tempo, or `None` to keep `bpm`.
pub(crate) fn correct_mid_tempo(
    bpm: f64,
    onset: &[f32],
    frame_rate: f64,
    factors: &[f64],
    max_bpm: f64,
    improvement: f64,
) -> Option<f64> {
    let corrected = correct_by_ratio(bpm, onset, frame_rate, factors, max_bpm, improvement, |bpm| {
        0.7 + 0.3 * tempo_alignment(bpm)
    });
    if let Some(to) = corrected {
        log::debug!("correct_mid_tempo: {:.1} BPM -> {:.1} BPM", bpm, to);
    }
    corrected
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_RATE: f64 = 22050.0 / 512.0;

    fn pulse_curve(bpm: f64, seconds: f64) -> Vec<f32> {
        let n = (seconds * FRAME_RATE) as usize;
        let period = 60.0 * FRAME_RATE / bpm;
        let mut curve = vec![0.0f32; n];
        let mut t = 0.0;
        while (t as usize) < n {
            curve[t as usize] = 1.0;
            t += period;
        }
        curve
    }

    #[test]
    fn test_true_tempo_separates_best() {
        let curve = pulse_curve(120.0, 60.0);
        let at_tempo = onset_separation(120.0, &curve, FRAME_RATE).unwrap();
        let at_half = onset_separation(60.0, &curve, FRAME_RATE).unwrap();
        assert!(at_tempo > at_half * 5.0, "{} vs {}", at_tempo, at_half);
    }

    #[test]
    fn test_validation_keeps_correct_tempo() {
        let curve = pulse_curve(120.0, 60.0);
        let (bpm, changed) = validate_octave(120.0, &curve, FRAME_RATE, (40.0, 220.0), 1.10);
        assert_eq!(bpm, 120.0);
        assert!(!changed);
    }

    #[test]
    fn test_validation_recovers_half_tempo_report() {
        // Off-beat hits at the midpoint make 60 BPM implausible
        let curve = pulse_curve(120.0, 60.0);
        let (bpm, changed) = validate_octave(60.0, &curve, FRAME_RATE, (40.0, 220.0), 1.10);
        assert_eq!(bpm, 120.0);
        assert!(changed);
    }

    #[test]
    fn test_short_curve_is_not_validated() {
        let curve = pulse_curve(120.0, 1.0);
        assert!(onset_separation(120.0, &curve, FRAME_RATE).is_none());
        assert_eq!(validate_octave(120.0, &curve, FRAME_RATE, (40.0, 220.0), 1.10), (120.0, false));
    }

    #[test]
    fn test_tempo_alignment_bands() {
        assert_eq!(tempo_alignment(124.0), 1.0);
        assert_eq!(tempo_alignment(135.0), 0.85);
        assert_eq!(tempo_alignment(150.0), 0.7);
        // 62 BPM reads as 124 doubled
        assert_eq!(tempo_alignment(62.0), 1.0);
        assert_eq!(tempo_alignment(0.0), 0.0);
    }

    #[test]
    fn test_intermediate_recovers_faster_beat() {
        let curve = pulse_curve(90.0, 30.0);
        let corrected = correct_intermediate(75.0, &curve, FRAME_RATE, &[1.2, 1.25], 220.0, 1.5).unwrap();
        assert!((corrected - 90.0).abs() < 1e-6, "{}", corrected);
    }

    #[test]
    fn test_intermediate_keeps_true_slow_tempo() {
        let curve = pulse_curve(75.0, 30.0);
        assert!(correct_intermediate(75.0, &curve, FRAME_RATE, &[1.2, 1.25], 220.0, 1.5).is_none());
    }

    #[test]
    fn test_mid_tempo_recovers_three_halves() {
        let curve = pulse_curve(150.0, 30.0);
        let corrected = correct_mid_tempo(100.0, &curve, FRAME_RATE, &[1.5, 1.55], 152.0, 1.2).unwrap();
        assert!((corrected - 150.0).abs() < 1e-6, "{}", corrected);
    }

    #[test]
    fn test_mid_tempo_respects_ceiling() {
        let curve = pulse_curve(150.0, 30.0);
        assert!(correct_mid_tempo(100.0, &curve, FRAME_RATE, &[1.5, 1.55], 140.0, 1.2).is_none());
        let steady = pulse_curve(100.0, 30.0);
        assert!(correct_mid_tempo(100.0, &steady, FRAME_RATE, &[1.5, 1.55], 152.0, 1.2).is_none());
    }
}
