//! Tempo estimation
//!
//! Turns beat-strength and onset-strength curves into one BPM value that is
//! robust against octave errors (reporting 172 as 86 or the reverse).
//!
//! ## Pipeline
//!
//! 1. Beat and onset detectors each propose a base candidate
//! 2. Agreeing detections merge into one boosted candidate; disagreeing ones stay apart
//! 3. Every base spawns discounted alias candidates (x0.5, x0.75, x1.25, x1.5, x2)
//! 4. Candidates are ranked by score, ties going beat > onset > alias
//! 5. When the two detectors sit an octave apart the faster one wins, unless the
//!    slower one looks like a sparse ballad
//! 6. Slow readings of loud tracks are re-checked at x1.2 and x1.25
//! 7. Full songs get a final on-beat/off-beat octave check; short clips in the
//!    mid-tempo band are re-checked at x1.5 instead
//!
//! ## Confidence
//!
//! `support * (0.7 + 0.3 * min(1, gap / (2 * epsilon)))`, where `support` is the
//! noisy-OR of every candidate within tolerance of the chosen tempo and `gap`
//! is its lead over the best unrelated candidate. A lead under `epsilon` flags
//! the estimate as low confidence.

mod detect;
mod validate;

use crate::config::{AnalysisMode, TempoConfig};
use serde::{Deserialize, Serialize};

/// Which detector produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Beat,
    Onset,
    Alias,
}

impl CandidateSource {
    /// Tie-break rank, lower wins
    fn priority(&self) -> u8 {
        match self {
            CandidateSource::Beat => 0,
            CandidateSource::Onset => 1,
            CandidateSource::Alias => 2,
        }
    }

    pub fn is_direct(&self) -> bool {
        !matches!(self, CandidateSource::Alias)
    }
}

/// One tempo hypothesis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoCandidate {
    pub bpm: f64,
    /// Detector strength in 0..1
    pub score: f32,
    pub source: CandidateSource,
}

/// Curves and context the estimator consumes
#[derive(Debug, Clone, Copy)]
pub struct TempoInput<'a> {
    pub beat_strength: &'a [f32],
    pub onset_strength: &'a [f32],
    pub frame_rate: f64,
    /// Signal duration in seconds
    pub duration: f64,
    /// Loudness in 0..1, compared against the ballad ceiling
    pub energy: f32,
}

/// Tempo estimator output
#[derive(Debug, Clone, PartialEq)]
pub struct TempoEstimate {
    pub bpm: f64,
    pub confidence: f32,
    /// The winner did not lead the runner-up by `confidence_epsilon`
    pub low_confidence: bool,
    /// The winner came from automatic doubling or octave validation
    pub octave_adjusted: bool,
    /// The winner was treated as a slow ballad (doubling and validation skipped)
    pub ballad: bool,
    /// An intermediate or mid-tempo correction moved the winner by a non-octave ratio
    pub ratio_adjusted: bool,
    /// Ranked candidates, best first
    pub candidates: Vec<TempoCandidate>,
}

impl TempoEstimate {
    /// Result for curves with no usable periodicity
    fn undetermined() -> Self {
        Self {
            bpm: 0.0,
            confidence: 0.0,
            low_confidence: true,
            octave_adjusted: false,
            ballad: false,
            ratio_adjusted: false,
            candidates: Vec::new(),
        }
    }

    pub fn is_determined(&self) -> bool {
        self.bpm > 0.0
    }
}

/// Stateless tempo estimator; one instance can serve any number of threads
#[derive(Debug, Clone)]
pub struct TempoEstimator {
    config: TempoConfig,
}

impl TempoEstimator {
    pub fn new(config: &TempoConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Estimate tempo from feature curves
    pub fn estimate(&self, input: &TempoInput<'_>, mode: AnalysisMode) -> TempoEstimate {
        let len = input.beat_strength.len().min(input.onset_strength.len());
        let window_frames =
            (self.config.window_seconds(mode, input.duration) * input.frame_rate).round() as usize;
        let window = centered_range(len, window_frames);

        let beat_curve = &input.beat_strength[window.clone()];
        let onset_curve = &input.onset_strength[window];

        let beat = detect::beat_candidate(beat_curve, input.frame_rate, &self.config);
        let onset = detect::onset_candidate(onset_curve, input.frame_rate, &self.config);
        log::debug!(
            "estimate: {} mode, {} frames, beat {:?}, onset {:?}",
            mode,
            beat_curve.len(),
            beat.map(|c| (c.bpm, c.score)),
            onset.map(|c| (c.bpm, c.score))
        );

        let mut estimate = self.resolve(beat, onset, input.energy);
        if !estimate.is_determined() {
            return estimate;
        }

        self.correct_intermediate(&mut estimate, onset_curve, input);

        match mode {
            AnalysisMode::ShortClip if estimate.ballad => {}
            AnalysisMode::ShortClip => self.correct_mid_tempo(&mut estimate, onset_curve, input.frame_rate),
            AnalysisMode::FullSong if estimate.ballad => {
                log::debug!(
                    "estimate: {:.1} BPM looks like a slow ballad, skipping octave validation",
                    estimate.bpm
                );
            }
            AnalysisMode::FullSong => {
                let (bpm, changed) = validate::validate_octave(
                    estimate.bpm,
                    onset_curve,
                    input.frame_rate,
                    (self.config.min_bpm, self.config.max_bpm),
                    self.config.validation_improvement as f64,
                );
                if changed {
                    log::info!(
                        "estimate: octave validation moved {:.1} -> {:.1} BPM",
                        estimate.bpm,
                        bpm
                    );
                    estimate.bpm = bpm;
                    estimate.confidence *= 0.9;
                    estimate.octave_adjusted = true;
                }
            }
        }

        estimate
    }

    /// Loud tracks read in the intermediate band may really run 6:5 or 5:4 faster
    fn correct_intermediate(&self, estimate: &mut TempoEstimate, onset: &[f32], input: &TempoInput<'_>) {
        let [lo, hi] = self.config.intermediate_bpm_range;
        if !(lo..=hi).contains(&estimate.bpm) || input.energy <= self.config.intermediate_energy_floor {
            return;
        }
        let Some(bpm) = validate::correct_intermediate(
            estimate.bpm,
            onset,
            input.frame_rate,
            &self.config.intermediate_factors,
            self.config.max_bpm,
            self.config.intermediate_improvement as f64,
        ) else {
            return;
        };

        log::info!(
            "estimate: intermediate correction moved {:.1} -> {:.1} BPM (energy {:.2})",
            estimate.bpm,
            bpm,
            input.energy
        );
        estimate.bpm = bpm;
        estimate.ratio_adjusted = true;
        estimate.ballad = !estimate.octave_adjusted && self.is_ballad(bpm, input.energy);
    }

    /// Short clips in the mid-tempo band may be a 2:3 reading of a faster beat
    fn correct_mid_tempo(&self, estimate: &mut TempoEstimate, onset: &[f32], frame_rate: f64) {
        let [lo, hi] = self.config.mid_tempo_bpm_range;
        if !(lo..=hi).contains(&estimate.bpm) {
            return;
        }
        if estimate.confidence >= self.config.mid_tempo_confidence_skip {
            log::debug!(
                "estimate: {:.1} BPM at confidence {:.2}, skipping mid-tempo check",
                estimate.bpm,
                estimate.confidence
            );
            return;
        }
        let Some(bpm) = validate::correct_mid_tempo(
            estimate.bpm,
            onset,
            frame_rate,
            &self.config.mid_tempo_factors,
            self.config.mid_tempo_max_bpm.min(self.config.max_bpm),
            self.config.mid_tempo_improvement as f64,
        ) else {
            return;
        };

        log::info!("estimate: mid-tempo correction moved {:.1} -> {:.1} BPM", estimate.bpm, bpm);
        estimate.bpm = bpm;
        estimate.confidence *= 0.95;
        estimate.ratio_adjusted = true;
    }

    /// Combine the detector outputs into a ranked decision
    ///
    /// Pure function of its inputs; exposed so detector outputs can be replayed.
    pub fn resolve(
        &self,
        beat: Option<TempoCandidate>,
        onset: Option<TempoCandidate>,
        energy: f32,
    ) -> TempoEstimate {
        let tolerance = self.config.agreement_tolerance_bpm;
        let near = |a: f64, b: f64| (a - b).abs() <= tolerance;

        let bases: Vec<TempoCandidate> = match (beat, onset) {
            (Some(b), Some(o)) if near(b.bpm, o.bpm) => {
                let weight = (b.score + o.score) as f64;
                let bpm = if weight > 0.0 {
                    (b.bpm * b.score as f64 + o.bpm * o.score as f64) / weight
                } else {
                    (b.bpm + o.bpm) / 2.0
                };
                vec![TempoCandidate {
                    bpm,
                    score: 1.0 - (1.0 - b.score) * (1.0 - o.score),
                    source: CandidateSource::Beat,
                }]
            }
            (b, o) => b.into_iter().chain(o).collect(),
        };
        if bases.is_empty() {
            return TempoEstimate::undetermined();
        }

        let candidates = self.rank(self.with_aliases(&bases, energy));
        let top = candidates[0];

        // Octave pair across detectors: prefer the faster reading
        let mut chosen = top.bpm;
        let mut folded: Option<f64> = None;
        let top_is_ballad = self.is_ballad(top.bpm, energy);
        if top.source.is_direct() && !top_is_ballad {
            if let Some(partner) = bases
                .iter()
                .find(|c| c.source != top.source && near(c.bpm, top.bpm * 2.0))
            {
                log::debug!(
                    "resolve: doubling {:.1} -> {:.1} BPM (energy {:.2})",
                    top.bpm,
                    partner.bpm,
                    energy
                );
                chosen = partner.bpm;
                folded = Some(top.bpm);
            }
        }

        let support = 1.0
            - candidates
                .iter()
                .filter(|c| near(c.bpm, chosen))
                .fold(1.0f32, |acc, c| acc * (1.0 - c.score));
        let runner_up = candidates
            .iter()
            .filter(|c| !near(c.bpm, chosen) && folded.map_or(true, |f| !near(c.bpm, f)))
            .fold(0.0f32, |acc, c| acc.max(c.score));

        let epsilon = self.config.confidence_epsilon;
        let gap = support - runner_up;
        let margin = (gap / (2.0 * epsilon)).clamp(0.0, 1.0);
        let mut confidence = support * (0.7 + 0.3 * margin);
        if folded.is_some() {
            confidence *= 0.95;
        }
        let low_confidence = gap < epsilon;
        if low_confidence {
            confidence = confidence.min(self.config.low_confidence_ceiling);
        }

        TempoEstimate {
            bpm: chosen,
            confidence: confidence.clamp(0.0, 1.0),
            low_confidence,
            octave_adjusted: folded.is_some(),
            ballad: folded.is_none() && top_is_ballad,
            ratio_adjusted: false,
            candidates,
        }
    }

    /// Slow, quiet tempo whose double would still be a plausible reading
    fn is_ballad(&self, bpm: f64, energy: f32) -> bool {
        let [lo, hi] = self.config.slow_ballad_bpm_range;
        (lo..=hi).contains(&bpm)
            && bpm * 2.0 >= self.config.ballad_double_floor_bpm
            && bpm * 2.0 <= self.config.max_bpm
            && energy < self.config.slow_ballad_energy_ceiling
    }

    /// Bases followed by their retained aliases
    fn with_aliases(&self, bases: &[TempoCandidate], energy: f32) -> Vec<TempoCandidate> {
        let mut candidates = bases.to_vec();
        for base in bases {
            let ballad = self.is_ballad(base.bpm, energy);
            for &factor in &self.config.alias_factors {
                if ballad && (factor - 2.0).abs() < 1e-9 {
                    continue;
                }
                let bpm = base.bpm * factor;
                let score = base.score * self.config.alias_discount;
                if bpm < self.config.min_bpm
                    || bpm > self.config.max_bpm
                    || score < self.config.alias_min_score
                {
                    continue;
                }
                candidates.push(TempoCandidate {
                    bpm,
                    score,
                    source: CandidateSource::Alias,
                });
            }
        }
        candidates
    }

    fn rank(&self, mut candidates: Vec<TempoCandidate>) -> Vec<TempoCandidate> {
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.source.priority().cmp(&b.source.priority()))
        });
        candidates
    }
}

/// `wanted` frames centred in `len`, clamped
fn centered_range(len: usize, wanted: usize) -> std::ops::Range<usize> {
    let wanted = wanted.clamp(1, len.max(1)).min(len);
    let start = (len - wanted) / 2;
    start..start + wanted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(bpm: f64, score: f32) -> Option<TempoCandidate> {
        Some(TempoCandidate {
            bpm,
            score,
            source: CandidateSource::Beat,
        })
    }

    fn onset(bpm: f64, score: f32) -> Option<TempoCandidate> {
        Some(TempoCandidate {
            bpm,
            score,
            source: CandidateSource::Onset,
        })
    }

    fn estimator() -> TempoEstimator {
        TempoEstimator::new(&TempoConfig::default())
    }

    fn has_alias(estimate: &TempoEstimate, bpm: f64, below: f32) -> bool {
        estimate.candidates.iter().any(|c| {
            c.source == CandidateSource::Alias && (c.bpm - bpm).abs() < 1e-6 && c.score < below
        })
    }

    #[test]
    fn test_octave_pair_resolves_to_double_outside_ballad_band() {
        // Beat 86 (0.90), onset 172 (0.77), energy 0.57: 86 is above the ballad band
        let estimate = estimator().resolve(beat(86.0, 0.90), onset(172.0, 0.77), 0.57);

        assert!((estimate.bpm - 172.0).abs() < 1e-6, "bpm {}", estimate.bpm);
        assert!(estimate.octave_adjusted);
        assert!(!estimate.low_confidence);
        assert!(
            estimate.confidence > 0.7 && estimate.confidence < 0.95,
            "confidence {}",
            estimate.confidence
        );
    }

    #[test]
    fn test_ballad_suppresses_doubling() {
        let estimate = estimator().resolve(beat(80.0, 0.90), onset(160.0, 0.77), 0.57);

        assert!((estimate.bpm - 80.0).abs() < 1e-6, "bpm {}", estimate.bpm);
        assert!(estimate.ballad);
        assert!(!estimate.octave_adjusted);
        // No doubled alias is generated for the ballad base
        assert!(!has_alias(&estimate, 160.0, 1.0));
        assert!(has_alias(&estimate, 40.0, 0.90));
    }

    #[test]
    fn test_loud_slow_track_still_doubles() {
        let estimate = estimator().resolve(beat(80.0, 0.90), onset(160.0, 0.77), 0.85);
        assert!((estimate.bpm - 160.0).abs() < 1e-6);
        assert!(!estimate.ballad);
    }

    #[test]
    fn test_ballad_band_is_configurable() {
        let config = TempoConfig {
            slow_ballad_bpm_range: [60.0, 90.0],
            ..TempoConfig::default()
        };
        let estimate = TempoEstimator::new(&config).resolve(beat(86.0, 0.90), onset(172.0, 0.77), 0.57);
        assert!((estimate.bpm - 86.0).abs() < 1e-6);
    }

    #[test]
    fn test_aliases_score_below_their_base() {
        let estimate = estimator().resolve(beat(100.0, 0.90), onset(105.0, 0.80), 0.9);

        for (bpm, score) in [(100.0, 0.90f32), (105.0, 0.80f32)] {
            assert!(has_alias(&estimate, bpm * 2.0, score), "double of {}", bpm);
            assert!(has_alias(&estimate, bpm * 0.5, score), "half of {}", bpm);
        }
        assert!(estimate
            .candidates
            .iter()
            .filter(|c| c.source == CandidateSource::Alias)
            .all(|c| c.score >= 0.50));
    }

    #[test]
    fn test_weak_aliases_are_dropped() {
        let estimate = estimator().resolve(beat(120.0, 0.55), None, 0.9);
        assert_eq!(estimate.candidates.len(), 1);
        assert_eq!(estimate.candidates[0].source, CandidateSource::Beat);
    }

    #[test]
    fn test_agreeing_detectors_merge_and_boost() {
        let estimate = estimator().resolve(beat(120.0, 0.70), onset(121.0, 0.70), 0.9);

        let direct: Vec<_> = estimate
            .candidates
            .iter()
            .filter(|c| c.source.is_direct())
            .collect();
        assert_eq!(direct.len(), 1);
        assert!((direct[0].bpm - 120.5).abs() < 1e-9);
        assert!((direct[0].score - 0.91).abs() < 1e-6);
        assert!((estimate.bpm - 120.5).abs() < 1e-9);
        assert!(!estimate.low_confidence);
    }

    #[test]
    fn test_ranking_ties_prefer_direct_detection() {
        let config = TempoConfig {
            alias_discount: 0.75,
            ..TempoConfig::default()
        };
        let estimate = TempoEstimator::new(&config).resolve(beat(100.0, 0.75), onset(150.0, 0.5625), 0.9);
        // 100 * 1.5 alias scores 0.5625, the same as the onset reading at 150
        let at_150: Vec<_> = estimate
            .candidates
            .iter()
            .filter(|c| (c.bpm - 150.0).abs() < 1e-9)
            .collect();
        assert_eq!(at_150.len(), 2);
        assert_eq!(at_150[0].source, CandidateSource::Onset);
        assert_eq!(at_150[1].source, CandidateSource::Alias);
        assert_eq!(estimate.candidates[0].source, CandidateSource::Beat);
    }

    #[test]
    fn test_close_call_is_flagged_low_confidence() {
        let estimate = estimator().resolve(beat(120.0, 0.55), onset(90.0, 0.54), 0.9);

        assert!((estimate.bpm - 120.0).abs() < 1e-9);
        assert!(estimate.low_confidence);
        assert!(estimate.confidence <= 0.5);
    }

    #[test]
    fn test_no_detections_is_undetermined() {
        let estimate = estimator().resolve(None, None, 0.5);
        assert!(!estimate.is_determined());
        assert_eq!(estimate.confidence, 0.0);
        assert!(estimate.low_confidence);
    }

    #[test]
    fn test_estimate_from_pulse_curves() {
        let frame_rate = 22050.0 / 512.0;
        let n = (40.0 * frame_rate) as usize;
        let period = 60.0 * frame_rate / 120.0;
        let mut curve = vec![0.0f32; n];
        let mut t = 0.0;
        while (t as usize) < n {
            curve[t as usize] = 1.0;
            if (t as usize) + 1 < n {
                curve[t as usize + 1] = 0.4;
            }
            t += period;
        }

        let input = TempoInput {
            beat_strength: &curve,
            onset_strength: &curve,
            frame_rate,
            duration: 40.0,
            energy: 0.8,
        };
        let estimate = estimator().estimate(&input, AnalysisMode::ShortClip);
        assert!((estimate.bpm - 120.0).abs() < 3.0, "bpm {}", estimate.bpm);
        assert!(estimate.confidence > 0.5);
    }

    const CLICK_FRAME_RATE: f64 = 40.0;

    /// Single-frame pulses at `bpm`; every other pulse scaled by `offbeat`
    fn click_curve(bpm: f64, seconds: f64, offbeat: f32) -> Vec<f32> {
        let n = (seconds * CLICK_FRAME_RATE) as usize;
        let period = 60.0 * CLICK_FRAME_RATE / bpm;
        let mut curve = vec![0.0f32; n];
        let mut t = 0.0;
        let mut beat = 0usize;
        while (t as usize) < n {
            curve[t as usize] = if beat % 2 == 0 { 1.0 } else { offbeat };
            beat += 1;
            t += period;
        }
        curve
    }

    #[test]
    fn test_full_song_validates_octave_short_clip_does_not() {
        // Accented 200 BPM clicks: the detectors settle on the 100 BPM accents,
        // but the unaccented clicks leave no quiet off-beat at 100
        let curve = click_curve(200.0, 60.0, 0.5);
        let input = TempoInput {
            beat_strength: &curve,
            onset_strength: &curve,
            frame_rate: CLICK_FRAME_RATE,
            duration: 60.0,
            energy: 0.8,
        };

        let short = estimator().estimate(&input, AnalysisMode::ShortClip);
        assert!((short.bpm - 100.0).abs() < 1.0, "short clip bpm {}", short.bpm);
        assert!(!short.octave_adjusted);

        let full = estimator().estimate(&input, AnalysisMode::FullSong);
        assert!((full.bpm - 2.0 * short.bpm).abs() < 1.0, "full song bpm {}", full.bpm);
        assert!(full.octave_adjusted);
        assert!(full.confidence < short.confidence);
    }

    #[test]
    fn test_loud_intermediate_tempo_is_corrected() {
        // Beat curve reads 75 BPM, the onsets actually fall at 90
        let beat_curve = click_curve(75.0, 40.0, 1.0);
        let onset_curve = click_curve(90.0, 40.0, 1.0);
        let input = |energy| TempoInput {
            beat_strength: &beat_curve,
            onset_strength: &onset_curve,
            frame_rate: CLICK_FRAME_RATE,
            duration: 40.0,
            energy,
        };

        let loud = estimator().estimate(&input(0.9), AnalysisMode::ShortClip);
        assert!((loud.bpm - 90.0).abs() < 1.0, "loud bpm {}", loud.bpm);
        assert!(loud.ratio_adjusted);

        let quiet = estimator().estimate(&input(0.5), AnalysisMode::ShortClip);
        assert!((quiet.bpm - 75.0).abs() < 1.0, "quiet bpm {}", quiet.bpm);
        assert!(!quiet.ratio_adjusted);
        assert!(quiet.ballad);
    }

    #[test]
    fn test_confident_mid_tempo_is_left_alone() {
        let mut estimate = estimator().resolve(beat(100.0, 0.95), onset(100.0, 0.95), 0.8);
        assert!(estimate.confidence >= 0.90);
        let onsets = click_curve(150.0, 30.0, 1.0);
        estimator().correct_mid_tempo(&mut estimate, &onsets, CLICK_FRAME_RATE);
        assert_eq!(estimate.bpm, 100.0);
        assert!(!estimate.ratio_adjusted);

        // The same reading with a close runner-up is re-checked
        let mut unsure = estimator().resolve(beat(100.0, 0.60), onset(130.0, 0.58), 0.8);
        assert!(unsure.confidence < 0.90);
        estimator().correct_mid_tempo(&mut unsure, &onsets, CLICK_FRAME_RATE);
        assert!((unsure.bpm - 150.0).abs() < 1e-6, "bpm {}", unsure.bpm);
        assert!(unsure.ratio_adjusted);
    }

    #[test]
    fn test_centered_range() {
        assert_eq!(centered_range(100, 40), 30..70);
        assert_eq!(centered_range(10, 40), 0..10);
        assert_eq!(centered_range(0, 40), 0..0);
    }
}
