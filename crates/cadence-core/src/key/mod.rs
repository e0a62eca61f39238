//! Key estimation
//!
//! Chroma frames are summed into windows and each window votes for the
//! Krumhansl-Kessler template it correlates with best. Full songs aggregate
//! the votes into a consensus that can overrule the global chroma profile.
//! Short clips have too few windows for a majority, so they trust the single
//! most decisive correlation: the strongest window replaces the global
//! profile when it separates its key more clearly.
//!
//! Keys are stored as pitch class plus mode. Spellings ("Eb", "D#", "D♯")
//! only matter at comparison time, see [`KeyEstimate::matches_label`].

mod notation;
mod templates;

pub use notation::{Key, KeyParseError, Mode, PitchClass};
pub use templates::{KeyScores, KeyTemplates};

use crate::config::{AnalysisMode, KeyConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Confidence below which the third of the chosen key is re-examined
const MODE_RESCUE_CONFIDENCE: f32 = 0.5;

/// Consensus never claims certainty
const MAX_CONSENSUS_CONFIDENCE: f32 = 0.99;

/// One window's opinion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyWindowVote {
    pub root: PitchClass,
    pub mode: Mode,
    /// Lead of the best template over the second best
    pub strength: f32,
    /// Correlation of the best template
    pub score: f32,
}

impl KeyWindowVote {
    pub fn key(&self) -> Key {
        Key::new(self.root, self.mode)
    }
}

/// Key estimator output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyEstimate {
    pub root: PitchClass,
    pub mode: Mode,
    /// 0..1
    pub confidence: f32,
    /// Confidence fell below the threshold for the analysis mode
    pub low_confidence: bool,
}

impl KeyEstimate {
    pub fn new(key: Key, confidence: f32, low_confidence: bool) -> Self {
        Self {
            root: key.root,
            mode: key.mode,
            confidence,
            low_confidence,
        }
    }

    /// Placeholder for chroma with no tonal content
    pub fn undetermined() -> Self {
        Self::new(Key::default(), 0.0, true)
    }

    pub fn key(&self) -> Key {
        Key::new(self.root, self.mode)
    }

    /// Enharmonic comparison: "D# minor" matches "Eb minor" and "D♯m"
    pub fn matches_label(&self, label: &str) -> bool {
        self.key().matches_label(label)
    }
}

impl fmt::Display for KeyEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2})", self.key(), self.confidence)
    }
}

/// Stateless key estimator; one instance can serve any number of threads
#[derive(Debug, Clone)]
pub struct KeyEstimator {
    config: KeyConfig,
    templates: KeyTemplates,
}

impl KeyEstimator {
    pub fn new(config: &KeyConfig) -> Self {
        Self {
            config: config.clone(),
            templates: KeyTemplates::new(),
        }
    }

    /// Estimate the key of a chroma sequence
    pub fn estimate(&self, chroma: &[[f32; 12]], frame_rate: f64, mode: AnalysisMode) -> KeyEstimate {
        let profile = sum_profile(chroma);
        let global = self.templates.correlate(&profile);
        let (global_key, global_score, global_second) = global.best_two();
        if chroma.is_empty() || global_score <= 0.0 {
            log::debug!("estimate: no tonal content in {} frames", chroma.len());
            return KeyEstimate::undetermined();
        }

        let (mut key, mut confidence) = (global_key, global_score.clamp(0.0, 1.0));

        if mode.is_short() {
            let votes = self.window_votes(chroma, frame_rate, mode);
            let global_strength = global_score - global_second;
            if let Some(strongest) = strongest_vote(&votes).filter(|v| v.strength > global_strength) {
                if strongest.key() == key {
                    confidence = confidence.max(strongest.score.clamp(0.0, 1.0));
                } else {
                    log::debug!(
                        "estimate: strongest of {} windows {} ({:.2}) replaces global {} ({:.2})",
                        votes.len(),
                        strongest.key(),
                        strongest.strength,
                        global_key,
                        global_strength
                    );
                    key = strongest.key();
                    confidence = strongest.score.clamp(0.0, 1.0);
                }
            }
        } else if self.config.consensus_for(mode) {
            let votes = self.window_votes(chroma, frame_rate, mode);
            if let Some((consensus_key, dominance, runner_up_share)) = self.consensus(&votes) {
                let capped = dominance.min(MAX_CONSENSUS_CONFIDENCE);
                if consensus_key == global_key {
                    confidence = confidence.max(capped);
                } else if dominance >= 0.5 && (dominance - runner_up_share >= 0.15 || dominance >= 0.65) {
                    log::debug!(
                        "estimate: {} window votes overrule global {} with {} (dominance {:.2})",
                        votes.len(),
                        global_key,
                        consensus_key,
                        dominance
                    );
                    key = consensus_key;
                    confidence = capped;
                }
            }
        }

        if confidence < MODE_RESCUE_CONFIDENCE {
            key = self.rescue_mode(key, &profile);
        }

        let low_confidence = confidence < self.config.confidence_threshold(mode);
        log::debug!(
            "estimate: {} mode, {} (confidence {:.2}{})",
            mode,
            key,
            confidence,
            if low_confidence { ", low" } else { "" }
        );
        KeyEstimate::new(key, confidence, low_confidence)
    }

    /// Window length and hop in frames
    ///
    /// Short clips scale the window with their duration; either mode shrinks
    /// the window until `min_windows` fit.
    fn window_layout(&self, frames: usize, frame_rate: f64, mode: AnalysisMode) -> (usize, usize) {
        let duration = frames as f64 / frame_rate.max(f64::EPSILON);
        let (window, hop) = match mode {
            AnalysisMode::ShortClip => (
                (duration / 5.0).min(self.config.window_seconds),
                (duration / 10.0).min(self.config.hop_seconds),
            ),
            AnalysisMode::FullSong => (self.config.window_seconds, self.config.hop_seconds),
        };
        let mut window = ((window * frame_rate).round() as usize).max(1);
        let mut hop = ((hop * frame_rate).round() as usize).max(1);

        let fitting = if frames <= window { 1 } else { (frames - window) / hop + 1 };
        let min_windows = self.config.min_windows;
        if fitting < min_windows && frames >= min_windows {
            window = frames / min_windows;
            hop = window;
        }
        (window, hop)
    }

    fn window_votes(&self, chroma: &[[f32; 12]], frame_rate: f64, mode: AnalysisMode) -> Vec<KeyWindowVote> {
        let (window, hop) = self.window_layout(chroma.len(), frame_rate, mode);
        let mut votes = Vec::new();
        let mut start = 0;
        while start < chroma.len() {
            let end = (start + window).min(chroma.len());
            let (key, best, second) = self.templates.correlate(&sum_profile(&chroma[start..end])).best_two();
            if best > 0.0 {
                votes.push(KeyWindowVote {
                    root: key.root,
                    mode: key.mode,
                    strength: (best - second).max(0.0),
                    score: best,
                });
            }
            if end == chroma.len() {
                break;
            }
            start += hop;
        }
        votes
    }

    /// Winning key, its share of the tally, and the runner-up's share
    fn consensus(&self, votes: &[KeyWindowVote]) -> Option<(Key, f32, f32)> {
        let mut tally = [0.0f32; 24];
        for vote in votes {
            tally[vote.key().template_index()] += vote.strength + self.config.vote_floor;
        }
        let total: f32 = tally.iter().sum();
        if total <= 0.0 {
            return None;
        }

        let (best, _, second) = KeyScores { scores: tally }.best_two();
        Some((best, tally[best.template_index()] / total, second.max(0.0) / total))
    }

    /// Flip the mode when the opposite third clearly outweighs the chosen one
    fn rescue_mode(&self, key: Key, profile: &[f32; 12]) -> Key {
        let minor_third = profile[key.root.transpose(3).index()];
        let major_third = profile[key.root.transpose(4).index()];
        let ratio = self.config.mode_rescue_ratio;

        let flip = match key.mode {
            Mode::Major => minor_third > 0.0 && minor_third >= major_third * ratio,
            Mode::Minor => major_third > 0.0 && major_third >= minor_third * ratio,
        };
        if flip {
            let rescued = Key::new(key.root, key.mode.opposite());
            log::debug!("rescue_mode: {} -> {} (thirds {:.3} / {:.3})", key, rescued, minor_third, major_third);
            rescued
        } else {
            key
        }
    }
}

/// Highest-strength vote, earliest on ties
fn strongest_vote(votes: &[KeyWindowVote]) -> Option<&KeyWindowVote> {
    votes.iter().fold(None, |strongest, vote| match strongest {
        Some(current) if current.strength >= vote.strength => Some(current),
        _ => Some(vote),
    })
}

fn sum_profile(chroma: &[[f32; 12]]) -> [f32; 12] {
    let mut profile = [0.0f32; 12];
    for frame in chroma {
        for (total, value) in profile.iter_mut().zip(frame.iter()) {
            *total += value;
        }
    }
    profile
}

#[cfg(test)]
mod tests {
    use super::templates::profile_for;
    use super::*;

    const FRAME_RATE: f64 = 10.0;

    fn key(label: &str) -> Key {
        label.parse().unwrap()
    }

    fn frames(key: Key, seconds: f64, gain: f32) -> Vec<[f32; 12]> {
        let mut profile = profile_for(key);
        profile.iter_mut().for_each(|v| *v *= gain);
        vec![profile; (seconds * FRAME_RATE) as usize]
    }

    fn estimator() -> KeyEstimator {
        KeyEstimator::new(&KeyConfig::default())
    }

    #[test]
    fn test_short_clip_finds_key() {
        let chroma = frames(key("G major"), 20.0, 1.0);
        let estimate = estimator().estimate(&chroma, FRAME_RATE, AnalysisMode::ShortClip);
        assert_eq!(estimate.key(), key("G major"));
        assert!(estimate.confidence > 0.95);
        assert!(!estimate.low_confidence);
    }

    #[test]
    fn test_full_song_agreeing_windows_keep_key() {
        let chroma = frames(key("A minor"), 120.0, 1.0);
        let estimate = estimator().estimate(&chroma, FRAME_RATE, AnalysisMode::FullSong);
        assert_eq!(estimate.key(), key("A minor"));
        assert!(estimate.confidence >= 0.75);
        assert!(!estimate.low_confidence);
    }

    #[test]
    fn test_consensus_overrules_loud_minority_section() {
        // 84 s of quiet C major, then 36 s of F# major ten times louder
        let mut chroma = frames(key("C major"), 84.0, 1.0);
        chroma.extend(frames(key("F# major"), 36.0, 10.0));

        let (global_key, _, _) = estimator().templates.correlate(&sum_profile(&chroma)).best_two();
        assert_eq!(global_key, key("F# major"));

        let estimate = estimator().estimate(&chroma, FRAME_RATE, AnalysisMode::FullSong);
        assert_eq!(estimate.key(), key("C major"));
        assert!(estimate.confidence > 0.6 && estimate.confidence < 0.8, "{}", estimate.confidence);

        let config = KeyConfig {
            consensus_enabled: false,
            ..KeyConfig::default()
        };
        let estimate = KeyEstimator::new(&config).estimate(&chroma, FRAME_RATE, AnalysisMode::FullSong);
        assert_eq!(estimate.key(), key("F# major"));
    }

    #[test]
    fn test_ambiguous_chroma_is_flagged() {
        // Four majors a minor third apart blur into a nearly periodic profile
        let mut blend = [0.0f32; 12];
        for root in ["C", "D#", "F#", "A"] {
            for (total, value) in blend.iter_mut().zip(profile_for(key(root))) {
                *total += value / 4.0;
            }
        }
        let chroma = vec![blend; 200];
        let estimate = estimator().estimate(&chroma, FRAME_RATE, AnalysisMode::ShortClip);
        assert!(estimate.low_confidence);
        assert!(estimate.confidence < 0.6, "{}", estimate.confidence);
    }

    #[test]
    fn test_short_clip_trusts_strongest_window() {
        // Relative keys back to back: the summed profile sits between them,
        // while every window inside either half is unambiguous
        let mut chroma = frames(key("C major"), 10.0, 1.0);
        chroma.extend(frames(key("A minor"), 10.0, 1.0));
        let estimator = estimator();
        let (_, global_score, _) = estimator.templates.correlate(&sum_profile(&chroma)).best_two();

        let votes = estimator.window_votes(&chroma, FRAME_RATE, AnalysisMode::ShortClip);
        assert!(votes.len() >= 5);
        let strongest = strongest_vote(&votes).unwrap();

        let estimate = estimator.estimate(&chroma, FRAME_RATE, AnalysisMode::ShortClip);
        assert_eq!(estimate.key(), strongest.key());
        assert!(estimate.matches_label("C major") || estimate.matches_label("A minor"));
        assert!(estimate.confidence > 0.95, "{}", estimate.confidence);
        assert!(estimate.confidence > global_score);
        assert!(!estimate.low_confidence);
    }

    #[test]
    fn test_strongest_vote_prefers_earliest_on_ties() {
        let vote = |root: u8, strength: f32| KeyWindowVote {
            root: PitchClass::new(root),
            mode: Mode::Major,
            strength,
            score: 0.9,
        };
        let votes = [vote(0, 0.2), vote(7, 0.4), vote(2, 0.4), vote(5, 0.1)];
        assert_eq!(strongest_vote(&votes).map(|v| v.root), Some(PitchClass::new(7)));
        assert!(strongest_vote(&[]).is_none());
    }

    #[test]
    fn test_flat_or_empty_chroma_is_undetermined() {
        for chroma in [vec![], vec![[0.3f32; 12]; 50], vec![[0.0f32; 12]; 50]] {
            let estimate = estimator().estimate(&chroma, FRAME_RATE, AnalysisMode::FullSong);
            assert_eq!(estimate, KeyEstimate::undetermined());
        }
    }

    #[test]
    fn test_mode_rescue_follows_dominant_third() {
        let mut profile = [0.1f32; 12];
        profile[0] = 1.0;
        profile[3] = 0.8;
        profile[4] = 0.4;
        let c_major = key("C major");
        assert_eq!(estimator().rescue_mode(c_major, &profile), key("C minor"));

        profile[4] = 0.75;
        assert_eq!(estimator().rescue_mode(c_major, &profile), c_major);
    }

    #[test]
    fn test_window_layout() {
        let estimator = estimator();
        // Full songs: 6 s windows, 3 s hop
        assert_eq!(estimator.window_layout(1200, FRAME_RATE, AnalysisMode::FullSong), (60, 30));
        // Short clips scale with duration
        assert_eq!(estimator.window_layout(200, FRAME_RATE, AnalysisMode::ShortClip), (40, 20));
        // Tiny inputs still produce the minimum number of windows
        let (window, hop) = estimator.window_layout(12, FRAME_RATE, AnalysisMode::FullSong);
        assert!((12 - window) / hop + 1 >= 5, "window {} hop {}", window, hop);
    }

    #[test]
    fn test_estimate_compares_enharmonically() {
        let estimate = KeyEstimate::new(key("D# minor"), 0.8, false);
        assert!(estimate.matches_label("Eb minor"));
        assert!(!estimate.matches_label("Eb major"));
        assert_eq!(estimate.to_string(), "D# minor (0.80)");
    }
}
