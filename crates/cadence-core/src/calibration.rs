//! Calibration layer
//!
//! Corpus-learned corrections applied after estimation. Rules were fitted on
//! full-length tracks, so anything analysed in short clip mode passes through
//! untouched: applied to previews they collapse diverse keys onto one value.
//!
//! Three rule families, applied in order:
//! - BPM rules: priority-ordered predicates, the first match rewrites the tempo
//! - Key rules: per-key confusion distributions that re-vote the raw key
//! - Linear scalers: `value * slope + intercept`, clamped
//!
//! The set is loaded once from JSON, shared through an `Arc` and never
//! mutated afterwards.
//!
//! ```json
//! {
//!   "version": "2024-11",
//!   "bpm_rules": [
//!     { "name": "fast-halved", "priority": 10,
//!       "conditions": { "bpm_range": [60, 90], "energy_range": [0.6, 1.0] },
//!       "action": { "type": "multiply", "factor": 2.0 } }
//!   ],
//!   "key_rules": {
//!     "raw_accuracy": 0.55,
//!     "confidence_bins": [{ "min": 0.0, "max": 0.5, "accuracy": 0.4 }],
//!     "keys": [{ "key": "A minor", "targets": [{ "key": "C major", "probability": 0.3 }] }]
//!   },
//!   "scalers": { "energy": { "slope": 0.9, "intercept": 0.05 } }
//! }
//! ```

use crate::config::AnalysisConfig;
use crate::key::Key;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest tempo change a linear scaler may make (BPM)
const MAX_SCALER_BPM_CHANGE: f64 = 10.0;

/// Immutable rule set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSet {
    /// Free-form version tag, logged at load
    pub version: Option<String>,
    pub bpm_rules: Vec<BpmRule>,
    pub key_rules: Option<KeyCalibration>,
    pub scalers: ScalerSet,
}

/// Tempo correction with its match conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BpmRule {
    pub name: String,
    /// Higher runs first; equal priorities keep file order
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: BpmConditions,
    pub action: BpmAction,
}

/// All present conditions must hold
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BpmConditions {
    pub bpm_range: Option<[f64; 2]>,
    pub energy_range: Option<[f32; 2]>,
    pub duration_max: Option<f64>,
    pub confidence_min: Option<f32>,
    /// Case-insensitive; a rule with genres never matches an unknown genre
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BpmAction {
    Multiply { factor: f64 },
    Set { bpm: f64 },
}

impl BpmAction {
    fn apply(&self, bpm: f64) -> f64 {
        match *self {
            BpmAction::Multiply { factor } => bpm * factor,
            BpmAction::Set { bpm } => bpm,
        }
    }
}

/// Key confusion model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyCalibration {
    /// Accuracy of uncalibrated keys, used when no confidence bin matches
    pub raw_accuracy: f32,
    pub confidence_bins: Vec<ConfidenceBin>,
    /// At most one entry per raw key
    pub keys: Vec<KeyRule>,
}

/// Observed accuracy for raw confidences in `min..max`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBin {
    pub min: f32,
    pub max: f32,
    pub accuracy: f32,
}

/// Where a raw key actually lands, by probability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRule {
    pub key: Key,
    #[serde(default)]
    pub genres: Vec<String>,
    pub targets: Vec<KeyTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyTarget {
    pub key: Key,
    pub probability: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerSet {
    pub bpm: Option<LinearScaler>,
    pub bpm_confidence: Option<LinearScaler>,
    pub energy: Option<LinearScaler>,
    pub key_confidence: Option<LinearScaler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearScaler {
    pub slope: f64,
    pub intercept: f64,
    #[serde(default)]
    pub clamp: Option<ScalerClamp>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerClamp {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl LinearScaler {
    pub fn scale(&self, value: f64) -> f64 {
        let mut scaled = value * self.slope + self.intercept;
        if let Some(clamp) = self.clamp {
            if let Some(min) = clamp.min {
                scaled = scaled.max(min);
            }
            if let Some(max) = clamp.max {
                scaled = scaled.min(max);
            }
        }
        scaled
    }
}

/// The values calibration may rewrite
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimates {
    pub bpm: f64,
    pub bpm_confidence: f32,
    pub key: Key,
    pub key_confidence: f32,
    pub energy: f32,
}

/// Facts about the signal that rules may condition on
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrationContext<'a> {
    pub duration: f64,
    pub genre: Option<&'a str>,
    /// Key confidence may not be raised above this (modulating tracks)
    pub key_confidence_cap: Option<f32>,
}

/// What calibration did to one result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTrace {
    /// Calibration was skipped (short clip or disabled)
    pub bypassed: bool,
    /// Names of the corrections that changed a value, in application order
    pub applied: Vec<String>,
}

impl CalibrationSet {
    /// Load and sort a rule set from JSON
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read calibration file {:?}", path))?;
        let set: CalibrationSet = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse calibration file {:?}", path))?;
        let set = set.prepared();
        log::info!(
            "load: calibration {} from {:?} ({} BPM rules, {} key rules)",
            set.version.as_deref().unwrap_or("unversioned"),
            path,
            set.bpm_rules.len(),
            set.key_rules.as_ref().map_or(0, |k| k.keys.len())
        );
        Ok(set)
    }

    /// Load from the configured path, running uncalibrated on any problem
    pub fn load_or_empty(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            log::info!("load_or_empty: no calibration file configured, using raw estimates");
            return Self::default();
        };
        match Self::load(path) {
            Ok(set) => set,
            Err(e) => {
                log::warn!("load_or_empty: {:#}, using raw estimates", e);
                Self::default()
            }
        }
    }

    /// Drop disabled rules and order the rest by priority, highest first
    pub fn prepared(mut self) -> Self {
        self.bpm_rules.retain(|rule| rule.enabled);
        self.bpm_rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        if let Some(key_rules) = self.key_rules.as_mut() {
            for rule in &mut key_rules.keys {
                rule.targets.retain(|t| t.probability.is_finite() && t.probability > 0.0);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bpm_rules.is_empty() && self.key_rules.is_none() && self.scalers == ScalerSet::default()
    }

    /// Apply every matching correction
    ///
    /// Signals analysed as short clips, or any signal when calibration is
    /// disabled, come back unchanged. An undetermined tempo (0 BPM) or key
    /// (zero confidence) is never rewritten.
    pub fn apply(
        &self,
        raw: &Estimates,
        context: &CalibrationContext<'_>,
        config: &AnalysisConfig,
    ) -> (Estimates, CalibrationTrace) {
        let mode = config.mode_for(context.duration);
        if !config.calibration.enabled || mode.is_short() {
            log::debug!(
                "apply: skipping calibration for {:.1}s signal ({})",
                context.duration,
                if config.calibration.enabled { "short clip" } else { "disabled" }
            );
            return (
                *raw,
                CalibrationTrace {
                    bypassed: true,
                    applied: Vec::new(),
                },
            );
        }

        let mut out = *raw;
        let mut applied = Vec::new();

        let tempo_known = raw.bpm > 0.0;
        let key_known = raw.key_confidence > 0.0;

        if let Some(rule) = self.matching_bpm_rule(&out, context).filter(|_| tempo_known) {
            let bpm = rule.action.apply(out.bpm);
            log::info!("apply: BPM rule '{}' {:.1} -> {:.1}", rule.name, out.bpm, bpm);
            out.bpm = bpm;
            applied.push(rule.name.clone());
        }

        if let Some(key_rules) = self.key_rules.as_ref().filter(|_| key_known) {
            if let Some((key, confidence)) = key_rules.revote(out.key, out.key_confidence, context.genre) {
                log::debug!(
                    "apply: key {} ({:.2}) -> {} ({:.2})",
                    out.key,
                    out.key_confidence,
                    key,
                    confidence
                );
                applied.push(format!("key:{}", out.key));
                out.key = key;
                out.key_confidence = confidence;
            }
        }

        self.apply_scalers(&mut out, tempo_known, key_known, &mut applied);

        if let Some(cap) = context.key_confidence_cap {
            out.key_confidence = out.key_confidence.min(cap);
        }

        (
            out,
            CalibrationTrace {
                bypassed: false,
                applied,
            },
        )
    }

    fn matching_bpm_rule(&self, values: &Estimates, context: &CalibrationContext<'_>) -> Option<&BpmRule> {
        self.bpm_rules
            .iter()
            .find(|rule| rule.conditions.matches(values, context))
    }

    fn apply_scalers(&self, out: &mut Estimates, tempo_known: bool, key_known: bool, applied: &mut Vec<String>) {
        if let Some(scaler) = self.scalers.bpm.as_ref().filter(|_| tempo_known) {
            let scaled = scaler.scale(out.bpm);
            if (scaled - out.bpm).abs() > MAX_SCALER_BPM_CHANGE {
                log::info!(
                    "apply_scalers: skipping BPM scaler {:.1} -> {:.1} (more than {} BPM)",
                    out.bpm,
                    scaled,
                    MAX_SCALER_BPM_CHANGE
                );
            } else {
                out.bpm = scaled;
                applied.push("scaler:bpm".to_string());
            }
        }

        let unit_scalers = [
            ("bpm_confidence", &self.scalers.bpm_confidence, &mut out.bpm_confidence),
            ("energy", &self.scalers.energy, &mut out.energy),
            ("key_confidence", &self.scalers.key_confidence, &mut out.key_confidence),
        ];
        for (name, scaler, value) in unit_scalers {
            if name == "key_confidence" && !key_known {
                continue;
            }
            if let Some(scaler) = scaler {
                *value = (scaler.scale(*value as f64) as f32).clamp(0.0, 1.0);
                applied.push(format!("scaler:{}", name));
            }
        }
    }
}

impl BpmConditions {
    fn matches(&self, values: &Estimates, context: &CalibrationContext<'_>) -> bool {
        if let Some([lo, hi]) = self.bpm_range {
            if !(lo..=hi).contains(&values.bpm) {
                return false;
            }
        }
        if let Some([lo, hi]) = self.energy_range {
            if !(lo..=hi).contains(&values.energy) {
                return false;
            }
        }
        if let Some(max) = self.duration_max {
            if context.duration > max {
                return false;
            }
        }
        if let Some(min) = self.confidence_min {
            if values.bpm_confidence < min {
                return false;
            }
        }
        genre_allowed(&self.genres, context.genre)
    }
}

impl KeyCalibration {
    /// Re-vote a raw key through its confusion distribution
    ///
    /// `None` when no rule covers the raw key. `confidence` must be positive.
    fn revote(&self, raw: Key, confidence: f32, genre: Option<&str>) -> Option<(Key, f32)> {
        let rule = self
            .keys
            .iter()
            .find(|rule| rule.key == raw && genre_allowed(&rule.genres, genre))?;

        let weight = confidence.min(1.0);
        let mut votes = [0.0f32; 24];
        let mut assigned = 0.0f32;
        for target in &rule.targets {
            votes[target.key.template_index()] += weight * target.probability;
            assigned += target.probability;
        }
        let residual = (1.0 - assigned).max(0.0);
        votes[raw.template_index()] += weight * residual;

        let total: f32 = votes.iter().sum();
        if total <= 0.0 {
            return None;
        }
        // Ties go to the lower template index, majors before minors
        let (winner, best) = votes
            .iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        let posterior = best / total;

        let accuracy = self.bin_accuracy(confidence).unwrap_or(self.raw_accuracy);
        let calibrated = confidence.max(accuracy).max(posterior).clamp(0.0, 1.0);
        Some((Key::from_template_index(winner), calibrated))
    }

    fn bin_accuracy(&self, confidence: f32) -> Option<f32> {
        self.confidence_bins
            .iter()
            .find(|bin| bin.min <= confidence && confidence < bin.max)
            .map(|bin| bin.accuracy)
    }
}

fn genre_allowed(genres: &[String], genre: Option<&str>) -> bool {
    if genres.is_empty() {
        return true;
    }
    genre.map_or(false, |g| genres.iter().any(|allowed| allowed.eq_ignore_ascii_case(g)))
}

fn default_true() -> bool {
    true
}
