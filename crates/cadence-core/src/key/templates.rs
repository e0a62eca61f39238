//! Krumhansl-Kessler key templates
//!
//! 24 tonal profiles (12 major + 12 minor) matched against a chroma profile by
//! Pearson correlation. Templates are stored zero-mean and unit-norm so one
//! dot product per key gives the correlation.

use super::notation::Key;

const KK_MAJOR: [f32; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];
const KK_MINOR: [f32; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

/// Profiles with less variance than this correlate with nothing
const MIN_VARIANCE: f32 = 1e-10;

/// Correlation of one chroma profile with every key
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyScores {
    /// Indexed by [`Key::template_index`]
    pub scores: [f32; 24],
}

impl KeyScores {
    /// Best key, its correlation, and the second-best correlation
    pub fn best_two(&self) -> (Key, f32, f32) {
        let mut best = (0usize, f32::NEG_INFINITY);
        let mut second = f32::NEG_INFINITY;
        for (index, &score) in self.scores.iter().enumerate() {
            if score > best.1 {
                second = best.1;
                best = (index, score);
            } else if score > second {
                second = score;
            }
        }
        (Key::from_template_index(best.0), best.1, second)
    }

    pub fn score(&self, key: Key) -> f32 {
        self.scores[key.template_index()]
    }
}

/// Centred, unit-norm templates for all 24 keys
#[derive(Debug, Clone)]
pub struct KeyTemplates {
    templates: [[f32; 12]; 24],
}

impl KeyTemplates {
    pub fn new() -> Self {
        let major = normalize(&KK_MAJOR).unwrap_or([0.0; 12]);
        let minor = normalize(&KK_MINOR).unwrap_or([0.0; 12]);

        let mut templates = [[0.0f32; 12]; 24];
        for root in 0..12 {
            for degree in 0..12 {
                let pitch_class = (root + degree) % 12;
                templates[root][pitch_class] = major[degree];
                templates[12 + root][pitch_class] = minor[degree];
            }
        }
        Self { templates }
    }

    /// Correlate a chroma profile against every key
    ///
    /// A flat or empty profile scores zero everywhere.
    pub fn correlate(&self, profile: &[f32; 12]) -> KeyScores {
        let mut scores = [0.0f32; 24];
        if let Some(profile) = normalize(profile) {
            for (score, template) in scores.iter_mut().zip(self.templates.iter()) {
                *score = template.iter().zip(profile.iter()).map(|(t, p)| t * p).sum();
            }
        }
        KeyScores { scores }
    }
}

impl Default for KeyTemplates {
    fn default() -> Self {
        Self::new()
    }
}

/// Zero-mean, unit-norm copy; `None` when the profile is flat
fn normalize(profile: &[f32; 12]) -> Option<[f32; 12]> {
    let mean = profile.iter().sum::<f32>() / 12.0;
    let mut centered = [0.0f32; 12];
    for (out, value) in centered.iter_mut().zip(profile.iter()) {
        *out = value - mean;
    }
    let norm = centered.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm * norm < MIN_VARIANCE {
        return None;
    }
    centered.iter_mut().for_each(|v| *v /= norm);
    Some(centered)
}

/// Raw profile rotated onto a key's root
#[cfg(test)]
pub(crate) fn profile_for(key: Key) -> [f32; 12] {
    let base = match key.mode {
        super::notation::Mode::Major => &KK_MAJOR,
        super::notation::Mode::Minor => &KK_MINOR,
    };
    let mut profile = [0.0f32; 12];
    for degree in 0..12 {
        profile[(key.root.index() + degree) % 12] = base[degree];
    }
    profile
}
