//! Key notation
//!
//! Keys are stored as a pitch class index (C = 0) plus a mode. Spelling only
//! matters when talking to the outside world: parsing accepts sharps, flats,
//! unicode accidentals and slash pairs, so "D# minor", "Eb minor", "D♯m" and
//! "D#/Eb min" all name the same key. Display always uses sharps.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const SHARP_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Pitch class 0..11, C = 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PitchClass(u8);

impl PitchClass {
    pub const C: PitchClass = PitchClass(0);

    pub fn new(index: u8) -> Self {
        Self(index % 12)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn name(&self) -> &'static str {
        SHARP_NAMES[self.index()]
    }

    /// Shift by a signed number of semitones
    pub fn transpose(&self, semitones: i32) -> Self {
        Self((self.0 as i32 + semitones).rem_euclid(12) as u8)
    }

    /// Shortest distance around the pitch circle (0..=6)
    pub fn distance(&self, other: PitchClass) -> u8 {
        let d = (self.0 as i32 - other.0 as i32).rem_euclid(12) as u8;
        d.min(12 - d)
    }
}

impl fmt::Display for PitchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Major,
    Minor,
}

impl Mode {
    pub fn display_name(&self) -> &'static str {
        match self {
            Mode::Major => "major",
            Mode::Minor => "minor",
        }
    }

    pub fn opposite(&self) -> Mode {
        match self {
            Mode::Major => Mode::Minor,
            Mode::Minor => Mode::Major,
        }
    }
}

/// Canonical key: pitch class plus mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Key {
    pub root: PitchClass,
    pub mode: Mode,
}

impl Key {
    pub fn new(root: PitchClass, mode: Mode) -> Self {
        Self { root, mode }
    }

    /// Index into the 24 key templates: majors 0..12, minors 12..24
    pub fn template_index(&self) -> usize {
        match self.mode {
            Mode::Major => self.root.index(),
            Mode::Minor => 12 + self.root.index(),
        }
    }

    pub fn from_template_index(index: usize) -> Self {
        let mode = if index < 12 { Mode::Major } else { Mode::Minor };
        Self::new(PitchClass::new((index % 12) as u8), mode)
    }

    /// Enharmonic comparison against an external label
    ///
    /// Unparseable labels never match.
    pub fn matches_label(&self, label: &str) -> bool {
        label.parse::<Key>().map_or(false, |other| other == *self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.root, self.mode.display_name())
    }
}

/// Keys travel as labels ("D# minor") in rule files
impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        label.parse().map_err(serde::de::Error::custom)
    }
}

/// Label that could not be read as a key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unrecognised key label: {0:?}")]
pub struct KeyParseError(pub String);

impl FromStr for Key {
    type Err = KeyParseError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        let fail = || KeyParseError(label.to_string());
        let text = label.trim();
        let mut chars = text.char_indices().peekable();

        let natural: i32 = match chars.next().map(|(_, c)| c.to_ascii_uppercase()) {
            Some('C') => 0,
            Some('D') => 2,
            Some('E') => 4,
            Some('F') => 5,
            Some('G') => 7,
            Some('A') => 9,
            Some('B') => 11,
            _ => return Err(fail()),
        };

        let mut shift = 0i32;
        while let Some(&(_, c)) = chars.peek() {
            match c {
                '#' | '♯' => shift += 1,
                'b' | '♭' => shift -= 1,
                _ => break,
            }
            chars.next();
        }

        let rest_start = chars.peek().map_or(text.len(), |&(i, _)| i);
        let mut rest = &text[rest_start..];

        // "D#/Eb minor": the alternate spelling adds nothing
        if let Some(stripped) = rest.strip_prefix('/') {
            let end = stripped
                .find(|c: char| c.is_whitespace())
                .unwrap_or(stripped.len());
            let alternate = &stripped[..end];
            let alternate_len = alternate
                .char_indices()
                .take_while(|&(i, c)| {
                    (i == 0 && c.is_ascii_alphabetic()) || matches!(c, '#' | '♯' | 'b' | '♭')
                })
                .map(|(i, c)| i + c.len_utf8())
                .last()
                .unwrap_or(0);
            rest = &stripped[alternate_len..];
        }

        let mode_token = rest.trim();
        let mode = match mode_token {
            "" | "M" => Mode::Major,
            "m" => Mode::Minor,
            other => match other.to_ascii_lowercase().as_str() {
                "maj" | "major" => Mode::Major,
                "min" | "minor" => Mode::Minor,
                _ => return Err(fail()),
            },
        };

        Ok(Key::new(PitchClass::new((natural + shift).rem_euclid(12) as u8), mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(label: &str) -> Key {
        label.parse().unwrap()
    }

    #[test]
    fn test_enharmonic_spellings_compare_equal() {
        let d_sharp_minor = Key::new(PitchClass::new(3), Mode::Minor);
        assert!(d_sharp_minor.matches_label("Eb minor"));
        assert!(d_sharp_minor.matches_label("D# minor"));
        assert!(d_sharp_minor.matches_label("D♯m"));
        assert!(d_sharp_minor.matches_label("E♭ min"));
        assert!(d_sharp_minor.matches_label("D#/Eb minor"));
        assert!(!d_sharp_minor.matches_label("Eb major"));
        assert!(!d_sharp_minor.matches_label("E minor"));
        assert!(!d_sharp_minor.matches_label("not a key"));
    }

    #[test]
    fn test_parse_mode_spellings() {
        assert_eq!(key("A").mode, Mode::Major);
        assert_eq!(key("Am").mode, Mode::Minor);
        assert_eq!(key("AM").mode, Mode::Major);
        assert_eq!(key("a minor"), key("A min"));
        assert_eq!(key("Bb"), Key::new(PitchClass::new(10), Mode::Major));
        assert_eq!(key("Ebm"), Key::new(PitchClass::new(3), Mode::Minor));
        assert_eq!(key("Cb major"), Key::new(PitchClass::new(11), Mode::Major));
        assert_eq!(key("B# Major"), key("C major"));
        assert!("H minor".parse::<Key>().is_err());
        assert!("C dorian".parse::<Key>().is_err());
    }

    #[test]
    fn test_display_uses_sharps() {
        assert_eq!(key("Eb minor").to_string(), "D# minor");
        assert_eq!(key("Gb").to_string(), "F# major");
    }

    #[test]
    fn test_template_index_roundtrip() {
        for index in 0..24 {
            assert_eq!(Key::from_template_index(index).template_index(), index);
        }
        assert_eq!(key("A minor").template_index(), 21);
    }

    #[test]
    fn test_key_serializes_as_label() {
        let json = serde_json::to_string(&key("Eb minor")).unwrap();
        assert_eq!(json, "\"D# minor\"");
        let parsed: Key = serde_json::from_str("\"Bbm\"").unwrap();
        assert_eq!(parsed, key("A# minor"));
        assert!(serde_json::from_str::<Key>("\"X major\"").is_err());
    }

    #[test]
    fn test_pitch_class_distance() {
        assert_eq!(PitchClass::new(0).distance(PitchClass::new(7)), 5);
        assert_eq!(PitchClass::new(11).distance(PitchClass::new(1)), 2);
        assert_eq!(PitchClass::new(2).transpose(-3), PitchClass::new(11));
    }
}
