//! Analysis configuration
//!
//! Configuration is stored as YAML and loaded once at process start. The
//! resulting [`AnalysisConfig`] is wrapped in an `Arc` and passed to every
//! analysis call; nothing mutates it afterwards.
//!
//! Default location: ~/.config/cadence/config.yaml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Signals shorter than this are analysed as short clips (seconds)
    pub short_clip_threshold_seconds: f64,
    /// Feature extraction settings
    pub features: FeatureConfig,
    /// Tempo estimation settings
    pub tempo: TempoConfig,
    /// Key estimation settings
    pub key: KeyConfig,
    /// Calibration rule loading
    pub calibration: CalibrationConfig,
    /// Worker pool and chunk budget settings
    pub orchestrator: OrchestratorConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            short_clip_threshold_seconds: 45.0,
            features: FeatureConfig::default(),
            tempo: TempoConfig::default(),
            key: KeyConfig::default(),
            calibration: CalibrationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl AnalysisConfig {
    /// Validate and clamp every section
    pub fn validate(&mut self) {
        if !self.short_clip_threshold_seconds.is_finite() {
            self.short_clip_threshold_seconds = 45.0;
        }
        self.short_clip_threshold_seconds = self.short_clip_threshold_seconds.clamp(5.0, 600.0);
        self.features.validate();
        self.tempo.validate();
        self.key.validate();
        self.orchestrator.validate();
    }

    /// Estimator mode for a signal of the given duration
    pub fn mode_for(&self, duration_seconds: f64) -> AnalysisMode {
        if duration_seconds < self.short_clip_threshold_seconds {
            AnalysisMode::ShortClip
        } else {
            AnalysisMode::FullSong
        }
    }
}

/// Estimator mode, chosen from signal duration
///
/// Short clips get proportionally smaller windows, no octave validation,
/// no key consensus and no calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    ShortClip,
    FullSong,
}

impl AnalysisMode {
    pub fn display_name(&self) -> &'static str {
        match self {
            AnalysisMode::ShortClip => "short clip",
            AnalysisMode::FullSong => "full song",
        }
    }

    pub fn is_short(&self) -> bool {
        matches!(self, AnalysisMode::ShortClip)
    }
}

impl std::fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Feature extraction configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Analysis sample rate; input is resampled to this rate
    pub sample_rate: u32,
    /// STFT frame length in samples (power of two)
    pub frame_size: usize,
    /// STFT hop length in samples
    pub hop_size: usize,
    /// Lowest frequency mapped into chroma bins (Hz)
    pub chroma_min_hz: f32,
    /// Highest frequency mapped into chroma bins (Hz)
    pub chroma_max_hz: f32,
    /// Upper edge of the low band feeding the beat-strength curve (Hz)
    pub beat_band_max_hz: f32,
    /// Peak amplitude below which a signal counts as silent
    pub silence_peak: f32,
    /// Shortest signal accepted for analysis (seconds)
    pub min_signal_seconds: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            frame_size: 2048,
            hop_size: 512,
            chroma_min_hz: 65.0,
            chroma_max_hz: 2000.0,
            beat_band_max_hz: 200.0,
            silence_peak: 1e-4,
            min_signal_seconds: 0.1,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&mut self) {
        self.sample_rate = self.sample_rate.clamp(8000, 96000);
        self.frame_size = self.frame_size.clamp(256, 16384).next_power_of_two();
        self.hop_size = self.hop_size.clamp(64, self.frame_size);
        let nyquist = self.sample_rate as f32 / 2.0;
        self.chroma_min_hz = self.chroma_min_hz.clamp(20.0, nyquist / 2.0);
        self.chroma_max_hz = self.chroma_max_hz.clamp(self.chroma_min_hz * 2.0, nyquist);
        self.beat_band_max_hz = self.beat_band_max_hz.clamp(60.0, nyquist);
        self.silence_peak = self.silence_peak.clamp(0.0, 0.1);
        self.min_signal_seconds = self.min_signal_seconds.clamp(0.0, 10.0);
    }

    /// Feature frames per second
    pub fn frame_rate(&self) -> f64 {
        self.sample_rate as f64 / self.hop_size as f64
    }
}

/// Tempo estimation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    /// Slowest tempo any candidate may take
    pub min_bpm: f64,
    /// Fastest tempo any candidate may take
    pub max_bpm: f64,
    /// Ratios used to derive alias candidates from each detection
    pub alias_factors: Vec<f64>,
    /// Score multiplier applied to alias candidates (0.5..0.99)
    pub alias_discount: f32,
    /// Aliases scoring below this are dropped
    pub alias_min_score: f32,
    /// Beat and onset detections closer than this are merged (BPM)
    pub agreement_tolerance_bpm: f64,
    /// Minimum lead over the runner-up for a confident selection
    pub confidence_epsilon: f32,
    /// Confidence ceiling applied to low-confidence selections
    pub low_confidence_ceiling: f32,
    /// Tempo band treated as a possible slow ballad
    pub slow_ballad_bpm_range: [f64; 2],
    /// Loudness below which a slow candidate is kept undoubled
    pub slow_ballad_energy_ceiling: f32,
    /// A doubled ballad tempo must reach this to count as a plausible alternative
    pub ballad_double_floor_bpm: f64,
    /// Short clip analysis window as a fraction of the clip
    pub short_window_fraction: f64,
    /// Cap on the short clip analysis window (seconds)
    pub short_window_cap_seconds: f64,
    /// Full song analysis window (seconds)
    pub full_window_seconds: f64,
    /// Ratio an octave alternative must beat the current tempo by during validation
    pub validation_improvement: f32,
    /// Slow tempos that may really be a non-octave multiple when the mix is loud
    pub intermediate_bpm_range: [f64; 2],
    /// Loudness above which the intermediate correction is tried
    pub intermediate_energy_floor: f32,
    /// Ratios tried by the intermediate correction
    pub intermediate_factors: Vec<f64>,
    /// Onset separation ratio an intermediate alternative must beat
    pub intermediate_improvement: f32,
    /// Short clip tempos re-checked against 3:2 multiples
    pub mid_tempo_bpm_range: [f64; 2],
    /// Ratios tried by the mid-tempo check
    pub mid_tempo_factors: Vec<f64>,
    /// Fastest tempo the mid-tempo check may produce
    pub mid_tempo_max_bpm: f64,
    /// Weighted separation ratio a mid-tempo alternative must beat
    pub mid_tempo_improvement: f32,
    /// Estimates at least this confident skip the mid-tempo check
    pub mid_tempo_confidence_skip: f32,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            min_bpm: 40.0,
            max_bpm: 220.0,
            alias_factors: vec![0.5, 0.75, 1.25, 1.5, 2.0],
            alias_discount: 0.80,
            alias_min_score: 0.50,
            agreement_tolerance_bpm: 2.0,
            confidence_epsilon: 0.07,
            low_confidence_ceiling: 0.5,
            slow_ballad_bpm_range: [60.0, 85.0],
            slow_ballad_energy_ceiling: 0.70,
            ballad_double_floor_bpm: 105.0,
            short_window_fraction: 0.8,
            short_window_cap_seconds: 30.0,
            full_window_seconds: 60.0,
            validation_improvement: 1.10,
            intermediate_bpm_range: [70.0, 80.0],
            intermediate_energy_floor: 0.65,
            intermediate_factors: vec![1.2, 1.25],
            intermediate_improvement: 1.50,
            mid_tempo_bpm_range: [85.0, 110.0],
            mid_tempo_factors: vec![1.5, 1.55],
            mid_tempo_max_bpm: 152.0,
            mid_tempo_improvement: 1.20,
            mid_tempo_confidence_skip: 0.90,
        }
    }
}

impl TempoConfig {
    pub fn validate(&mut self) {
        self.min_bpm = self.min_bpm.clamp(20.0, 120.0);
        self.max_bpm = self.max_bpm.clamp(120.0, 320.0);
        if self.max_bpm < self.min_bpm * 2.0 {
            self.max_bpm = (self.min_bpm * 2.0).min(320.0);
        }

        self.alias_factors.retain(|f| f.is_finite() && *f > 0.0 && (*f - 1.0).abs() > 1e-6);
        self.alias_factors.sort_by(|a, b| a.total_cmp(b));
        self.alias_factors.dedup_by(|a, b| (*a - *b).abs() < 1e-6);

        self.alias_discount = self.alias_discount.clamp(0.5, 0.99);
        self.alias_min_score = self.alias_min_score.clamp(0.0, 1.0);
        self.agreement_tolerance_bpm = self.agreement_tolerance_bpm.clamp(0.1, 10.0);
        self.confidence_epsilon = self.confidence_epsilon.clamp(0.01, 0.5);
        self.low_confidence_ceiling = self.low_confidence_ceiling.clamp(0.0, 1.0);

        self.slow_ballad_bpm_range = ordered(self.slow_ballad_bpm_range);
        self.slow_ballad_energy_ceiling = self.slow_ballad_energy_ceiling.clamp(0.0, 1.0);

        self.short_window_fraction = self.short_window_fraction.clamp(0.1, 1.0);
        self.short_window_cap_seconds = self.short_window_cap_seconds.clamp(5.0, 120.0);
        self.full_window_seconds = self.full_window_seconds.clamp(10.0, 600.0);
        self.validation_improvement = self.validation_improvement.clamp(1.0, 2.0);

        self.intermediate_bpm_range = ordered(self.intermediate_bpm_range);
        self.intermediate_energy_floor = self.intermediate_energy_floor.clamp(0.0, 1.0);
        self.intermediate_factors.retain(|f| f.is_finite() && *f > 1.0);
        self.intermediate_improvement = self.intermediate_improvement.clamp(1.0, 4.0);
        self.mid_tempo_bpm_range = ordered(self.mid_tempo_bpm_range);
        self.mid_tempo_factors.retain(|f| f.is_finite() && *f > 1.0);
        self.mid_tempo_max_bpm = self.mid_tempo_max_bpm.clamp(self.min_bpm, self.max_bpm);
        self.mid_tempo_improvement = self.mid_tempo_improvement.clamp(1.0, 4.0);
        self.mid_tempo_confidence_skip = self.mid_tempo_confidence_skip.clamp(0.0, 1.0);
    }

    /// Analysis window length for a signal of the given duration
    pub fn window_seconds(&self, mode: AnalysisMode, duration: f64) -> f64 {
        match mode {
            AnalysisMode::ShortClip => {
                (duration * self.short_window_fraction).min(self.short_window_cap_seconds)
            }
            AnalysisMode::FullSong => self.full_window_seconds.min(duration),
        }
    }
}

fn ordered([lo, hi]: [f64; 2]) -> [f64; 2] {
    if lo <= hi {
        [lo, hi]
    } else {
        [hi, lo]
    }
}

/// Key estimation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Weight repeated window votes for full songs (never used for short clips)
    pub consensus_enabled: bool,
    /// Full song vote window (seconds)
    pub window_seconds: f64,
    /// Full song vote hop (seconds)
    pub hop_seconds: f64,
    /// Minimum number of vote windows, even for very short clips
    pub min_windows: usize,
    /// Confidence below which a short clip key is flagged
    pub short_confidence_threshold: f32,
    /// Confidence below which a full song key is flagged
    pub full_confidence_threshold: f32,
    /// Weight added to each vote so zero-margin votes still count
    pub vote_floor: f32,
    /// Third energy ratio required to flip the mode of an uncertain estimate
    pub mode_rescue_ratio: f32,
    /// Chunk key spread above which the track is reported as modulating (semitones)
    pub modulation_dispersion_semitones: f32,
    /// Key confidence cap applied to modulating tracks
    pub modulation_confidence_cap: f32,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            consensus_enabled: true,
            window_seconds: 6.0,
            hop_seconds: 3.0,
            min_windows: 5,
            short_confidence_threshold: 0.60,
            full_confidence_threshold: 0.75,
            vote_floor: 0.05,
            mode_rescue_ratio: 1.15,
            modulation_dispersion_semitones: 3.0,
            modulation_confidence_cap: 0.45,
        }
    }
}

impl KeyConfig {
    pub fn validate(&mut self) {
        self.window_seconds = self.window_seconds.clamp(1.0, 30.0);
        self.hop_seconds = self.hop_seconds.clamp(0.5, self.window_seconds);
        self.min_windows = self.min_windows.clamp(1, 32);
        self.short_confidence_threshold = self.short_confidence_threshold.clamp(0.0, 1.0);
        self.full_confidence_threshold = self.full_confidence_threshold.clamp(0.0, 1.0);
        self.vote_floor = self.vote_floor.clamp(0.0, 1.0);
        self.mode_rescue_ratio = self.mode_rescue_ratio.clamp(1.0, 4.0);
        self.modulation_dispersion_semitones = self.modulation_dispersion_semitones.clamp(0.5, 6.0);
        self.modulation_confidence_cap = self.modulation_confidence_cap.clamp(0.0, 1.0);
    }

    /// Whether window consensus applies in the given mode
    pub fn consensus_for(&self, mode: AnalysisMode) -> bool {
        match mode {
            AnalysisMode::ShortClip => false,
            AnalysisMode::FullSong => self.consensus_enabled,
        }
    }

    pub fn confidence_threshold(&self, mode: AnalysisMode) -> f32 {
        match mode {
            AnalysisMode::ShortClip => self.short_confidence_threshold,
            AnalysisMode::FullSong => self.full_confidence_threshold,
        }
    }
}

/// Calibration rule loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Apply calibration to full songs
    pub enabled: bool,
    /// JSON rule set; `None` runs uncalibrated
    pub rules_path: Option<PathBuf>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules_path: None,
        }
    }
}

/// How pool workers isolate the jobs they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerIsolation {
    /// Each job runs in a fresh worker process (requires `procspawn::init()` in main)
    #[default]
    Process,
    /// Jobs run on the pool's threads inside this process
    Thread,
}

/// Worker pool and chunk budget configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of jobs analysed concurrently (fixed at startup)
    pub pool_size: usize,
    /// Jobs that may wait in the queue before `submit` blocks
    pub queue_capacity: usize,
    /// Length of one analysis chunk (seconds of audio)
    pub chunk_seconds: f64,
    /// Wall-clock budget for one chunk (seconds, 0 disables the timer)
    pub chunk_timeout_seconds: f64,
    /// Consecutive over-budget chunks that abort the rest of a job
    pub max_consecutive_slow_chunks: u32,
    /// Process or thread isolation for pool workers
    pub isolation: WorkerIsolation,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 32,
            chunk_seconds: 15.0,
            chunk_timeout_seconds: 30.0,
            max_consecutive_slow_chunks: 2,
            isolation: WorkerIsolation::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&mut self) {
        self.pool_size = self.pool_size.clamp(1, 16);
        self.queue_capacity = self.queue_capacity.clamp(1, 1024);
        self.chunk_seconds = self.chunk_seconds.clamp(1.0, 120.0);
        if !self.chunk_timeout_seconds.is_finite() || self.chunk_timeout_seconds < 0.0 {
            self.chunk_timeout_seconds = 0.0;
        }
        self.max_consecutive_slow_chunks = self.max_consecutive_slow_chunks.clamp(1, 16);
    }

    /// Per-chunk budget, `None` when the timer is disabled
    pub fn chunk_timeout(&self) -> Option<std::time::Duration> {
        (self.chunk_timeout_seconds > 0.0)
            .then(|| std::time::Duration::from_secs_f64(self.chunk_timeout_seconds))
    }
}

/// Get the default config file path
///
/// Returns: ~/.config/cadence/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cadence")
        .join("config.yaml")
}

/// Load configuration from a YAML file
///
/// If the file doesn't exist, returns default config.
/// If the file exists but is invalid, logs a warning and returns default config.
pub fn load_config(path: &Path) -> AnalysisConfig {
    log::info!("load_config: Loading from {:?}", path);

    if !path.exists() {
        log::info!("load_config: Config file doesn't exist, using defaults");
        return AnalysisConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<AnalysisConfig>(&contents) {
            Ok(mut config) => {
                config.validate();
                log::info!(
                    "load_config: Loaded config - short clip threshold {:.0}s, pool size {}, chunk timeout {:.1}s",
                    config.short_clip_threshold_seconds,
                    config.orchestrator.pool_size,
                    config.orchestrator.chunk_timeout_seconds
                );
                config
            }
            Err(e) => {
                log::warn!("load_config: Failed to parse config: {}, using defaults", e);
                AnalysisConfig::default()
            }
        },
        Err(e) => {
            log::warn!("load_config: Failed to read config file: {}, using defaults", e);
            AnalysisConfig::default()
        }
    }
}

/// Save configuration to a YAML file
pub fn save_config(config: &AnalysisConfig, path: &Path) -> Result<()> {
    log::info!("save_config: Saving to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    log::info!("save_config: Config saved successfully");
    Ok(())
}
