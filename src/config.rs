//! Configuration loading and validation.
//!
//! The config is read once at startup from TOML, validated, and then shared
//! as an immutable snapshot. Reconfiguration requires a restart. Validation
//! failures are fatal: the process exits non-zero with a single structured
//! log event.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::defaults;
use crate::error::{FocusFieldError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub audio: AudioConfig,
    pub doa: DoaConfig,
    pub fusion: FusionConfig,
    pub lock: LockConfig,
    pub beamform: BeamformConfig,
    pub bus: BusConfig,
    pub health: HealthConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
    pub sink: SinkConfig,
}

/// Capture-contract parameters: what `audio.frames` is expected to carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    pub sample_rate_hz: u32,
    pub block_samples: usize,
    pub channels: usize,
    /// Mic positions in meters, in the array plane, one [x, y] per channel.
    pub mic_positions_m: Vec<[f32; 2]>,
    pub speed_of_sound_mps: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: defaults::SAMPLE_RATE_HZ,
            block_samples: defaults::BLOCK_SAMPLES,
            channels: 4,
            // 4-mic linear array, 4cm spacing, centered on the origin.
            mic_positions_m: vec![[-0.06, 0.0], [-0.02, 0.0], [0.02, 0.0], [0.06, 0.0]],
            speed_of_sound_mps: defaults::SPEED_OF_SOUND_MPS,
        }
    }
}

/// SRP-PHAT estimator parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DoaConfig {
    pub bin_size_deg: f32,
    pub update_hz: f32,
    pub freq_band_hz: [f32; 2],
    pub smoothing_alpha: f32,
    pub top_k_peaks: usize,
    pub gate_on_vad: bool,
    /// Confidence multiplier while VAD reports no speech.
    pub vad_downweight: f32,
}

impl Default for DoaConfig {
    fn default() -> Self {
        Self {
            bin_size_deg: defaults::DOA_BIN_SIZE_DEG,
            update_hz: defaults::DOA_UPDATE_HZ,
            freq_band_hz: defaults::DOA_FREQ_BAND_HZ,
            smoothing_alpha: defaults::DOA_SMOOTHING_ALPHA,
            top_k_peaks: defaults::DOA_TOP_K_PEAKS,
            gate_on_vad: true,
            vad_downweight: defaults::DOA_VAD_DOWNWEIGHT,
        }
    }
}

/// Association score weights. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AssocWeights {
    pub mouth: f32,
    pub face: f32,
    pub doa: f32,
}

impl Default for AssocWeights {
    fn default() -> Self {
        Self {
            mouth: defaults::ASSOC_WEIGHTS[0],
            face: defaults::ASSOC_WEIGHTS[1],
            doa: defaults::ASSOC_WEIGHTS[2],
        }
    }
}

impl AssocWeights {
    pub fn sum(&self) -> f32 {
        self.mouth + self.face + self.doa
    }
}

/// AV association parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FusionConfig {
    pub max_assoc_deg: f32,
    pub weights: AssocWeights,
    pub require_vad: bool,
    pub faces_max_age_ms: u64,
    pub update_hz: f32,
    /// Bounding-box area at or below which a face detection scores zero.
    pub min_face_area_px: f32,
    /// Bounding-box area at which the face size scale reaches 1.
    pub face_area_soft_max_px: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            max_assoc_deg: defaults::MAX_ASSOC_DEG,
            weights: AssocWeights::default(),
            require_vad: true,
            faces_max_age_ms: defaults::FACES_MAX_AGE_MS,
            update_hz: 10.0,
            min_face_area_px: defaults::MIN_FACE_AREA_PX,
            face_area_soft_max_px: defaults::FACE_AREA_SOFT_MAX_PX,
        }
    }
}

/// Lock state machine thresholds and timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub acquire_threshold: f32,
    pub drop_threshold: f32,
    pub acquire_dwell_ms: u64,
    pub hold_ms: u64,
    pub handoff_min_ms: u64,
    pub handoff_margin: f32,
    pub require_vad: bool,
    /// Mouth-activity level treated as speaking for acquisition.
    pub speaking_on: f32,
    /// EMA factor on the locked bearing; 1.0 disables smoothing.
    pub bearing_smoothing_alpha: f32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_threshold: defaults::LOCK_ACQUIRE_THRESHOLD,
            drop_threshold: defaults::LOCK_DROP_THRESHOLD,
            acquire_dwell_ms: defaults::LOCK_ACQUIRE_DWELL_MS,
            hold_ms: defaults::LOCK_HOLD_MS,
            handoff_min_ms: defaults::LOCK_HANDOFF_MIN_MS,
            handoff_margin: defaults::LOCK_HANDOFF_MARGIN,
            require_vad: true,
            speaking_on: defaults::LOCK_SPEAKING_ON,
            bearing_smoothing_alpha: 1.0,
        }
    }
}

/// Behavior when no fresh lock is available.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoLockBehavior {
    Omni,
    HoldLast,
    Mute,
}

/// Delay-and-sum beamformer parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BeamformConfig {
    pub use_last_lock_ms: u64,
    pub no_lock_behavior: NoLockBehavior,
    pub fade_ms: u64,
}

impl Default for BeamformConfig {
    fn default() -> Self {
        Self {
            use_last_lock_ms: defaults::BEAMFORM_USE_LAST_LOCK_MS,
            no_lock_behavior: NoLockBehavior::Omni,
            fade_ms: defaults::BEAMFORM_FADE_MS,
        }
    }
}

/// Bus queue defaults. Individual subscribers may override both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    pub default_capacity: usize,
    pub overflow_policy: crate::bus::OverflowPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_capacity: defaults::BUS_DEFAULT_CAPACITY,
            overflow_policy: crate::bus::OverflowPolicy::DropNewest,
        }
    }
}

/// Health/perf aggregation parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub emit_hz: f32,
    pub staleness_yellow_ms: u64,
    pub staleness_red_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            emit_hz: defaults::HEALTH_EMIT_HZ,
            staleness_yellow_ms: defaults::STALENESS_YELLOW_MS,
            staleness_red_ms: defaults::STALENESS_RED_MS,
        }
    }
}

/// Runtime scheduling and shutdown parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub heartbeat_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub max_skew_ms: u64,
    /// Base directory for crash dumps and persisted logs.
    pub artifacts_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: defaults::HEARTBEAT_MS,
            shutdown_deadline_ms: defaults::SHUTDOWN_DEADLINE_MS,
            max_skew_ms: defaults::MAX_SKEW_MS,
            artifacts_dir: PathBuf::from("artifacts"),
        }
    }
}

/// File persistence for `log.events`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub file_enabled: bool,
    pub flush_interval_ms: u64,
    /// Rotate events.jsonl when it exceeds this size; 0 disables rotation.
    pub rotate_mb: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_enabled: false,
            flush_interval_ms: 200,
            rotate_mb: 0,
        }
    }
}

/// Output sink capability, a closed set chosen at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    FileSink,
    VirtualMic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// WAV output path for `file_sink`.
    pub file_path: PathBuf,
    /// FIFO path for `virtual_mic`.
    pub fifo_path: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::FileSink,
            file_path: PathBuf::from("enhanced.wav"),
            fifo_path: PathBuf::from("/tmp/focusfield-mic"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields use defaults; unknown keys and invalid TOML are
    /// rejected so a typo never silently reverts a threshold.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FocusFieldError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                FocusFieldError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or fall back to validated defaults when the file
    /// is missing. Invalid TOML still fails.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(FocusFieldError::ConfigFileNotFound { .. }) => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - FOCUSFIELD_ARTIFACTS_DIR -> runtime.artifacts_dir
    /// - FOCUSFIELD_SINK_PATH -> sink.file_path
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("FOCUSFIELD_ARTIFACTS_DIR")
            && !dir.is_empty()
        {
            self.runtime.artifacts_dir = PathBuf::from(dir);
        }

        if let Ok(path) = std::env::var("FOCUSFIELD_SINK_PATH")
            && !path.is_empty()
        {
            self.sink.file_path = PathBuf::from(path);
        }

        self
    }

    /// Get the default configuration file path.
    ///
    /// Returns ~/.config/focusfield/config.toml on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("focusfield")
            .join("config.toml")
    }

    /// Validates ranges and cross-field consistency. Any failure here is
    /// fatal at startup.
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: impl Into<String>) -> FocusFieldError {
            FocusFieldError::ConfigInvalidValue {
                key: key.to_string(),
                message: message.into(),
            }
        }

        if self.audio.sample_rate_hz == 0 {
            return Err(invalid("audio.sample_rate_hz", "must be positive"));
        }
        if self.audio.block_samples == 0 {
            return Err(invalid("audio.block_samples", "must be positive"));
        }
        if self.audio.channels == 0 {
            return Err(invalid("audio.channels", "must be at least 1"));
        }
        if self.audio.mic_positions_m.len() != self.audio.channels {
            return Err(invalid(
                "audio.mic_positions_m",
                format!(
                    "geometry has {} positions but audio.channels is {}",
                    self.audio.mic_positions_m.len(),
                    self.audio.channels
                ),
            ));
        }
        if self.audio.speed_of_sound_mps <= 0.0 {
            return Err(invalid("audio.speed_of_sound_mps", "must be positive"));
        }

        let bin = self.doa.bin_size_deg;
        if !(bin > 0.0) || (360.0 / bin).fract().abs() > 1e-6 {
            return Err(invalid(
                "doa.bin_size_deg",
                "must be positive and divide 360 evenly",
            ));
        }
        if !(self.doa.update_hz > 0.0) {
            return Err(invalid("doa.update_hz", "must be positive"));
        }
        let [f_lo, f_hi] = self.doa.freq_band_hz;
        let nyquist = self.audio.sample_rate_hz as f32 / 2.0;
        if !(0.0 <= f_lo && f_lo < f_hi && f_hi <= nyquist) {
            return Err(invalid(
                "doa.freq_band_hz",
                format!("band must satisfy 0 <= lo < hi <= {nyquist} (nyquist)"),
            ));
        }
        if !(0.0..=1.0).contains(&self.doa.smoothing_alpha) {
            return Err(invalid("doa.smoothing_alpha", "must be within [0, 1]"));
        }
        if self.doa.top_k_peaks == 0 {
            return Err(invalid("doa.top_k_peaks", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.doa.vad_downweight) {
            return Err(invalid("doa.vad_downweight", "must be within [0, 1]"));
        }

        if !(self.fusion.max_assoc_deg > 0.0) {
            return Err(invalid("fusion.max_assoc_deg", "must be positive"));
        }
        let w = &self.fusion.weights;
        if w.mouth < 0.0 || w.face < 0.0 || w.doa < 0.0 {
            return Err(invalid("fusion.weights", "weights must be non-negative"));
        }
        if (w.sum() - 1.0).abs() > 1e-3 {
            return Err(invalid(
                "fusion.weights",
                format!("weights must sum to 1, got {}", w.sum()),
            ));
        }
        if !(self.fusion.update_hz > 0.0) {
            return Err(invalid("fusion.update_hz", "must be positive"));
        }
        if self.fusion.min_face_area_px < 0.0 {
            return Err(invalid("fusion.min_face_area_px", "must be non-negative"));
        }
        if self.fusion.face_area_soft_max_px <= self.fusion.min_face_area_px {
            return Err(invalid(
                "fusion.face_area_soft_max_px",
                "must be above fusion.min_face_area_px",
            ));
        }

        for (key, value) in [
            ("lock.acquire_threshold", self.lock.acquire_threshold),
            ("lock.drop_threshold", self.lock.drop_threshold),
            ("lock.handoff_margin", self.lock.handoff_margin),
            ("lock.speaking_on", self.lock.speaking_on),
            (
                "lock.bearing_smoothing_alpha",
                self.lock.bearing_smoothing_alpha,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, "must be within [0, 1]"));
            }
        }
        if self.lock.drop_threshold >= self.lock.acquire_threshold {
            return Err(invalid(
                "lock.drop_threshold",
                "must be below lock.acquire_threshold (hysteresis)",
            ));
        }

        if self.bus.default_capacity == 0 {
            return Err(invalid("bus.default_capacity", "must be at least 1"));
        }

        if !(self.health.emit_hz > 0.0 && self.health.emit_hz <= 2.0) {
            return Err(invalid("health.emit_hz", "must be within (0, 2]"));
        }
        if self.health.staleness_yellow_ms >= self.health.staleness_red_ms {
            return Err(invalid(
                "health.staleness_yellow_ms",
                "must be below health.staleness_red_ms",
            ));
        }

        if self.runtime.heartbeat_ms == 0 {
            return Err(invalid("runtime.heartbeat_ms", "must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_defaults_match_spec_surface() {
        let config = Config::default();
        assert_eq!(config.doa.bin_size_deg, 2.0);
        assert_eq!(config.doa.update_hz, 10.0);
        assert_eq!(config.doa.freq_band_hz, [300.0, 3800.0]);
        assert_eq!(config.doa.smoothing_alpha, 0.3);
        assert_eq!(config.doa.top_k_peaks, 3);
        assert!(config.doa.gate_on_vad);
        assert_eq!(config.fusion.max_assoc_deg, 20.0);
        assert!(config.fusion.require_vad);
        assert_eq!(config.fusion.faces_max_age_ms, 300);
        assert_eq!(config.lock.acquire_threshold, 0.6);
        assert_eq!(config.lock.drop_threshold, 0.35);
        assert_eq!(config.lock.acquire_dwell_ms, 150);
        assert_eq!(config.lock.hold_ms, 800);
        assert_eq!(config.lock.handoff_min_ms, 700);
        assert_eq!(config.lock.handoff_margin, 0.1);
        assert_eq!(config.beamform.use_last_lock_ms, 500);
        assert_eq!(config.beamform.no_lock_behavior, NoLockBehavior::Omni);
        assert_eq!(config.bus.default_capacity, 32);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[doa]
bin_size_deg = 5.0
update_hz = 5.0

[lock]
acquire_threshold = 0.7
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.doa.bin_size_deg, 5.0);
        assert_eq!(config.lock.acquire_threshold, 0.7);
        // Untouched sections keep defaults.
        assert_eq!(config.fusion.max_assoc_deg, 20.0);
    }

    #[test]
    fn test_missing_file_is_config_not_found() {
        let result = Config::load(Path::new("/nonexistent/focusfield.toml"));
        assert!(matches!(
            result,
            Err(FocusFieldError::ConfigFileNotFound { .. })
        ));
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/focusfield.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[doa]\nbin_sizedeg = 5.0").unwrap();
        let result = Config::load(file.path());
        assert!(matches!(result, Err(FocusFieldError::Config(_))));
    }

    #[test]
    fn test_invalid_bin_size_rejected() {
        let mut config = Config::default();
        config.doa.bin_size_deg = 7.0; // does not divide 360
        let result = config.validate();
        assert!(matches!(
            result,
            Err(FocusFieldError::ConfigInvalidValue { key, .. }) if key == "doa.bin_size_deg"
        ));
    }

    #[test]
    fn test_hysteresis_ordering_enforced() {
        let mut config = Config::default();
        config.lock.drop_threshold = 0.6; // == acquire threshold
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_geometry_channel_mismatch_rejected() {
        let mut config = Config::default();
        config.audio.channels = 6;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(FocusFieldError::ConfigInvalidValue { key, .. }) if key == "audio.mic_positions_m"
        ));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = Config::default();
        config.fusion.weights = AssocWeights {
            mouth: 0.5,
            face: 0.5,
            doa: 0.5,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_face_area_bounds_ordered() {
        let mut config = Config::default();
        config.fusion.face_area_soft_max_px = 900.0; // == min_face_area_px
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_freq_band_above_nyquist_rejected() {
        let mut config = Config::default();
        config.doa.freq_band_hz = [300.0, 9000.0]; // nyquist is 8000 at 16kHz
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_emit_hz_bounded_at_two() {
        let mut config = Config::default();
        config.health.emit_hz = 4.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override_artifacts_dir() {
        // Serialize access: env vars are process-global.
        let config = Config::default();
        unsafe {
            std::env::set_var("FOCUSFIELD_ARTIFACTS_DIR", "/tmp/ff-test");
        }
        let config = config.with_env_overrides();
        unsafe {
            std::env::remove_var("FOCUSFIELD_ARTIFACTS_DIR");
        }
        assert_eq!(config.runtime.artifacts_dir, PathBuf::from("/tmp/ff-test"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
