//! Default configuration constants for focusfield.
//!
//! Shared constants used across configuration types to keep the recognized
//! option surface and its documented defaults in one place.

/// Default audio sample rate in Hz.
///
/// 16kHz covers the speech band up to 8kHz and keeps the per-block FFT cost
/// low enough for the DOA update cadence on small boards.
pub const SAMPLE_RATE_HZ: u32 = 16_000;

/// Default capture block size in samples (per channel).
///
/// 1024 samples at 16kHz is a 64ms block, which leaves headroom inside the
/// 50ms added-latency budget once the beamformer runs once per block.
pub const BLOCK_SAMPLES: usize = 1024;

/// Default azimuth bin size in degrees.
pub const DOA_BIN_SIZE_DEG: f32 = 2.0;

/// Default DOA heatmap update rate in Hz.
///
/// The UI needs a continuous feed; 10Hz is the full-profile floor.
pub const DOA_UPDATE_HZ: f32 = 10.0;

/// Default DOA analysis band in Hz.
///
/// 300-3800Hz brackets the speech formants while skipping low-frequency
/// rumble and the spatial-aliasing region of small arrays.
pub const DOA_FREQ_BAND_HZ: [f32; 2] = [300.0, 3800.0];

/// Default temporal smoothing factor for the heatmap EMA.
pub const DOA_SMOOTHING_ALPHA: f32 = 0.3;

/// Default number of heatmap peaks to extract.
pub const DOA_TOP_K_PEAKS: usize = 3;

/// Confidence multiplier applied to heatmaps emitted while VAD reports
/// no speech (the heatmap is still published, only downweighted).
pub const DOA_VAD_DOWNWEIGHT: f32 = 0.5;

/// Default maximum angular distance for pairing a DOA peak with a face.
pub const MAX_ASSOC_DEG: f32 = 20.0;

/// Default association score weights (mouth, face, doa). Must sum to 1.
pub const ASSOC_WEIGHTS: [f32; 3] = [0.4, 0.25, 0.35];

/// Default maximum age of a face-track batch before it is rejected.
pub const FACES_MAX_AGE_MS: u64 = 300;

/// Face bounding-box area (px^2) at or below which a detection scores
/// zero. Tiny boxes are usually spurious or too distant to be the talker.
pub const MIN_FACE_AREA_PX: f32 = 900.0;

/// Face bounding-box area (px^2) at which the size scale reaches full
/// weight; the scale ramps linearly between the two bounds.
pub const FACE_AREA_SOFT_MAX_PX: f32 = 3600.0;

/// Default lock acquire threshold on the combined candidate score.
pub const LOCK_ACQUIRE_THRESHOLD: f32 = 0.6;

/// Default lock drop threshold. Kept below the acquire threshold so the
/// machine has hysteresis instead of flapping at a single boundary.
pub const LOCK_DROP_THRESHOLD: f32 = 0.35;

/// Default dwell time a candidate must stay best before ACQUIRE commits.
pub const LOCK_ACQUIRE_DWELL_MS: u64 = 150;

/// Default hold duration for brief silences before the lock is released.
pub const LOCK_HOLD_MS: u64 = 800;

/// Default minimum interval between handoff commits.
pub const LOCK_HANDOFF_MIN_MS: u64 = 700;

/// Default score margin a challenger must sustain to trigger a handoff.
pub const LOCK_HANDOFF_MARGIN: f32 = 0.1;

/// Default mouth-activity level treated as "speaking".
pub const LOCK_SPEAKING_ON: f32 = 0.5;

/// Default freshness bound on TargetLock consumed by the beamformer.
pub const BEAMFORM_USE_LAST_LOCK_MS: u64 = 500;

/// Default fade duration for the `mute` no-lock behavior.
pub const BEAMFORM_FADE_MS: u64 = 20;

/// Default per-subscriber bus queue capacity.
pub const BUS_DEFAULT_CAPACITY: usize = 32;

/// Default heartbeat timeout for subscriber reads in milliseconds.
///
/// A silent upstream must not starve downstream components; on timeout a
/// component ticks with its last known input.
pub const HEARTBEAT_MS: u64 = 100;

/// Default shutdown deadline in milliseconds. Components exceeding it are
/// abandoned and logged as stuck_on_stop.
pub const SHUTDOWN_DEADLINE_MS: u64 = 2_000;

/// Default cross-topic skew bound for fusion decisions.
pub const MAX_SKEW_MS: u64 = 200;

/// Topic staleness threshold for the yellow health state.
pub const STALENESS_YELLOW_MS: u64 = 500;

/// Topic staleness threshold for the red health state.
pub const STALENESS_RED_MS: u64 = 2_000;

/// Default health/perf snapshot cadence in Hz (must stay at or below 2).
pub const HEALTH_EMIT_HZ: f32 = 1.0;

/// Default speed of sound in meters per second (dry air, 20C).
pub const SPEED_OF_SOUND_MPS: f32 = 343.0;
