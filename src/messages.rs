//! Typed messages carried on the bus.
//!
//! Every message is produced once, published, and shared read-only by
//! subscribers. Timestamps are monotonic nanoseconds; sequence numbers are
//! per-stream and strictly increasing; azimuths are wrapped to [0, 360)
//! before serialization. All types serialize to the newline-delimited JSON
//! wire format used for persisted traces.

use serde::{Deserialize, Serialize};

/// Wraps an angle in degrees into [0, 360).
pub fn wrap_deg(deg: f32) -> f32 {
    let wrapped = deg % 360.0;
    if wrapped < 0.0 { wrapped + 360.0 } else { wrapped }
}

/// Shortest angular distance between two azimuths, in [0, 180].
pub fn angular_distance_deg(a: f32, b: f32) -> f32 {
    let diff = (wrap_deg(a) - wrap_deg(b)).abs();
    if diff > 180.0 { 360.0 - diff } else { diff }
}

/// One multichannel capture block. Samples are interleaved f32 PCM in
/// [-1, 1]; frame `i` of channel `c` is `samples[i * channels + c]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrame {
    pub t_ns: u64,
    pub seq: u64,
    pub sample_rate_hz: u32,
    pub block_samples: usize,
    pub channels: usize,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(
        t_ns: u64,
        seq: u64,
        sample_rate_hz: u32,
        channels: usize,
        samples: Vec<f32>,
    ) -> Self {
        let block_samples = if channels > 0 {
            samples.len() / channels
        } else {
            0
        };
        Self {
            t_ns,
            seq,
            sample_rate_hz,
            block_samples,
            channels,
            samples,
        }
    }

    /// Strided iterator over one channel of the interleaved block.
    pub fn channel_samples(&self, channel: usize) -> impl Iterator<Item = f32> + '_ {
        self.samples
            .iter()
            .skip(channel)
            .step_by(self.channels.max(1))
            .copied()
    }

    /// Copies one channel into a contiguous buffer.
    pub fn channel_to_vec(&self, channel: usize) -> Vec<f32> {
        self.channel_samples(channel).collect()
    }
}

/// Per-block speech/no-speech decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceActivity {
    pub t_ns: u64,
    pub seq: u64,
    pub speech: bool,
    pub confidence: f32,
}

/// Face bounding box in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// A visually tracked face with a camera-yaw-compensated global bearing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceTrack {
    pub t_ns: u64,
    pub seq: u64,
    pub track_id: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub bearing_deg: f32,
    pub mouth_activity: f32,
}

/// One heatmap peak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DoaPeak {
    pub angle_deg: f32,
    pub score: f32,
}

/// 360-degree azimuth likelihood heatmap from one DOA update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoaHeatmap {
    pub t_ns: u64,
    pub seq: u64,
    pub bin_count: usize,
    pub bin_size_deg: f32,
    /// Normalized scores, max == 1 after smoothing (all-zero when flat).
    pub scores: Vec<f32>,
    pub peaks: Vec<DoaPeak>,
    /// Peak-to-mean ratio mapped to [0, 1], downweighted when VAD gates.
    pub confidence: f32,
    pub low_confidence: bool,
}

/// Per-component scores feeding a candidate's combined score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub mouth: f32,
    pub face_conf: f32,
    pub doa_peak: f32,
}

/// A scored pairing of a DOA peak with at most one face track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationCandidate {
    pub t_ns: u64,
    pub seq: u64,
    /// None marks an audio-only fallback candidate.
    pub track_id: Option<String>,
    pub bearing_deg: f32,
    pub doa_peak_deg: Option<f32>,
    pub angular_distance_deg: f32,
    pub components: ScoreComponents,
    pub combined_score: f32,
}

impl AssociationCandidate {
    pub fn is_audio_only(&self) -> bool {
        self.track_id.is_none()
    }
}

/// One batch of candidates per association tick, highest score first.
/// Empty batches are still published: the lock machine needs the heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBatch {
    pub t_ns: u64,
    pub seq: u64,
    /// True when the source heatmap was emitted under the VAD gate; the
    /// lock machine derives VISION_ONLY from this.
    pub doa_low_confidence: bool,
    pub candidates: Vec<AssociationCandidate>,
}

/// Lock state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    NoLock,
    Acquire,
    Locked,
    Hold,
    Handoff,
}

/// Derived lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockMode {
    NoLock,
    VisionOnly,
    AudioOnly,
    AvLock,
}

/// Stability statistics carried on every TargetLock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LockStability {
    /// Consecutive ticks spent in the current state.
    pub ticks_in_state: u64,
    /// Milliseconds since the current target was committed.
    pub lock_age_ms: u64,
    /// Handoff commits since startup.
    pub handoff_count: u64,
}

/// Target selection output, one per candidate batch or heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetLock {
    pub t_ns: u64,
    pub seq: u64,
    pub state: LockState,
    pub mode: LockMode,
    pub target_id: Option<String>,
    /// Populated in every locked mode, including AUDIO_ONLY, so the
    /// beamformer always has a steering angle.
    pub target_bearing_deg: Option<f32>,
    pub confidence: f32,
    pub reason: String,
    pub stability: LockStability,
}

/// Output block statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioStats {
    pub rms: f32,
    pub clipped_samples: usize,
    /// Energy reduction relative to the per-channel mean, in dB.
    pub suppression_db: f32,
}

/// Enhanced monaural output, aligned 1:1 with input AudioFrame seq.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedAudio {
    pub t_ns: u64,
    pub seq: u64,
    pub sample_rate_hz: u32,
    pub block_samples: usize,
    pub samples: Vec<f32>,
    pub stats: AudioStats,
}

/// Log severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

/// Structured diagnostic event carried on `log.events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub t_ns: u64,
    pub level: LogLevel,
    pub module: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl LogEvent {
    pub fn new(t_ns: u64, level: LogLevel, module: &str, event: &str) -> Self {
        Self {
            t_ns,
            level,
            module: module.to_string(),
            event: event.to_string(),
            payload: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }
}

/// Health color per topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthColor {
    Green,
    Yellow,
    Red,
}

/// Per-topic health entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicHealth {
    pub topic: String,
    pub last_publish_age_ms: Option<u64>,
    pub color: HealthColor,
}

/// Snapshot on `runtime.health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub t_ns: u64,
    pub seq: u64,
    pub topics: Vec<TopicHealth>,
    pub total_drops: u64,
}

/// Rolling latency for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLatency {
    pub stage: String,
    pub samples: usize,
    pub p50_us: u64,
    pub p95_us: u64,
}

/// Snapshot on `runtime.perf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfSnapshot {
    pub t_ns: u64,
    pub seq: u64,
    pub stages: Vec<StageLatency>,
}
