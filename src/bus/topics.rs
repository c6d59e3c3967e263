//! Well-known topic names.
//!
//! Input topics are consumed, not produced, by the core; everything else is
//! produced here. Keeping the constants in one place ties each topic to its
//! message type.

use crate::bus::Topic;
use crate::messages::{
    AudioFrame, CandidateBatch, DoaHeatmap, EnhancedAudio, FaceTrack, HealthSnapshot, LogEvent,
    PerfSnapshot, TargetLock, VoiceActivity,
};

// Inputs
pub const AUDIO_FRAMES: Topic<AudioFrame> = Topic::new("audio.frames");
pub const AUDIO_VAD: Topic<VoiceActivity> = Topic::new("audio.vad");
pub const VISION_FACE_TRACKS: Topic<Vec<FaceTrack>> = Topic::new("vision.face_tracks");

// Outputs
pub const AUDIO_DOA_HEATMAP: Topic<DoaHeatmap> = Topic::new("audio.doa_heatmap");
pub const FUSION_CANDIDATES: Topic<CandidateBatch> = Topic::new("fusion.candidates");
pub const FUSION_TARGET_LOCK: Topic<TargetLock> = Topic::new("fusion.target_lock");
pub const AUDIO_ENHANCED_BEAMFORMED: Topic<EnhancedAudio> =
    Topic::new("audio.enhanced.beamformed");

// Diagnostics
pub const LOG_EVENTS: Topic<LogEvent> = Topic::new("log.events");
pub const RUNTIME_HEALTH: Topic<HealthSnapshot> = Topic::new("runtime.health");
pub const RUNTIME_PERF: Topic<PerfSnapshot> = Topic::new("runtime.perf");
