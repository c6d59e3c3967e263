//! Shared helpers for integration tests: deterministic synthetic scenes
//! driven through the core processors with message timestamps.

use focusfield::config::{AudioConfig, BeamformConfig, DoaConfig, FusionConfig, LockConfig};
use focusfield::beamform::DelayAndSumBeamformer;
use focusfield::doa::{ArrayGeometry, DoaProcessor};
use focusfield::fusion::{Associator, LockStateMachine};
use focusfield::messages::{
    AudioFrame, BoundingBox, CandidateBatch, DoaHeatmap, EnhancedAudio, FaceTrack, TargetLock,
    VoiceActivity,
};

pub const SAMPLE_RATE: u32 = 16_000;
pub const BLOCK: usize = 1024;
/// One 1024-sample block at 16kHz.
pub const BLOCK_NS: u64 = 64_000_000;

pub fn linear_array() -> ArrayGeometry {
    ArrayGeometry::new(
        vec![[-0.06, 0.0], [-0.02, 0.0], [0.02, 0.0], [0.06, 0.0]],
        343.0,
    )
    .unwrap()
}

pub fn audio_config() -> AudioConfig {
    AudioConfig {
        sample_rate_hz: SAMPLE_RATE,
        block_samples: BLOCK,
        channels: 4,
        ..AudioConfig::default()
    }
}

/// Interleaved multitone plane wave from `bearing_deg`, continuous across
/// blocks (the block index offsets the time base).
pub fn plane_wave_block(
    geometry: &ArrayGeometry,
    bearing_deg: f32,
    block_index: u64,
    amplitude: f32,
) -> Vec<f32> {
    const TONES_HZ: [f32; 4] = [500.0, 900.0, 1500.0, 2500.0];
    let channels = geometry.channels();
    let mut samples = vec![0.0f32; BLOCK * channels];
    for ch in 0..channels {
        let delay_s = geometry.delay_s(ch, bearing_deg);
        for n in 0..BLOCK {
            let t_s = (block_index as f32 * BLOCK as f32 + n as f32) / SAMPLE_RATE as f32 + delay_s;
            let value: f32 = TONES_HZ
                .iter()
                .enumerate()
                .map(|(m, &f)| {
                    (2.0 * std::f32::consts::PI * f * t_s + m as f32 * 0.9).sin()
                        / TONES_HZ.len() as f32
                })
                .sum();
            samples[n * channels + ch] = value * amplitude;
        }
    }
    samples
}

pub fn silence_block(channels: usize) -> Vec<f32> {
    vec![0.0f32; BLOCK * channels]
}

pub fn face(t_ns: u64, seq: u64, id: &str, bearing: f32, mouth: f32, confidence: f32) -> FaceTrack {
    FaceTrack {
        t_ns,
        seq,
        track_id: id.to_string(),
        bbox: BoundingBox {
            x: 0.0,
            y: 0.0,
            w: 120.0,
            h: 120.0,
        },
        confidence,
        bearing_deg: bearing,
        mouth_activity: mouth,
    }
}

pub fn vad(t_ns: u64, seq: u64, speech: bool) -> VoiceActivity {
    VoiceActivity {
        t_ns,
        seq,
        speech,
        confidence: if speech { 0.9 } else { 0.05 },
    }
}

/// Output of one harness step.
pub struct StepOutput {
    pub heatmap: Option<DoaHeatmap>,
    pub batch: Option<CandidateBatch>,
    pub lock: Option<TargetLock>,
    pub enhanced: EnhancedAudio,
}

/// Deterministic single-threaded pipeline: the stations' dataflow without
/// the threads, driven purely by message timestamps.
pub struct Harness {
    pub doa: DoaProcessor,
    pub associator: Associator,
    pub lock: LockStateMachine,
    pub beamformer: DelayAndSumBeamformer,
    last_heatmap: Option<DoaHeatmap>,
    last_faces: Option<Vec<FaceTrack>>,
    last_lock: Option<TargetLock>,
    seq: u64,
}

impl Harness {
    pub fn new(geometry: ArrayGeometry) -> Self {
        let audio = audio_config();
        Self {
            doa: DoaProcessor::new(&audio, &DoaConfig::default(), geometry.clone()).unwrap(),
            associator: Associator::new(FusionConfig::default()),
            lock: LockStateMachine::new(LockConfig::default()),
            beamformer: DelayAndSumBeamformer::new(
                geometry,
                SAMPLE_RATE,
                BeamformConfig::default(),
            ),
            last_heatmap: None,
            last_faces: None,
            last_lock: None,
            seq: 0,
        }
    }

    /// Feeds one capture block plus the companion face/VAD messages.
    pub fn step(
        &mut self,
        samples: Vec<f32>,
        faces: Option<Vec<FaceTrack>>,
        speech: bool,
    ) -> StepOutput {
        self.seq += 1;
        let t_ns = (self.seq - 1) * BLOCK_NS;
        let frame = AudioFrame::new(t_ns, self.seq, SAMPLE_RATE, 4, samples);
        let voice = vad(t_ns, self.seq, speech);
        if let Some(faces) = faces {
            self.last_faces = Some(faces);
        }

        let heatmap = self.doa.process(&frame, Some(&voice)).unwrap();
        if let Some(heatmap) = &heatmap {
            self.last_heatmap = Some(heatmap.clone());
        }

        let mut batch = None;
        let mut lock = None;
        if let Some(heatmap) = &heatmap
            && self.associator.due(heatmap.t_ns)
        {
            let faces = self
                .last_faces
                .as_ref()
                .and_then(|f| f.first().map(|first| (f.as_slice(), first.t_ns)));
            let out = self
                .associator
                .tick(heatmap.t_ns, Some(heatmap), faces, Some(&voice));
            let lock_out = self.lock.update(&out, Some(&voice)).unwrap();
            self.last_lock = Some(lock_out.clone());
            batch = Some(out);
            lock = Some(lock_out);
        }

        let (enhanced, _) = self.beamformer.process(&frame, self.last_lock.as_ref());
        StepOutput {
            heatmap,
            batch,
            lock,
            enhanced,
        }
    }
}
