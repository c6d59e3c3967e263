//! Concrete pipeline stations.
//!
//! Thin adapters between the bus and the core processors. Each station is
//! driven by one primary topic; side topics are drained to their most
//! recent message at every tick, so a stalled side input degrades behavior
//! instead of blocking the pipeline.

use std::sync::Arc;

use crate::beamform::{BeamformNotice, DelayAndSumBeamformer};
use crate::bus::{Bus, Subscription, topics};
use crate::clock::Clock;
use crate::doa::DoaProcessor;
use crate::fusion::{Associator, LockStateMachine};
use crate::messages::{
    AudioFrame, CandidateBatch, DoaHeatmap, EnhancedAudio, FaceTrack, LogEvent, LogLevel,
    TargetLock, VoiceActivity,
};
use crate::runtime::station::{Station, StationError};
use crate::sink::OutputSink;
use crate::wire;

/// DOA estimation: `audio.frames` (+ latest `audio.vad`) -> heatmaps.
pub struct DoaStation {
    processor: DoaProcessor,
    vad_sub: Subscription<VoiceActivity>,
    last_vad: Option<Arc<VoiceActivity>>,
}

impl DoaStation {
    pub fn new(processor: DoaProcessor, vad_sub: Subscription<VoiceActivity>) -> Self {
        Self {
            processor,
            vad_sub,
            last_vad: None,
        }
    }
}

impl Station for DoaStation {
    type Input = AudioFrame;
    type Output = DoaHeatmap;

    fn name(&self) -> &'static str {
        "audio.doa"
    }

    fn process(&mut self, frame: Arc<AudioFrame>) -> Result<Option<DoaHeatmap>, StationError> {
        if let Some(vad) = self.vad_sub.latest() {
            self.last_vad = Some(vad);
        }
        self.processor
            .process(&frame, self.last_vad.as_deref())
            .map_err(|e| StationError::Recoverable(e.to_string()))
    }
}

/// AV association: `audio.doa_heatmap` (+ latest faces and VAD) ->
/// candidate batches at the fusion cadence.
pub struct AssociationStation {
    associator: Associator,
    faces_sub: Subscription<Vec<FaceTrack>>,
    vad_sub: Subscription<VoiceActivity>,
    last_faces: Option<Arc<Vec<FaceTrack>>>,
    last_vad: Option<Arc<VoiceActivity>>,
    last_heatmap: Option<Arc<DoaHeatmap>>,
}

impl AssociationStation {
    pub fn new(
        associator: Associator,
        faces_sub: Subscription<Vec<FaceTrack>>,
        vad_sub: Subscription<VoiceActivity>,
    ) -> Self {
        Self {
            associator,
            faces_sub,
            vad_sub,
            last_faces: None,
            last_vad: None,
            last_heatmap: None,
        }
    }

    fn refresh_sides(&mut self) {
        if let Some(faces) = self.faces_sub.latest() {
            self.last_faces = Some(faces);
        }
        if let Some(vad) = self.vad_sub.latest() {
            self.last_vad = Some(vad);
        }
    }

    fn tick(&mut self, t_ns: u64) -> CandidateBatch {
        let faces = self.last_faces.as_ref().and_then(|batch| {
            batch
                .first()
                .map(|track| (batch.as_slice(), track.t_ns))
        });
        self.associator.tick(
            t_ns,
            self.last_heatmap.as_deref(),
            faces,
            self.last_vad.as_deref(),
        )
    }
}

impl Station for AssociationStation {
    type Input = DoaHeatmap;
    type Output = CandidateBatch;

    fn name(&self) -> &'static str {
        "fusion.association"
    }

    fn process(&mut self, heatmap: Arc<DoaHeatmap>) -> Result<Option<CandidateBatch>, StationError> {
        self.refresh_sides();
        let t_ns = heatmap.t_ns;
        self.last_heatmap = Some(heatmap);
        if !self.associator.due(t_ns) {
            return Ok(None);
        }
        Ok(Some(self.tick(t_ns)))
    }

    fn on_timeout(&mut self, now_ns: u64) -> Result<Option<CandidateBatch>, StationError> {
        // Heartbeat with the last known inputs so the lock machine keeps
        // ticking through an upstream stall.
        self.refresh_sides();
        Ok(Some(self.tick(now_ns)))
    }
}

/// Target selection: `fusion.candidates` (+ latest VAD) -> `TargetLock`.
pub struct LockStation {
    machine: LockStateMachine,
    vad_sub: Subscription<VoiceActivity>,
    last_vad: Option<Arc<VoiceActivity>>,
    max_skew_ms: u64,
}

impl LockStation {
    pub fn new(
        machine: LockStateMachine,
        vad_sub: Subscription<VoiceActivity>,
        max_skew_ms: u64,
    ) -> Self {
        Self {
            machine,
            vad_sub,
            last_vad: None,
            max_skew_ms,
        }
    }

    fn update(&mut self, batch: &CandidateBatch) -> Result<Option<TargetLock>, StationError> {
        if let Some(vad) = self.vad_sub.latest() {
            self.last_vad = Some(vad);
        }
        // No cross-topic timestamp equality is assumed: VAD further from
        // the batch than the skew bound is treated as absent.
        let vad = self.last_vad.as_deref().filter(|v| {
            crate::clock::skew_ms(v.t_ns, batch.t_ns) <= self.max_skew_ms as f64
        });
        match self.machine.update(batch, vad) {
            Ok(lock) => Ok(Some(lock)),
            Err(e) if e.is_invariant_violation() => Err(StationError::Invariant {
                module: "fusion.lock".to_string(),
                message: e.to_string(),
                snapshot: self.machine.snapshot(),
            }),
            Err(e) => Err(StationError::Recoverable(e.to_string())),
        }
    }
}

impl Station for LockStation {
    type Input = CandidateBatch;
    type Output = TargetLock;

    fn name(&self) -> &'static str {
        "fusion.lock"
    }

    fn process(&mut self, batch: Arc<CandidateBatch>) -> Result<Option<TargetLock>, StationError> {
        self.update(&batch)
    }

    fn on_timeout(&mut self, now_ns: u64) -> Result<Option<TargetLock>, StationError> {
        // A silent association stage must not freeze the lock: tick with an
        // empty batch so hold/drop timers keep running.
        let heartbeat = CandidateBatch {
            t_ns: now_ns,
            seq: 0,
            doa_low_confidence: false,
            candidates: Vec::new(),
        };
        self.update(&heartbeat)
    }
}

/// Beamforming: `audio.frames` (+ latest `fusion.target_lock`) ->
/// `audio.enhanced.beamformed`.
pub struct BeamformStation {
    beamformer: DelayAndSumBeamformer,
    lock_sub: Subscription<TargetLock>,
    last_lock: Option<Arc<TargetLock>>,
    bus: Arc<Bus>,
    clock: Arc<dyn Clock>,
}

impl BeamformStation {
    pub fn new(
        beamformer: DelayAndSumBeamformer,
        lock_sub: Subscription<TargetLock>,
        bus: Arc<Bus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            beamformer,
            lock_sub,
            last_lock: None,
            bus,
            clock,
        }
    }
}

impl Station for BeamformStation {
    type Input = AudioFrame;
    type Output = EnhancedAudio;

    fn name(&self) -> &'static str {
        "audio.beamform"
    }

    fn process(&mut self, frame: Arc<AudioFrame>) -> Result<Option<EnhancedAudio>, StationError> {
        if let Some(lock) = self.lock_sub.latest() {
            self.last_lock = Some(lock);
        }
        let (enhanced, notice) = self.beamformer.process(&frame, self.last_lock.as_deref());
        if let Some(notice) = notice {
            let t_ns = self.clock.now_ns();
            let event = match notice {
                BeamformNotice::Degraded { message } => {
                    LogEvent::new(t_ns, LogLevel::Warning, self.name(), "beamform.degraded")
                        .with("detail", message)
                }
                BeamformNotice::Recovered => {
                    LogEvent::new(t_ns, LogLevel::Info, self.name(), "beamform.recovered")
                }
            };
            let _ = self.bus.publish(&topics::LOG_EVENTS, event);
        }
        Ok(Some(enhanced))
    }
}

/// Terminal station feeding the configured output sink.
pub struct SinkStation {
    sink: OutputSink,
}

impl SinkStation {
    pub fn new(sink: OutputSink) -> Self {
        Self { sink }
    }
}

impl Station for SinkStation {
    type Input = EnhancedAudio;
    type Output = ();

    fn name(&self) -> &'static str {
        "audio.sink"
    }

    fn process(&mut self, block: Arc<EnhancedAudio>) -> Result<Option<()>, StationError> {
        self.sink
            .handle(&block)
            .map_err(|e| StationError::Recoverable(e.to_string()))?;
        Ok(None)
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.sink.finish() {
            log::warn!("sink finalize failed: {e}");
        }
    }
}

/// Persists `log.events` as JSONL under `<artifacts>/logs/events.jsonl`,
/// with periodic flushing and optional size rotation.
pub struct LogFileStation {
    path: std::path::PathBuf,
    writer: Option<std::io::BufWriter<std::fs::File>>,
    flush_interval: std::time::Duration,
    last_flush: std::time::Instant,
    rotate_bytes: u64,
    written_bytes: u64,
    rotate_index: u32,
}

impl LogFileStation {
    pub fn create(
        artifacts_dir: &std::path::Path,
        flush_interval_ms: u64,
        rotate_mb: u64,
    ) -> crate::error::Result<Self> {
        let logs_dir = artifacts_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        let path = logs_dir.join("events.jsonl");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: Some(std::io::BufWriter::new(file)),
            flush_interval: std::time::Duration::from_millis(flush_interval_ms),
            last_flush: std::time::Instant::now(),
            rotate_bytes: rotate_mb * 1024 * 1024,
            written_bytes: 0,
            rotate_index: 0,
        })
    }

    fn maybe_flush_and_rotate(&mut self) -> std::io::Result<()> {
        use std::io::Write;
        if self.last_flush.elapsed() < self.flush_interval {
            return Ok(());
        }
        self.last_flush = std::time::Instant::now();
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        if self.rotate_bytes > 0 && self.written_bytes >= self.rotate_bytes {
            self.writer = None;
            self.rotate_index += 1;
            let rotated = self
                .path
                .with_file_name(format!("events.{:03}.jsonl", self.rotate_index));
            std::fs::rename(&self.path, &rotated)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(std::io::BufWriter::new(file));
            self.written_bytes = 0;
        }
        Ok(())
    }
}

impl Station for LogFileStation {
    type Input = LogEvent;
    type Output = ();

    fn name(&self) -> &'static str {
        "core.log_sink"
    }

    fn process(&mut self, event: Arc<LogEvent>) -> Result<Option<()>, StationError> {
        use std::io::Write;
        let line =
            wire::to_jsonl_line(&*event).map_err(|e| StationError::Recoverable(e.to_string()))?;
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{line}")
                .map_err(|e| StationError::Recoverable(format!("log write failed: {e}")))?;
            self.written_bytes += line.len() as u64 + 1;
        }
        self.maybe_flush_and_rotate()
            .map_err(|e| StationError::Recoverable(format!("log flush failed: {e}")))?;
        Ok(None)
    }

    fn shutdown(&mut self) {
        use std::io::Write;
        if let Some(writer) = self.writer.as_mut()
            && let Err(e) = writer.flush()
        {
            log::warn!("log sink flush failed: {e}");
        }
    }
}
