//! Runtime handle: owns the bus, clock, and config snapshot, and wires one
//! thread per component.
//!
//! There is no global state: the `Runtime` is constructed once at startup
//! and hands each component exactly what it needs. Dataflow cycles (the
//! beamformer consuming `fusion.target_lock`) exist only through the bus,
//! so no component holds a reference to another.

pub mod crash;
pub mod station;
pub mod stations;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::bus::{Bus, topics};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::doa::{ArrayGeometry, DoaProcessor};
use crate::error::Result;
use crate::fusion::{Associator, LockStateMachine};
use crate::health::{HealthMonitor, PerfRegistry};
use crate::messages::{LogEvent, LogLevel};
use crate::sink::OutputSink;

use station::{StationEnv, StationRunner};
use stations::{
    AssociationStation, BeamformStation, DoaStation, LockStation, LogFileStation, SinkStation,
};

pub struct Runtime {
    config: Config,
    clock: Arc<dyn Clock>,
    bus: Arc<Bus>,
    perf: Arc<PerfRegistry>,
}

impl Runtime {
    /// Builds a runtime on the system clock.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Builds a runtime on an injected clock (tests and bench replay).
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let bus = Arc::new(Bus::new(clock.clone()));
        Ok(Self {
            config,
            clock,
            bus,
            perf: Arc::new(PerfRegistry::new()),
        })
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Spawns every component and returns the control handle.
    pub fn start(self) -> Result<RuntimeHandle> {
        let Self {
            config,
            clock,
            bus,
            perf,
        } = self;

        let geometry = ArrayGeometry::new(
            config.audio.mic_positions_m.clone(),
            config.audio.speed_of_sound_mps,
        )?;

        let capacity = config.bus.default_capacity;
        let policy = config.bus.overflow_policy;
        let running = Arc::new(AtomicBool::new(true));
        let fault = Arc::new(AtomicBool::new(false));
        let env = StationEnv {
            bus: bus.clone(),
            clock: clock.clone(),
            perf: perf.clone(),
            running: running.clone(),
            fault: fault.clone(),
            heartbeat: Duration::from_millis(config.runtime.heartbeat_ms),
            artifacts_dir: config.runtime.artifacts_dir.clone(),
        };

        let mut runners = Vec::new();

        // Log persistence first: it must be subscribed before the startup
        // events below are published.
        if config.logging.file_enabled {
            let log_station = LogFileStation::create(
                &config.runtime.artifacts_dir,
                config.logging.flush_interval_ms,
                config.logging.rotate_mb,
            )?;
            runners.push(StationRunner::spawn(
                log_station,
                bus.subscribe(&topics::LOG_EVENTS, capacity.max(128), policy)?,
                None,
                env.clone(),
            ));
        }

        // DOA
        let doa_processor = DoaProcessor::new(&config.audio, &config.doa, geometry.clone())?;
        if doa_processor.is_degraded() {
            let event = LogEvent::new(
                clock.now_ns(),
                LogLevel::Warning,
                "audio.doa",
                "doa.geometry_degraded",
            )
            .with("fallback", "gcc_phat");
            let _ = bus.publish(&topics::LOG_EVENTS, event);
        }
        let doa_station = DoaStation::new(
            doa_processor,
            bus.subscribe(&topics::AUDIO_VAD, capacity, policy)?,
        );
        runners.push(StationRunner::spawn(
            doa_station,
            bus.subscribe(&topics::AUDIO_FRAMES, capacity, policy)?,
            Some(&topics::AUDIO_DOA_HEATMAP),
            env.clone(),
        ));

        // Association
        let association_station = AssociationStation::new(
            Associator::new(config.fusion.clone()),
            bus.subscribe(&topics::VISION_FACE_TRACKS, capacity, policy)?,
            bus.subscribe(&topics::AUDIO_VAD, capacity, policy)?,
        );
        runners.push(StationRunner::spawn(
            association_station,
            bus.subscribe(&topics::AUDIO_DOA_HEATMAP, capacity, policy)?,
            Some(&topics::FUSION_CANDIDATES),
            env.clone(),
        ));

        // Lock
        let lock_station = LockStation::new(
            LockStateMachine::new(config.lock.clone()),
            bus.subscribe(&topics::AUDIO_VAD, capacity, policy)?,
            config.runtime.max_skew_ms,
        );
        runners.push(StationRunner::spawn(
            lock_station,
            bus.subscribe(&topics::FUSION_CANDIDATES, capacity, policy)?,
            Some(&topics::FUSION_TARGET_LOCK),
            env.clone(),
        ));

        // Beamformer
        let beamform_station = BeamformStation::new(
            crate::beamform::DelayAndSumBeamformer::new(
                geometry,
                config.audio.sample_rate_hz,
                config.beamform.clone(),
            ),
            bus.subscribe(&topics::FUSION_TARGET_LOCK, capacity, policy)?,
            bus.clone(),
            clock.clone(),
        );
        runners.push(StationRunner::spawn(
            beamform_station,
            bus.subscribe(&topics::AUDIO_FRAMES, capacity, policy)?,
            Some(&topics::AUDIO_ENHANCED_BEAMFORMED),
            env.clone(),
        ));

        // Output sink
        let sink = OutputSink::from_config(&config.sink, config.audio.sample_rate_hz)?;
        runners.push(StationRunner::spawn(
            SinkStation::new(sink),
            bus.subscribe(&topics::AUDIO_ENHANCED_BEAMFORMED, capacity, policy)?,
            None,
            env.clone(),
        ));

        // Health/perf aggregation runs on its own cadence, not a topic.
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let health = spawn_health_task(
            HealthMonitor::new(config.health.clone()),
            bus.clone(),
            clock.clone(),
            perf.clone(),
            shutdown_rx,
        );

        let _ = bus.publish(
            &topics::LOG_EVENTS,
            LogEvent::new(clock.now_ns(), LogLevel::Info, "runtime", "started"),
        );

        Ok(RuntimeHandle {
            running,
            fault,
            bus,
            clock,
            runners,
            health: Some(health),
            shutdown_tx,
            shutdown_deadline: Duration::from_millis(config.runtime.shutdown_deadline_ms),
        })
    }
}

fn spawn_health_task(
    mut monitor: HealthMonitor,
    bus: Arc<Bus>,
    clock: Arc<dyn Clock>,
    perf: Arc<PerfRegistry>,
    shutdown_rx: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("runtime.health".to_string())
        .spawn(move || {
            let interval = Duration::from_nanos(monitor.emit_interval_ns());
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let now_ns = clock.now_ns();
                for event in HealthMonitor::drop_events(now_ns, &bus.drain_drop_reports()) {
                    let _ = bus.publish(&topics::LOG_EVENTS, event);
                }
                let ages = bus.topic_ages_ms(now_ns);
                let snapshot = monitor.health_snapshot(now_ns, &ages, bus.total_drops());
                let _ = bus.publish(&topics::RUNTIME_HEALTH, snapshot);
                let snapshot = monitor.perf_snapshot(now_ns, &perf);
                let _ = bus.publish(&topics::RUNTIME_PERF, snapshot);
            }
            let _ = bus.publish(
                &topics::LOG_EVENTS,
                LogEvent::new(clock.now_ns(), LogLevel::Info, "runtime.health", "stopped"),
            );
        })
        .expect("failed to spawn health thread")
}

/// Outcome of an orderly shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Stations that missed the shutdown deadline and were abandoned.
    pub stuck: Vec<&'static str>,
    /// True when shutdown was triggered by an invariant violation.
    pub faulted: bool,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.stuck.is_empty() && !self.faulted
    }
}

/// Control handle for a started runtime.
pub struct RuntimeHandle {
    running: Arc<AtomicBool>,
    fault: Arc<AtomicBool>,
    bus: Arc<Bus>,
    clock: Arc<dyn Clock>,
    runners: Vec<StationRunner>,
    health: Option<JoinHandle<()>>,
    shutdown_tx: Sender<()>,
    shutdown_deadline: Duration,
}

impl RuntimeHandle {
    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    /// False once shutdown was requested, by `stop` or by a fault.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests shutdown and joins every component within the deadline.
    /// Stations exceeding it are abandoned and logged as `stuck_on_stop`.
    pub fn stop(mut self) -> StopReport {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let deadline = std::time::Instant::now() + self.shutdown_deadline;
        while std::time::Instant::now() < deadline
            && self.runners.iter().any(|r| !r.is_finished())
        {
            std::thread::sleep(Duration::from_millis(10));
        }

        let mut stuck = Vec::new();
        let mut finished = Vec::new();
        for runner in self.runners.drain(..) {
            if runner.is_finished() {
                finished.push(runner);
            } else {
                stuck.push(runner.name());
            }
        }
        for name in &stuck {
            let event = LogEvent::new(self.clock.now_ns(), LogLevel::Error, name, "stuck_on_stop");
            let _ = self.bus.publish(&topics::LOG_EVENTS, event);
            log::warn!("station {name} exceeded the shutdown deadline");
        }
        for runner in finished {
            let _ = runner.join();
        }
        if let Some(health) = self.health.take() {
            let _ = health.join();
        }

        self.bus.shutdown();
        StopReport {
            stuck,
            faulted: self.fault.load(Ordering::SeqCst),
        }
    }
}
