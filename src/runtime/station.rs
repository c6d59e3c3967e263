//! Station trait and runner.
//!
//! Each component runs as one OS thread owned by a `StationRunner`: a
//! bounded read on the primary topic, a heartbeat tick when the upstream is
//! silent, latency recording per processed message, and a final `stopped`
//! log event on the way out. Components communicate only through the bus.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bus::{Bus, RecvTimeout, Subscription, Topic, topics};
use crate::clock::Clock;
use crate::health::PerfRegistry;
use crate::messages::{LogEvent, LogLevel};
use crate::runtime::crash;

/// Minimum spacing between recoverable-error log events per station.
const ERROR_LOG_WINDOW: Duration = Duration::from_secs(1);

/// Errors surfaced by station processing.
#[derive(Debug, Clone)]
pub enum StationError {
    /// Recoverable: log (rate-limited) and continue.
    Recoverable(String),
    /// Fatal for this station: log and stop the thread.
    Fatal(String),
    /// Invariant violation: crash dump, fatal log, runtime-wide shutdown.
    Invariant {
        module: String,
        message: String,
        snapshot: serde_json::Value,
    },
}

impl fmt::Display for StationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            StationError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
            StationError::Invariant {
                module, message, ..
            } => write!(f, "Invariant violation in {}: {}", module, message),
        }
    }
}

impl std::error::Error for StationError {}

/// A pipeline component driven by one primary topic.
pub trait Station: Send {
    type Input: Send + Sync + 'static;
    type Output: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Processes one message from the primary topic.
    fn process(&mut self, input: Arc<Self::Input>) -> Result<Option<Self::Output>, StationError>;

    /// Heartbeat when the primary topic has been silent for one heartbeat
    /// interval; keeps downstream liveness when an upstream stalls.
    fn on_timeout(&mut self, _now_ns: u64) -> Result<Option<Self::Output>, StationError> {
        Ok(None)
    }

    fn shutdown(&mut self) {}
}

/// Shared environment handed to every runner.
#[derive(Clone)]
pub struct StationEnv {
    pub bus: Arc<Bus>,
    pub clock: Arc<dyn Clock>,
    pub perf: Arc<PerfRegistry>,
    /// Cleared to request orderly shutdown of every station.
    pub running: Arc<AtomicBool>,
    /// Set when a station hit an invariant violation.
    pub fault: Arc<AtomicBool>,
    pub heartbeat: Duration,
    pub artifacts_dir: std::path::PathBuf,
}

impl StationEnv {
    fn log(&self, level: LogLevel, module: &str, event: &str, detail: Option<&str>) {
        let mut log_event = LogEvent::new(self.clock.now_ns(), level, module, event);
        if let Some(detail) = detail {
            log_event = log_event.with("detail", detail);
        }
        let _ = self.bus.publish(&topics::LOG_EVENTS, log_event);
    }
}

/// Owns a spawned station thread.
pub struct StationRunner {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl StationRunner {
    pub fn spawn<S: Station + 'static>(
        mut station: S,
        input: Subscription<S::Input>,
        output: Option<&'static Topic<S::Output>>,
        env: StationEnv,
    ) -> Self {
        let name = station.name();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut last_error_log: Option<Instant> = None;
                while env.running.load(Ordering::SeqCst) {
                    let result = match input.recv_timeout(env.heartbeat) {
                        Ok(msg) => {
                            let started = Instant::now();
                            let result = station.process(msg);
                            env.perf.record(name, started.elapsed());
                            result
                        }
                        Err(RecvTimeout::Timeout) => station.on_timeout(env.clock.now_ns()),
                        Err(RecvTimeout::Closed) => break,
                    };

                    match result {
                        Ok(Some(out)) => {
                            if let Some(topic) = output {
                                let _ = env.bus.publish(topic, out);
                            }
                        }
                        Ok(None) => {}
                        Err(StationError::Recoverable(message)) => {
                            let due = last_error_log
                                .is_none_or(|last| last.elapsed() >= ERROR_LOG_WINDOW);
                            if due {
                                last_error_log = Some(Instant::now());
                                env.log(
                                    LogLevel::Warning,
                                    name,
                                    "recoverable_error",
                                    Some(&message),
                                );
                            }
                        }
                        Err(StationError::Fatal(message)) => {
                            env.log(LogLevel::Error, name, "fatal_error", Some(&message));
                            break;
                        }
                        Err(StationError::Invariant {
                            module,
                            message,
                            snapshot,
                        }) => {
                            let t_ns = env.clock.now_ns();
                            if let Err(e) = crash::write_crash_dump(
                                &env.artifacts_dir,
                                &module,
                                &message,
                                &snapshot,
                                t_ns,
                            ) {
                                log::warn!("failed to write crash dump: {e}");
                            }
                            env.log(LogLevel::Fatal, &module, "invariant_violation", Some(&message));
                            env.fault.store(true, Ordering::SeqCst);
                            env.running.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                station.shutdown();
                env.log(LogLevel::Info, name, "stopped", None);
            })
            .expect("failed to spawn station thread");
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> std::thread::Result<()> {
        self.handle.join()
    }
}
