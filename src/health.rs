//! Health and performance aggregation.
//!
//! Tracks per-topic publish staleness, republishes coalesced queue-drop
//! reports from the bus, and aggregates per-stage processing latency into
//! rolling p50/p95 windows. Snapshots go out on `runtime.health` and
//! `runtime.perf` at a slow cadence; the UI consumes them, the core itself
//! only uses staleness to steer mode degradation.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::bus::DropReport;
use crate::config::HealthConfig;
use crate::messages::{
    HealthColor, HealthSnapshot, LogEvent, LogLevel, PerfSnapshot, StageLatency, TopicHealth,
};

/// Rolling samples kept per stage.
const LATENCY_WINDOW: usize = 256;

/// Shared per-stage latency registry. Station runners record into it; the
/// health task snapshots it.
#[derive(Default)]
pub struct PerfRegistry {
    stages: Mutex<BTreeMap<&'static str, VecDeque<Duration>>>,
}

impl PerfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: &'static str, elapsed: Duration) {
        let mut stages = self.stages.lock().expect("perf registry poisoned");
        let window = stages.entry(stage).or_default();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed);
    }

    pub fn stage_latencies(&self) -> Vec<StageLatency> {
        let stages = self.stages.lock().expect("perf registry poisoned");
        stages
            .iter()
            .filter(|(_, window)| !window.is_empty())
            .map(|(&stage, window)| {
                let mut sorted: Vec<Duration> = window.iter().copied().collect();
                sorted.sort();
                StageLatency {
                    stage: stage.to_string(),
                    samples: sorted.len(),
                    p50_us: percentile(&sorted, 50.0).as_micros() as u64,
                    p95_us: percentile(&sorted, 95.0).as_micros() as u64,
                }
            })
            .collect()
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[Duration], p: f32) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((p / 100.0) * sorted.len() as f32).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Builds the periodic snapshots and drop-report log events.
pub struct HealthMonitor {
    config: HealthConfig,
    health_seq: u64,
    perf_seq: u64,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            health_seq: 0,
            perf_seq: 0,
        }
    }

    pub fn emit_interval_ns(&self) -> u64 {
        (1_000_000_000.0 / self.config.emit_hz) as u64
    }

    fn color(&self, age_ms: u64) -> HealthColor {
        if age_ms > self.config.staleness_red_ms {
            HealthColor::Red
        } else if age_ms > self.config.staleness_yellow_ms {
            HealthColor::Yellow
        } else {
            HealthColor::Green
        }
    }

    pub fn health_snapshot(
        &mut self,
        t_ns: u64,
        topic_ages_ms: &[(&'static str, u64)],
        total_drops: u64,
    ) -> HealthSnapshot {
        self.health_seq += 1;
        HealthSnapshot {
            t_ns,
            seq: self.health_seq,
            topics: topic_ages_ms
                .iter()
                .map(|&(topic, age_ms)| TopicHealth {
                    topic: topic.to_string(),
                    last_publish_age_ms: Some(age_ms),
                    color: self.color(age_ms),
                })
                .collect(),
            total_drops,
        }
    }

    pub fn perf_snapshot(&mut self, t_ns: u64, registry: &PerfRegistry) -> PerfSnapshot {
        self.perf_seq += 1;
        PerfSnapshot {
            t_ns,
            seq: self.perf_seq,
            stages: registry.stage_latencies(),
        }
    }

    /// One coalesced `queue_full` log event per drop report.
    pub fn drop_events(t_ns: u64, reports: &[DropReport]) -> Vec<LogEvent> {
        reports
            .iter()
            .map(|report| {
                LogEvent::new(t_ns, LogLevel::Warning, "core.bus", "queue_full")
                    .with("topic", report.topic)
                    .with("subscriber_id", report.subscriber_id)
                    .with("dropped", report.dropped)
                    .with(
                        "policy",
                        serde_json::to_value(report.policy).unwrap_or_default(),
                    )
            })
            .collect()
    }
}
