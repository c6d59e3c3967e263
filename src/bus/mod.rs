//! Typed in-process publish/subscribe.
//!
//! Each subscriber owns a bounded queue with a single writer (the publishing
//! thread) and a single reader (the subscribing component), so memory is
//! bounded by the sum of subscriber capacities. Per-topic publish order is
//! preserved per subscriber; there is no cross-topic ordering guarantee.
//! Publishing never blocks and never panics: a full queue applies the
//! subscriber's overflow policy and increments its drop counter.

pub mod topics;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{FocusFieldError, Result};

/// Bounded wait applied by the `block` overflow policy before giving up.
const BLOCK_WAIT: Duration = Duration::from_millis(10);

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the incoming message (default).
    DropNewest,
    /// Discard the oldest queued message to make room.
    DropOldest,
    /// Wait briefly for space, then discard the incoming message.
    Block,
}

/// A typed topic name. The phantom type ties publish and subscribe calls
/// to one message type per topic at compile time.
pub struct Topic<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Topic<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Why a receive returned without a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeout {
    /// No message arrived within the timeout.
    Timeout,
    /// The bus shut down and the queue is fully drained.
    Closed,
}

/// Receiving end of one subscription. Yields messages in publish order.
pub struct Subscription<T> {
    topic: &'static str,
    id: u64,
    rx: Receiver<Arc<T>>,
}

impl<T> Subscription<T> {
    /// Blocks up to `timeout` for the next message.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Arc<T>, RecvTimeout> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => RecvTimeout::Timeout,
            RecvTimeoutError::Disconnected => RecvTimeout::Closed,
        })
    }

    /// Returns the next queued message without waiting.
    pub fn try_recv(&self) -> Option<Arc<T>> {
        self.rx.try_recv().ok()
    }

    /// Drains the queue and returns only the most recent message, if any.
    /// Components that only care about the latest state use this on their
    /// side topics.
    pub fn latest(&self) -> Option<Arc<T>> {
        let mut newest = None;
        while let Ok(msg) = self.rx.try_recv() {
            newest = Some(msg);
        }
        newest
    }

    pub fn topic(&self) -> &'static str {
        self.topic
    }

    pub fn subscriber_id(&self) -> u64 {
        self.id
    }

    pub fn queued(&self) -> usize {
        self.rx.len()
    }
}

/// One coalesced drop report, surfaced on `log.events` by the health
/// aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct DropReport {
    pub topic: &'static str,
    pub subscriber_id: u64,
    pub dropped: u64,
    pub policy: OverflowPolicy,
}

struct SubscriberEntry<T> {
    id: u64,
    tx: Sender<Arc<T>>,
    /// Receiver clone used by drop_oldest to evict the head of the queue.
    rx: Receiver<Arc<T>>,
    policy: OverflowPolicy,
}

struct TopicState<T> {
    subscribers: Vec<SubscriberEntry<T>>,
}

#[derive(Default)]
struct DropStat {
    dropped_since_report: u64,
    policy: OverflowPolicy,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::DropNewest
    }
}

/// The pub/sub substrate. Constructed once by the runtime and shared with
/// every component; holds no component state of its own.
pub struct Bus {
    clock: Arc<dyn Clock>,
    topics: Mutex<HashMap<&'static str, Box<dyn Any + Send>>>,
    drops: Mutex<HashMap<(&'static str, u64), DropStat>>,
    last_publish_ns: Mutex<HashMap<&'static str, u64>>,
    next_subscriber_id: AtomicU64,
    total_drops: AtomicU64,
    closed: AtomicBool,
}

impl Bus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            topics: Mutex::new(HashMap::new()),
            drops: Mutex::new(HashMap::new()),
            last_publish_ns: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            total_drops: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn topic_state<T: Send + Sync + 'static>(
        &self,
        topic: &Topic<T>,
    ) -> Arc<Mutex<TopicState<T>>> {
        let mut topics = self.topics.lock().expect("bus topic registry poisoned");
        let entry = topics.entry(topic.name).or_insert_with(|| {
            Box::new(Arc::new(Mutex::new(TopicState::<T> {
                subscribers: Vec::new(),
            })))
        });
        entry
            .downcast_ref::<Arc<Mutex<TopicState<T>>>>()
            .expect("topic registered under two message types")
            .clone()
    }

    /// Subscribes to a topic with a bounded queue. Late subscribers do not
    /// receive backlog.
    pub fn subscribe<T: Send + Sync + 'static>(
        &self,
        topic: &Topic<T>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Result<Subscription<T>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FocusFieldError::BusShutDown);
        }
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(capacity.max(1));
        let state = self.topic_state(topic);
        state
            .lock()
            .expect("bus topic state poisoned")
            .subscribers
            .push(SubscriberEntry {
                id,
                tx,
                rx: rx.clone(),
                policy,
            });
        Ok(Subscription {
            topic: topic.name,
            id,
            rx,
        })
    }

    /// Publishes a message to every current subscriber of `topic`.
    /// Non-blocking; a full queue applies the subscriber's overflow policy.
    /// After shutdown this is a no-op returning an error.
    pub fn publish<T: Send + Sync + 'static>(&self, topic: &Topic<T>, msg: T) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FocusFieldError::BusShutDown);
        }

        self.last_publish_ns
            .lock()
            .expect("bus publish times poisoned")
            .insert(topic.name, self.clock.now_ns());

        let msg = Arc::new(msg);
        let state = self.topic_state(topic);
        let mut state = state.lock().expect("bus topic state poisoned");

        let mut disconnected = Vec::new();
        for entry in &state.subscribers {
            match self.deliver(topic.name, entry, msg.clone()) {
                DeliverOutcome::Delivered => {}
                DeliverOutcome::Dropped => self.record_drop(topic.name, entry.id, entry.policy),
                DeliverOutcome::Disconnected => disconnected.push(entry.id),
            }
        }
        state
            .subscribers
            .retain(|entry| !disconnected.contains(&entry.id));
        Ok(())
    }

    fn deliver<T>(
        &self,
        topic: &'static str,
        entry: &SubscriberEntry<T>,
        msg: Arc<T>,
    ) -> DeliverOutcome {
        match entry.policy {
            OverflowPolicy::DropNewest => match entry.tx.try_send(msg) {
                Ok(()) => DeliverOutcome::Delivered,
                Err(TrySendError::Full(_)) => DeliverOutcome::Dropped,
                Err(TrySendError::Disconnected(_)) => DeliverOutcome::Disconnected,
            },
            OverflowPolicy::DropOldest => match entry.tx.try_send(msg) {
                Ok(()) => DeliverOutcome::Delivered,
                Err(TrySendError::Full(msg)) => {
                    // Evict the head of this subscriber's queue; the evicted
                    // message is the drop.
                    let _ = entry.rx.try_recv();
                    match entry.tx.try_send(msg) {
                        Ok(()) => {
                            self.record_drop(topic, entry.id, entry.policy);
                            DeliverOutcome::Delivered
                        }
                        Err(_) => DeliverOutcome::Dropped,
                    }
                }
                Err(TrySendError::Disconnected(_)) => DeliverOutcome::Disconnected,
            },
            OverflowPolicy::Block => match entry.tx.send_timeout(msg, BLOCK_WAIT) {
                Ok(()) => DeliverOutcome::Delivered,
                Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => DeliverOutcome::Dropped,
                Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                    DeliverOutcome::Disconnected
                }
            },
        }
    }

    fn record_drop(&self, topic: &'static str, subscriber_id: u64, policy: OverflowPolicy) {
        self.total_drops.fetch_add(1, Ordering::Relaxed);
        let mut drops = self.drops.lock().expect("bus drop stats poisoned");
        let stat = drops.entry((topic, subscriber_id)).or_default();
        stat.dropped_since_report += 1;
        stat.policy = policy;
    }

    /// Takes all coalesced drop reports accumulated since the previous call.
    /// The caller's cadence is the coalescing window.
    pub fn drain_drop_reports(&self) -> Vec<DropReport> {
        let mut drops = self.drops.lock().expect("bus drop stats poisoned");
        let mut reports = Vec::new();
        for (&(topic, subscriber_id), stat) in drops.iter_mut() {
            if stat.dropped_since_report > 0 {
                reports.push(DropReport {
                    topic,
                    subscriber_id,
                    dropped: stat.dropped_since_report,
                    policy: stat.policy,
                });
                stat.dropped_since_report = 0;
            }
        }
        reports.sort_by_key(|r| (r.topic, r.subscriber_id));
        reports
    }

    /// Total messages dropped since startup, across all subscribers.
    pub fn total_drops(&self) -> u64 {
        // drain_drop_reports resets the per-report counters, so keep a
        // separate running total.
        self.total_drops.load(Ordering::Relaxed)
    }

    /// Age in milliseconds of the last publish per known topic.
    pub fn topic_ages_ms(&self, now_ns: u64) -> Vec<(&'static str, u64)> {
        let times = self
            .last_publish_ns
            .lock()
            .expect("bus publish times poisoned");
        let mut ages: Vec<_> = times
            .iter()
            .map(|(&topic, &t_ns)| (topic, now_ns.saturating_sub(t_ns) / 1_000_000))
            .collect();
        ages.sort_by_key(|&(topic, _)| topic);
        ages
    }

    /// Signals all receive handles to terminate after draining queued
    /// messages. Subsequent publishes return an error.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping every sender lets receivers drain what is queued and
        // then observe disconnection.
        self.topics
            .lock()
            .expect("bus topic registry poisoned")
            .clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

enum DeliverOutcome {
    Delivered,
    Dropped,
    Disconnected,
}
