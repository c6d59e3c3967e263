//! Target lock state machine.
//!
//! Selects one talker and stabilizes the selection with hysteresis: separate
//! acquire and drop thresholds, a hold window over brief silences, and a
//! challenger margin plus minimum interval before the lock hands off. All
//! timing runs on candidate-batch message time, never the wall clock, so a
//! replayed input stream reproduces every transition.

use crate::config::LockConfig;
use crate::error::{FocusFieldError, Result};
use crate::messages::{
    AssociationCandidate, CandidateBatch, LockMode, LockStability, LockState, TargetLock,
    VoiceActivity, angular_distance_deg, wrap_deg,
};

/// Bearing tolerance for re-identifying an audio-only candidate as the
/// current target or challenger across ticks.
const AUDIO_MATCH_DEG: f32 = 20.0;

#[derive(Debug, Clone)]
struct Target {
    id: Option<String>,
    bearing_deg: f32,
    score: f32,
    has_doa: bool,
}

#[derive(Debug, Clone)]
struct Contender {
    id: Option<String>,
    bearing_deg: f32,
    since_t_ns: u64,
}

pub struct LockStateMachine {
    config: LockConfig,
    state: LockState,
    seq: u64,
    target: Option<Target>,
    acquire: Option<Contender>,
    challenger: Option<Contender>,
    hold_start_t_ns: Option<u64>,
    lock_started_t_ns: Option<u64>,
    last_commit_t_ns: Option<u64>,
    ticks_in_state: u64,
    handoff_count: u64,
}

impl LockStateMachine {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            state: LockState::NoLock,
            seq: 0,
            target: None,
            acquire: None,
            challenger: None,
            hold_start_t_ns: None,
            lock_started_t_ns: None,
            last_commit_t_ns: None,
            ticks_in_state: 0,
            handoff_count: 0,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    /// One tick. Transitions are evaluated in table order; the first
    /// matching rule fires.
    pub fn update(
        &mut self,
        batch: &CandidateBatch,
        vad: Option<&VoiceActivity>,
    ) -> Result<TargetLock> {
        let t_ns = batch.t_ns;
        let speech = vad.map(|v| v.speech).unwrap_or(false);
        let prev_state = self.state;

        // Guard before ticking so a corrupted state surfaces as a fault
        // instead of unwinding inside a handler.
        self.check_invariants()?;

        let reason = match self.state {
            LockState::NoLock => self.tick_no_lock(batch, vad, speech),
            LockState::Acquire => self.tick_acquire(batch, t_ns),
            LockState::Locked => self.tick_locked(batch, t_ns, speech),
            LockState::Hold => self.tick_hold(batch, t_ns),
            LockState::Handoff => self.tick_handoff(batch, t_ns),
        };

        if self.state == prev_state {
            self.ticks_in_state += 1;
        } else {
            self.ticks_in_state = 1;
        }

        self.seq += 1;
        let mode = self.mode(batch);
        Ok(TargetLock {
            t_ns,
            seq: self.seq,
            state: self.state,
            mode,
            target_id: self.target.as_ref().and_then(|t| t.id.clone()),
            target_bearing_deg: self.target.as_ref().map(|t| wrap_deg(t.bearing_deg)),
            confidence: self.target.as_ref().map(|t| t.score).unwrap_or(0.0),
            reason,
            stability: LockStability {
                ticks_in_state: self.ticks_in_state,
                lock_age_ms: self
                    .lock_started_t_ns
                    .filter(|_| self.target.is_some())
                    .map(|start| t_ns.saturating_sub(start) / 1_000_000)
                    .unwrap_or(0),
                handoff_count: self.handoff_count,
            },
        })
    }

    fn tick_no_lock(
        &mut self,
        batch: &CandidateBatch,
        vad: Option<&VoiceActivity>,
        speech: bool,
    ) -> String {
        let Some(best) = batch.candidates.first() else {
            return "idle".to_string();
        };
        let speaking = best.components.mouth >= self.config.speaking_on || speech;
        let vad_ok = !self.config.require_vad || vad.is_none() || speech;
        if speaking && vad_ok {
            self.state = LockState::Acquire;
            self.acquire = Some(Contender {
                id: best.track_id.clone(),
                bearing_deg: best.bearing_deg,
                since_t_ns: batch.t_ns,
            });
            "acquire_start".to_string()
        } else {
            "idle".to_string()
        }
    }

    fn tick_acquire(&mut self, batch: &CandidateBatch, t_ns: u64) -> String {
        let acquire = self.acquire.clone().expect("ACQUIRE holds a contender");
        let best = batch.candidates.first();
        let same = best.is_some_and(|b| identity_matches(b, &acquire.id, acquire.bearing_deg));
        if !same {
            self.state = LockState::NoLock;
            self.acquire = None;
            return "acquire_lost".to_string();
        }
        let best = best.expect("checked above");

        let dwell_ns = self.config.acquire_dwell_ms * 1_000_000;
        if best.combined_score >= self.config.acquire_threshold
            && t_ns.saturating_sub(acquire.since_t_ns) >= dwell_ns
        {
            self.state = LockState::Locked;
            self.acquire = None;
            self.target = Some(Target {
                id: best.track_id.clone(),
                bearing_deg: best.bearing_deg,
                score: best.combined_score,
                has_doa: best.doa_peak_deg.is_some(),
            });
            self.lock_started_t_ns = Some(t_ns);
            self.last_commit_t_ns = Some(t_ns);
            match (&best.track_id, best.doa_peak_deg) {
                (Some(_), Some(_)) => "acquired: high AV agreement",
                (Some(_), None) => "acquired: face only",
                (None, _) => "acquired: audio fallback",
            }
            .to_string()
        } else {
            // Track the contender's bearing while dwelling.
            if let Some(acquire) = &mut self.acquire {
                acquire.bearing_deg = best.bearing_deg;
            }
            "acquiring".to_string()
        }
    }

    fn tick_locked(&mut self, batch: &CandidateBatch, t_ns: u64, speech: bool) -> String {
        match self.resolve_target(batch) {
            Some(cand) if cand.combined_score >= self.config.drop_threshold => {
                let cand = cand.clone();
                if let Some(challenger) = self.find_challenger(batch, cand.combined_score) {
                    self.state = LockState::Handoff;
                    self.challenger = Some(Contender {
                        id: challenger.track_id.clone(),
                        bearing_deg: challenger.bearing_deg,
                        since_t_ns: t_ns,
                    });
                    self.refresh_target(&cand);
                    "handoff: challenger dominating".to_string()
                } else {
                    self.refresh_target(&cand);
                    "tracking".to_string()
                }
            }
            Some(_) => {
                self.state = LockState::Hold;
                self.hold_start_t_ns = Some(t_ns);
                "hold: score below drop threshold".to_string()
            }
            None => {
                if batch.candidates.is_empty() || !speech {
                    self.state = LockState::Hold;
                    self.hold_start_t_ns = Some(t_ns);
                    "hold: silence".to_string()
                } else {
                    // Track lost with speech elsewhere and no audio fallback
                    // at the target bearing.
                    self.state = LockState::NoLock;
                    self.clear_target();
                    "dropped: track lost".to_string()
                }
            }
        }
    }

    fn tick_hold(&mut self, batch: &CandidateBatch, t_ns: u64) -> String {
        if let Some(cand) = self.resolve_target(batch)
            && cand.combined_score >= self.config.drop_threshold
        {
            let cand = cand.clone();
            self.state = LockState::Locked;
            self.hold_start_t_ns = None;
            self.refresh_target(&cand);
            return "resumed from hold".to_string();
        }
        let hold_start = self.hold_start_t_ns.expect("HOLD records its start");
        if t_ns.saturating_sub(hold_start) > self.config.hold_ms * 1_000_000 {
            self.state = LockState::NoLock;
            self.clear_target();
            "dropped: silence timeout".to_string()
        } else {
            "holding".to_string()
        }
    }

    fn tick_handoff(&mut self, batch: &CandidateBatch, t_ns: u64) -> String {
        let challenger = self.challenger.clone().expect("HANDOFF holds a challenger");
        let target_score = self
            .resolve_target(batch)
            .map(|c| c.combined_score)
            .unwrap_or(0.0);
        let challenger_cand = batch
            .candidates
            .iter()
            .find(|c| identity_matches(c, &challenger.id, challenger.bearing_deg))
            .cloned();

        let dominating = challenger_cand
            .as_ref()
            .is_some_and(|c| c.combined_score > target_score + self.config.handoff_margin);
        if !dominating {
            self.state = LockState::Locked;
            self.challenger = None;
            return "handoff reverted".to_string();
        }

        let min_ns = self.config.handoff_min_ms * 1_000_000;
        let dominated_long_enough = t_ns.saturating_sub(challenger.since_t_ns) >= min_ns;
        let commit_spacing_ok = self
            .last_commit_t_ns
            .is_none_or(|last| t_ns.saturating_sub(last) >= min_ns);
        if dominated_long_enough && commit_spacing_ok {
            let cand = challenger_cand.expect("dominance implies presence");
            self.state = LockState::Locked;
            self.challenger = None;
            self.target = Some(Target {
                id: cand.track_id.clone(),
                bearing_deg: cand.bearing_deg,
                score: cand.combined_score,
                has_doa: cand.doa_peak_deg.is_some(),
            });
            self.lock_started_t_ns = Some(t_ns);
            self.last_commit_t_ns = Some(t_ns);
            self.handoff_count += 1;
            "handoff committed".to_string()
        } else {
            if let Some(challenger) = &mut self.challenger
                && let Some(cand) = &challenger_cand
            {
                challenger.bearing_deg = cand.bearing_deg;
            }
            "handoff pending".to_string()
        }
    }

    /// Finds the current target in the batch. An exact id match wins; a
    /// target whose face vanished continues through an audio-only candidate
    /// near its bearing (the lock degrades to AUDIO_ONLY instead of
    /// collapsing).
    fn resolve_target<'a>(&self, batch: &'a CandidateBatch) -> Option<&'a AssociationCandidate> {
        let target = self.target.as_ref()?;
        if let Some(id) = &target.id
            && let Some(cand) = batch
                .candidates
                .iter()
                .find(|c| c.track_id.as_deref() == Some(id.as_str()))
        {
            return Some(cand);
        }
        batch.candidates.iter().find(|c| {
            c.is_audio_only()
                && angular_distance_deg(c.bearing_deg, target.bearing_deg) <= AUDIO_MATCH_DEG
        })
    }

    fn find_challenger<'a>(
        &self,
        batch: &'a CandidateBatch,
        target_score: f32,
    ) -> Option<&'a AssociationCandidate> {
        let target = self.target.as_ref()?;
        batch
            .candidates
            .iter()
            .find(|c| {
                !identity_matches(c, &target.id, target.bearing_deg)
                    && c.combined_score > target_score + self.config.handoff_margin
            })
    }

    /// Refreshes the tracked target from its current candidate, smoothing
    /// the bearing along the shortest arc.
    fn refresh_target(&mut self, cand: &AssociationCandidate) {
        let alpha = self.config.bearing_smoothing_alpha;
        let target = self.target.as_mut().expect("refresh requires a target");
        let delta = shortest_arc_deg(target.bearing_deg, cand.bearing_deg);
        target.bearing_deg = wrap_deg(target.bearing_deg + alpha * delta);
        target.score = cand.combined_score;
        target.has_doa = cand.doa_peak_deg.is_some();
        // Vision loss degrades the identity to audio-only; a returning face
        // with the original id restores it via resolve_target's id match.
        target.id = cand.track_id.clone();
    }

    fn clear_target(&mut self) {
        self.target = None;
        self.acquire = None;
        self.challenger = None;
        self.hold_start_t_ns = None;
        self.lock_started_t_ns = None;
    }

    fn mode(&self, batch: &CandidateBatch) -> LockMode {
        match self.state {
            LockState::NoLock | LockState::Acquire => LockMode::NoLock,
            LockState::Locked | LockState::Hold | LockState::Handoff => {
                match self.target.as_ref() {
                    None => LockMode::NoLock,
                    Some(target) if target.id.is_none() => LockMode::AudioOnly,
                    Some(target) if !target.has_doa || batch.doa_low_confidence => {
                        LockMode::VisionOnly
                    }
                    Some(_) => LockMode::AvLock,
                }
            }
        }
    }

    /// Impossible-state guards. A hit here is a programming fault: the
    /// caller writes a crash dump and requests shutdown.
    fn check_invariants(&self) -> Result<()> {
        let fault = |message: &str| {
            Err(FocusFieldError::InvariantViolation {
                module: "fusion.lock".to_string(),
                message: message.to_string(),
            })
        };
        match self.state {
            LockState::NoLock if self.target.is_some() => fault("NO_LOCK with a target"),
            LockState::Locked | LockState::Hold | LockState::Handoff if self.target.is_none() => {
                fault("locked state without a target")
            }
            LockState::Acquire if self.acquire.is_none() => fault("ACQUIRE without a contender"),
            LockState::Handoff if self.challenger.is_none() => {
                fault("HANDOFF without a challenger")
            }
            LockState::Hold if self.hold_start_t_ns.is_none() => fault("HOLD without a start time"),
            _ => Ok(()),
        }
    }

    /// Serializable state snapshot for crash dumps.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state,
            "seq": self.seq,
            "target_id": self.target.as_ref().and_then(|t| t.id.clone()),
            "target_bearing_deg": self.target.as_ref().map(|t| t.bearing_deg),
            "ticks_in_state": self.ticks_in_state,
            "handoff_count": self.handoff_count,
        })
    }
}

fn identity_matches(
    cand: &AssociationCandidate,
    id: &Option<String>,
    bearing_deg: f32,
) -> bool {
    match (&cand.track_id, id) {
        (Some(a), Some(b)) => a == b,
        (None, None) => angular_distance_deg(cand.bearing_deg, bearing_deg) <= AUDIO_MATCH_DEG,
        // A face candidate can continue an audio-only identity at the same
        // bearing (vision recovering), but not the other way around here;
        // audio continuation of a lost face goes through resolve_target.
        (Some(_), None) => angular_distance_deg(cand.bearing_deg, bearing_deg) <= AUDIO_MATCH_DEG,
        (None, Some(_)) => false,
    }
}

/// Signed shortest arc from `from` to `to`, in (-180, 180].
fn shortest_arc_deg(from: f32, to: f32) -> f32 {
    let mut delta = wrap_deg(to) - wrap_deg(from);
    if delta > 180.0 {
        delta -= 360.0;
    } else if delta <= -180.0 {
        delta += 360.0;
    }
    delta
}
