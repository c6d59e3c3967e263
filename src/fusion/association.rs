//! Audio-visual association.
//!
//! Pairs each DOA peak with at most one face track by angular proximity and
//! emits one scored candidate batch per tick, best first. Unmatched peaks
//! become audio-only candidates only while speech is present and the face
//! feed is stale or absent. An empty batch is still a batch: the lock
//! machine needs the heartbeat.

use crate::config::FusionConfig;
use crate::messages::{
    AssociationCandidate, BoundingBox, CandidateBatch, DoaHeatmap, FaceTrack, ScoreComponents,
    VoiceActivity, angular_distance_deg, wrap_deg,
};

pub struct Associator {
    config: FusionConfig,
    seq: u64,
    last_emit_t_ns: Option<u64>,
}

impl Associator {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            seq: 0,
            last_emit_t_ns: None,
        }
    }

    /// Rate limit check against `fusion.update_hz`, driven by message time.
    pub fn due(&self, t_ns: u64) -> bool {
        match self.last_emit_t_ns {
            None => true,
            Some(last) => {
                t_ns.saturating_sub(last) >= (1_000_000_000.0 / self.config.update_hz) as u64
            }
        }
    }

    /// One association tick over the most recent inputs.
    ///
    /// `faces` carries the latest face-track batch and its arrival
    /// timestamp; batches older than `faces_max_age_ms` are rejected.
    pub fn tick(
        &mut self,
        t_ns: u64,
        heatmap: Option<&DoaHeatmap>,
        faces: Option<(&[FaceTrack], u64)>,
        vad: Option<&VoiceActivity>,
    ) -> CandidateBatch {
        self.last_emit_t_ns = Some(t_ns);
        self.seq += 1;

        let faces_fresh = faces
            .map(|(_, face_t_ns)| {
                t_ns.saturating_sub(face_t_ns) <= self.config.faces_max_age_ms * 1_000_000
            })
            .unwrap_or(false);
        let tracks: &[FaceTrack] = if faces_fresh {
            faces.map(|(tracks, _)| tracks).unwrap_or(&[])
        } else {
            &[]
        };
        let speech = vad.map(|v| v.speech).unwrap_or(false);

        let mut candidates = Vec::new();
        let low_confidence = heatmap.map(|h| h.low_confidence).unwrap_or(false);

        if let Some(heatmap) = heatmap {
            candidates = self.match_peaks(t_ns, heatmap, tracks, speech, faces_fresh);
        }

        candidates.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.angular_distance_deg
                        .partial_cmp(&b.angular_distance_deg)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        CandidateBatch {
            t_ns,
            seq: self.seq,
            doa_low_confidence: low_confidence,
            candidates,
        }
    }

    fn match_peaks(
        &self,
        t_ns: u64,
        heatmap: &DoaHeatmap,
        tracks: &[FaceTrack],
        speech: bool,
        faces_fresh: bool,
    ) -> Vec<AssociationCandidate> {
        // Every gated (peak, track) pairing, scored.
        let mut pairings: Vec<(usize, usize, f32, ScoreComponents, f32)> = Vec::new();
        for (p_idx, peak) in heatmap.peaks.iter().enumerate() {
            for (f_idx, track) in tracks.iter().enumerate() {
                let distance = angular_distance_deg(peak.angle_deg, track.bearing_deg);
                if distance > self.config.max_assoc_deg {
                    continue;
                }
                let components = ScoreComponents {
                    mouth: track.mouth_activity.clamp(0.0, 1.0),
                    face_conf: track.confidence.clamp(0.0, 1.0),
                    doa_peak: peak.score.clamp(0.0, 1.0),
                };
                let combined = self.combine(&components, true) * self.face_area_scale(&track.bbox);
                pairings.push((p_idx, f_idx, distance, components, combined));
            }
        }

        // Greedy by descending combined score; each peak and each track is
        // assigned at most once.
        pairings.sort_by(|a, b| {
            b.4.partial_cmp(&a.4)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.0.cmp(&b.0))
        });

        let mut peak_taken = vec![false; heatmap.peaks.len()];
        let mut track_taken = vec![false; tracks.len()];
        let mut candidates = Vec::new();
        for (p_idx, f_idx, distance, components, combined) in pairings {
            if peak_taken[p_idx] || track_taken[f_idx] {
                continue;
            }
            peak_taken[p_idx] = true;
            track_taken[f_idx] = true;
            let track = &tracks[f_idx];
            candidates.push(AssociationCandidate {
                t_ns,
                seq: self.seq,
                track_id: Some(track.track_id.clone()),
                bearing_deg: wrap_deg(track.bearing_deg),
                doa_peak_deg: Some(wrap_deg(heatmap.peaks[p_idx].angle_deg)),
                angular_distance_deg: distance,
                components,
                combined_score: combined,
            });
        }

        // Audio-only fallback for leftover peaks: only while speech is
        // present and no fresh faces could claim them.
        if speech && !faces_fresh {
            for (p_idx, peak) in heatmap.peaks.iter().enumerate() {
                if peak_taken[p_idx] {
                    continue;
                }
                let components = ScoreComponents {
                    mouth: 0.0,
                    face_conf: 0.0,
                    doa_peak: peak.score.clamp(0.0, 1.0),
                };
                candidates.push(AssociationCandidate {
                    t_ns,
                    seq: self.seq,
                    track_id: None,
                    bearing_deg: wrap_deg(peak.angle_deg),
                    doa_peak_deg: Some(wrap_deg(peak.angle_deg)),
                    angular_distance_deg: 0.0,
                    components,
                    combined_score: self.combine(&components, false),
                });
            }
        }

        candidates
    }

    /// Size scale for a face-backed pairing: area at or below
    /// `min_face_area_px` scores zero, ramping linearly to full weight at
    /// `face_area_soft_max_px`. Tiny boxes are usually spurious detections
    /// or faces too distant to be the active talker.
    fn face_area_scale(&self, bbox: &BoundingBox) -> f32 {
        let min_area = self.config.min_face_area_px;
        let soft_max = self.config.face_area_soft_max_px;
        if soft_max <= min_area {
            return 1.0;
        }
        ((bbox.w * bbox.h - min_area) / (soft_max - min_area)).clamp(0.0, 1.0)
    }

    /// Weighted sum over the components that are actually present. For
    /// audio-only candidates the mouth/face weights are renormalized away,
    /// so a strong lone peak is not capped at the DOA weight.
    fn combine(&self, components: &ScoreComponents, has_face: bool) -> f32 {
        let w = &self.config.weights;
        if has_face {
            let sum = w.sum().max(f32::EPSILON);
            ((w.mouth * components.mouth
                + w.face * components.face_conf
                + w.doa * components.doa_peak)
                / sum)
                .clamp(0.0, 1.0)
        } else {
            components.doa_peak.clamp(0.0, 1.0)
        }
    }
}
