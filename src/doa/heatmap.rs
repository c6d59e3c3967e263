//! Heatmap post-processing: normalization, temporal smoothing, peak picking.

use crate::messages::{DoaPeak, angular_distance_deg};

const FLAT_EPS: f32 = 1e-9;

/// Smoothing and peak extraction state carried across DOA updates.
pub struct HeatmapPost {
    bin_size_deg: f32,
    alpha: f32,
    top_k: usize,
    min_separation_deg: f32,
    prev: Option<Vec<f32>>,
}

impl HeatmapPost {
    pub fn new(bin_size_deg: f32, alpha: f32, top_k: usize) -> Self {
        Self {
            bin_size_deg,
            alpha,
            top_k,
            min_separation_deg: (3.0 * bin_size_deg).max(10.0),
            prev: None,
        }
    }

    pub fn min_separation_deg(&self) -> f32 {
        self.min_separation_deg
    }

    /// Normalizes raw steered power in place: subtract min (wide-band noise
    /// pushes scores negative), then scale so max == 1. A flat map becomes
    /// all zeros.
    pub fn normalize(scores: &mut [f32]) {
        let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !(max - min > FLAT_EPS) {
            scores.fill(0.0);
            return;
        }
        let span = max - min;
        for s in scores.iter_mut() {
            *s = (*s - min) / span;
        }
    }

    /// Per-bin EMA against the previous update, then renormalize so the
    /// invariant max == 1 holds after smoothing.
    pub fn smooth(&mut self, scores: &mut Vec<f32>) {
        if let Some(prev) = &self.prev
            && prev.len() == scores.len()
        {
            for (s, &p) in scores.iter_mut().zip(prev.iter()) {
                *s = (1.0 - self.alpha) * *s + self.alpha * p;
            }
        }
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max > FLAT_EPS {
            for s in scores.iter_mut() {
                *s /= max;
            }
        } else {
            scores.fill(0.0);
        }
        self.prev = Some(scores.clone());
    }

    /// Up to `top_k` circular local maxima separated by at least the minimum
    /// angular distance. Ties break toward the higher raw score, then the
    /// smaller angle.
    pub fn pick_peaks(&self, smoothed: &[f32], raw: &[f32]) -> Vec<DoaPeak> {
        let n = smoothed.len();
        if n == 0 {
            return Vec::new();
        }

        let mut maxima: Vec<usize> = (0..n)
            .filter(|&i| {
                let left = smoothed[(i + n - 1) % n];
                let right = smoothed[(i + 1) % n];
                smoothed[i] > FLAT_EPS && smoothed[i] > left && smoothed[i] >= right
            })
            .collect();

        maxima.sort_by(|&a, &b| {
            smoothed[b]
                .partial_cmp(&smoothed[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    raw[b]
                        .partial_cmp(&raw[a])
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.cmp(&b))
        });

        let mut peaks: Vec<DoaPeak> = Vec::new();
        for i in maxima {
            let angle = i as f32 * self.bin_size_deg;
            let separated = peaks
                .iter()
                .all(|p| angular_distance_deg(p.angle_deg, angle) >= self.min_separation_deg);
            if separated {
                peaks.push(DoaPeak {
                    angle_deg: angle,
                    score: smoothed[i],
                });
                if peaks.len() == self.top_k {
                    break;
                }
            }
        }
        peaks
    }

    /// Confidence from the peak-to-mean ratio. With max normalized to 1 this
    /// collapses to 1 - mean: flat maps score 0, a single sharp peak
    /// approaches 1.
    pub fn confidence(smoothed: &[f32]) -> f32 {
        let max = smoothed.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !(max > FLAT_EPS) {
            return 0.0;
        }
        let mean = smoothed.iter().sum::<f32>() / smoothed.len() as f32;
        (1.0 - mean / max).clamp(0.0, 1.0)
    }

    /// Resets the smoothing history (used when the input stream restarts).
    pub fn reset(&mut self) {
        self.prev = None;
    }
}
