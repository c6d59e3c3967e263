//! GCC-PHAT fallback for degenerate array geometry.
//!
//! When the geometry cannot support a full steered scan (coincident or
//! collinear mics), a single canonical pair still yields a pairwise delay
//! estimate. The fallback emits a broad single peak at the best-matching
//! azimuth with confidence zero, so downstream consumers keep receiving a
//! continuous heatmap feed.

use realfft::num_complex::Complex;

use crate::doa::geometry::ArrayGeometry;
use crate::doa::srp_phat::SrpPhatEngine;
use crate::messages::angular_distance_deg;

/// Width of the emitted bump in degrees.
const BUMP_SIGMA_DEG: f32 = 20.0;

const FLAT_EPS: f32 = 1e-9;

pub struct GccPhatFallback {
    pair: (usize, usize),
    /// Single-pair steered scan: SRP-PHAT restricted to the canonical pair.
    engine: SrpPhatEngine,
    bin_size_deg: f32,
}

impl GccPhatFallback {
    pub fn new(geometry: &ArrayGeometry, bin_count: usize, bin_size_deg: f32) -> Self {
        let pair = geometry.widest_pair();
        let pair_geometry = ArrayGeometry::new(
            vec![geometry.position(pair.0), geometry.position(pair.1)],
            geometry.speed_of_sound(),
        )
        .expect("canonical pair from a validated geometry");
        Self {
            pair,
            engine: SrpPhatEngine::new(&pair_geometry, bin_count, bin_size_deg),
            bin_size_deg,
        }
    }

    pub fn pair(&self) -> (usize, usize) {
        self.pair
    }

    /// Raw steered power over the canonical pair only. The two pair
    /// channels are picked out of the full spectra set.
    pub fn steered_power(
        &self,
        spectra: &[Vec<Complex<f32>>],
        freq_bins: &[(usize, f32)],
    ) -> Vec<f32> {
        let pair_spectra = [spectra[self.pair.0].clone(), spectra[self.pair.1].clone()];
        self.engine.steered_power(&pair_spectra, freq_bins)
    }

    /// Replaces the pairwise scan with a broad Gaussian bump centered on the
    /// best azimuth (ties resolve to the smaller angle). A flat scan stays
    /// flat: all zeros, no bump.
    pub fn broaden(&self, scores: &[f32]) -> Vec<f32> {
        let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !(max - min > FLAT_EPS) {
            return vec![0.0; scores.len()];
        }
        let best_bin = scores
            .iter()
            .enumerate()
            .max_by(|a, b| {
                a.1.partial_cmp(b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.0.cmp(&a.0))
            })
            .map(|(b, _)| b)
            .unwrap_or(0);
        let center_deg = best_bin as f32 * self.bin_size_deg;
        scores
            .iter()
            .enumerate()
            .map(|(b, _)| {
                let d = angular_distance_deg(b as f32 * self.bin_size_deg, center_deg);
                (-0.5 * (d / BUMP_SIGMA_DEG).powi(2)).exp()
            })
            .collect()
    }
}
