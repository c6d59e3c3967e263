//! Microphone array geometry and steering delays.
//!
//! Azimuth convention: 0 degrees along +x (the device reference direction),
//! increasing clockwise in the array plane, so `u(theta) = (cos t, -sin t)`.

use crate::error::{FocusFieldError, Result};
use crate::messages::wrap_deg;

/// Positions below this separation are treated as coincident.
const COINCIDENT_EPS_M: f32 = 1e-4;

/// Why a geometry cannot drive the full SRP-PHAT scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degeneracy {
    /// Fewer than two microphones with distinct positions.
    TooFewMics,
    /// All microphones lie on one line; only a pairwise fallback is usable.
    Collinear,
}

/// Mic positions in meters, one [x, y] per channel, array plane only.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayGeometry {
    positions_m: Vec<[f32; 2]>,
    speed_of_sound_mps: f32,
}

impl ArrayGeometry {
    pub fn new(positions_m: Vec<[f32; 2]>, speed_of_sound_mps: f32) -> Result<Self> {
        if positions_m.is_empty() {
            return Err(FocusFieldError::GeometryInvalid {
                message: "no microphone positions".to_string(),
            });
        }
        if !(speed_of_sound_mps > 0.0) {
            return Err(FocusFieldError::GeometryInvalid {
                message: format!("speed of sound must be positive, got {speed_of_sound_mps}"),
            });
        }
        Ok(Self {
            positions_m,
            speed_of_sound_mps,
        })
    }

    pub fn channels(&self) -> usize {
        self.positions_m.len()
    }

    pub fn speed_of_sound(&self) -> f32 {
        self.speed_of_sound_mps
    }

    pub fn position(&self, channel: usize) -> [f32; 2] {
        self.positions_m[channel]
    }

    /// Unit vector toward azimuth `theta_deg` (clockwise convention).
    pub fn unit_vector(theta_deg: f32) -> [f32; 2] {
        let rad = wrap_deg(theta_deg).to_radians();
        [rad.cos(), -rad.sin()]
    }

    /// Per-channel arrival delay in seconds for a plane wave from
    /// `theta_deg`: d_i = (r_i . u(theta)) / c.
    pub fn delay_s(&self, channel: usize, theta_deg: f32) -> f32 {
        let u = Self::unit_vector(theta_deg);
        let r = self.positions_m[channel];
        (r[0] * u[0] + r[1] * u[1]) / self.speed_of_sound_mps
    }

    /// Expected inter-mic delay tau_ij(theta) = d_i - d_j.
    pub fn pair_delay_s(&self, i: usize, j: usize, theta_deg: f32) -> f32 {
        self.delay_s(i, theta_deg) - self.delay_s(j, theta_deg)
    }

    /// Largest pairwise separation in meters.
    pub fn aperture_m(&self) -> f32 {
        let mut max = 0.0f32;
        for i in 0..self.positions_m.len() {
            for j in (i + 1)..self.positions_m.len() {
                max = max.max(self.separation_m(i, j));
            }
        }
        max
    }

    /// The widest-separated mic pair; the canonical pair for the GCC-PHAT
    /// fallback.
    pub fn widest_pair(&self) -> (usize, usize) {
        let mut best = (0, self.positions_m.len().saturating_sub(1).max(0));
        let mut best_sep = -1.0f32;
        for i in 0..self.positions_m.len() {
            for j in (i + 1)..self.positions_m.len() {
                let sep = self.separation_m(i, j);
                if sep > best_sep {
                    best_sep = sep;
                    best = (i, j);
                }
            }
        }
        best
    }

    fn separation_m(&self, i: usize, j: usize) -> f32 {
        let a = self.positions_m[i];
        let b = self.positions_m[j];
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
    }

    /// Degeneracy classification. A full 360-degree SRP scan needs at least
    /// two distinct positions off a single line; anything less falls back
    /// to the canonical-pair GCC-PHAT path.
    pub fn degeneracy(&self) -> Option<Degeneracy> {
        let distinct: Vec<[f32; 2]> = {
            let mut seen: Vec<[f32; 2]> = Vec::new();
            for &p in &self.positions_m {
                if !seen.iter().any(|&q| {
                    ((p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2)).sqrt() < COINCIDENT_EPS_M
                }) {
                    seen.push(p);
                }
            }
            seen
        };
        if distinct.len() < 2 {
            return Some(Degeneracy::TooFewMics);
        }
        if distinct.len() == 2 {
            return Some(Degeneracy::Collinear);
        }
        // Cross products against the first edge; all near zero means one line.
        let a = distinct[0];
        let b = distinct[1];
        let edge = [b[0] - a[0], b[1] - a[1]];
        let collinear = distinct[2..].iter().all(|p| {
            let v = [p[0] - a[0], p[1] - a[1]];
            (edge[0] * v[1] - edge[1] * v[0]).abs() < COINCIDENT_EPS_M
        });
        collinear.then_some(Degeneracy::Collinear)
    }
}
