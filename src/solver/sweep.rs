//! The (FOV, distortion) hypothesis grid searched by the matcher.

use std::f32::consts::PI;

use super::config::{DistortionSearch, SolveConfig};
use super::database::DatabaseProperties;

/// One hypothesis of the sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    /// Position in sweep order; lower is tried first and wins ties.
    pub index: usize,
    pub fov_rad: f32,
    pub distortion_k: f32,
}

/// Finite, restartable iterator over sweep points.
///
/// Distortion coefficients form the outer loop and FOVs the inner one; both
/// start at their centre value and alternate outward.
#[derive(Debug, Clone)]
pub struct SweepGrid {
    fovs: Vec<f32>,
    ks: Vec<f32>,
    next: usize,
}

impl SweepGrid {
    /// FOVs `center ± n·step` within `half_width`, with
    /// `step = max(2 × match_radius_tolerance × center, 0.001°)`.
    ///
    /// Only FOVs strictly between 0 and 180° are produced; a centre outside
    /// that range gives an empty grid.
    pub fn new(
        center_fov_rad: f32,
        half_width_rad: f32,
        match_radius_tolerance: f32,
        distortion: DistortionSearch,
    ) -> Self {
        let valid = |fov: f32| fov > 0.0 && fov < PI;
        let mut fovs = Vec::new();
        if valid(center_fov_rad) {
            fovs.push(center_fov_rad);
            let step = (2.0 * match_radius_tolerance * center_fov_rad).max(0.001_f32.to_radians());
            let half_width = half_width_rad.min(PI);
            let mut n = 1u32;
            loop {
                let offset = step * n as f32;
                if !(offset <= half_width) {
                    break;
                }
                let (above, below) = (center_fov_rad + offset, center_fov_rad - offset);
                if !valid(above) && !valid(below) {
                    break;
                }
                if valid(above) {
                    fovs.push(above);
                }
                if valid(below) {
                    fovs.push(below);
                }
                n += 1;
            }
        }
        Self {
            fovs,
            ks: distortion_values(distortion),
            next: 0,
        }
    }

    /// Grid for a solve: the configured estimate, or the database FOV range.
    pub fn for_solve(config: &SolveConfig, properties: &DatabaseProperties) -> Self {
        let (center, half_width) = match config.field_of_view_estimate_deg {
            Some(est) => (
                est.to_radians(),
                config.field_of_view_max_error_deg.unwrap_or(0.0).to_radians(),
            ),
            None => (
                0.5 * (properties.min_fov_rad + properties.max_fov_rad),
                0.5 * (properties.max_fov_rad - properties.min_fov_rad),
            ),
        };
        Self::new(center, half_width, config.match_radius_tolerance, config.distortion)
    }

    pub fn fov_values(&self) -> &[f32] {
        &self.fovs
    }

    pub fn distortion_values(&self) -> &[f32] {
        &self.ks
    }
}

/// Coefficients of a distortion search, centre first then alternating outward.
fn distortion_values(search: DistortionSearch) -> Vec<f32> {
    match search {
        DistortionSearch::Fixed(k) => vec![k],
        DistortionSearch::Range { min, max, steps } => {
            let steps = steps.max(1) as usize;
            if steps == 1 || min == max {
                return vec![0.5 * (min + max)];
            }
            let values: Vec<f32> = (0..steps)
                .map(|i| min + (max - min) * i as f32 / (steps - 1) as f32)
                .collect();
            // Spiral out from the middle index; upper neighbour first
            let mid = (steps - 1) / 2;
            let mut order = vec![values[mid]];
            for d in 1..steps {
                if mid + d < steps {
                    order.push(values[mid + d]);
                }
                if d <= mid {
                    order.push(values[mid - d]);
                }
            }
            order
        }
    }
}

impl Iterator for SweepGrid {
    type Item = SweepPoint;

    fn next(&mut self) -> Option<SweepPoint> {
        let index = self.next;
        let nf = self.fovs.len();
        if index >= nf * self.ks.len() {
            return None;
        }
        self.next += 1;
        Some(SweepPoint {
            index,
            fov_rad: self.fovs[index % nf],
            distortion_k: self.ks[index / nf],
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.fovs.len() * self.ks.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SweepGrid {}
