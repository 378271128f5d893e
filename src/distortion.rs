//! Single-coefficient radial lens distortion.
//!
//! Radii are normalized so that `r = 1` at the left/right image edge
//! (`r = |p - center| / (width / 2)`). The ideal (pinhole) position of an
//! observed point is obtained by scaling its offset from the image centre:
//!
//! ```text
//! r_ideal = r_observed * (1 - k * r_observed²) / (1 - k)
//! ```
//!
//! so `k > 0` is barrel distortion, and the edge of the image (`r = 1`) is a
//! fixed point of the mapping. Undistortion is closed form; the forward
//! distortion is solved with Newton-Raphson.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RadialDistortion {
    pub k: f32,
}

impl RadialDistortion {
    pub fn new(k: f32) -> Self {
        Self { k }
    }

    pub fn is_zero(&self) -> bool {
        self.k == 0.0
    }

    /// Observed → ideal, for an offset `(x, y)` from the image centre in pixels.
    pub fn undistort(&self, x: f32, y: f32, width: u32) -> (f32, f32) {
        if self.is_zero() {
            return (x, y);
        }
        let half = width as f32 / 2.0;
        let r2 = (x * x + y * y) / (half * half);
        let scale = (1.0 - self.k * r2) / (1.0 - self.k);
        (x * scale, y * scale)
    }

    /// Ideal → observed, the inverse of [`undistort`](Self::undistort).
    ///
    /// For `k > 0` the mapping only has an inverse up to the radius where it
    /// stops increasing, `r = 1 / √(3k)`; ideal points beyond it are placed on
    /// that radius, well outside any image.
    pub fn distort(&self, x: f32, y: f32, width: u32) -> (f32, f32) {
        if self.is_zero() {
            return (x, y);
        }
        let half = width as f64 / 2.0;
        let r_ideal = ((x as f64).hypot(y as f64)) / half;
        if r_ideal < 1e-12 {
            return (x, y);
        }
        let k = self.k as f64;
        let forward = |r: f64| r * (1.0 - k * r * r) / (1.0 - k);
        let r_max = if k > 0.0 { (1.0 / (3.0 * k)).sqrt() } else { f64::INFINITY };
        let r = if r_ideal >= forward(r_max) {
            r_max
        } else {
            // Solve forward(r) = r_ideal for r
            let mut r = r_ideal.min(r_max);
            for _ in 0..30 {
                let df = (1.0 - 3.0 * k * r * r) / (1.0 - k);
                if df.abs() < 1e-12 {
                    break;
                }
                let step = (forward(r) - r_ideal) / df;
                r = (r - step).clamp(0.0, r_max);
                if step.abs() < 1e-12 {
                    break;
                }
            }
            r
        };
        let scale = (r / r_ideal) as f32;
        (x * scale, y * scale)
    }
}
