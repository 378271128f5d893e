//! Solve results and diagnostics.

use serde::{Deserialize, Serialize};

use crate::centroid::focal_length_px;
use crate::distortion::RadialDistortion;
use crate::star::{radec_to_uvec, uvec_to_radec};
use crate::{Quaternion, Vector3};

// ── Status codes ────────────────────────────────────────────────────────────

/// Outcome of a plate-solve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    /// A valid match was found.
    MatchFound,
    /// The search finished without an acceptable hypothesis.
    NoMatchFound,
    /// The solve timeout was reached before any match was found.
    Timeout,
    /// The cancel token was set before any match was found.
    Cancelled,
}

/// Why a solve ended with [`SolveStatus::NoMatchFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Fewer than 4 usable centroids.
    TooFewCentroids,
    /// No pattern passed verification anywhere in the sweep.
    NoConsistentPattern,
}

// ── Per-match records ───────────────────────────────────────────────────────

/// One centroid identified with a catalog star.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarMatch {
    /// Index into the centroid list passed to the solve call.
    pub centroid_index: usize,
    pub star_id: u64,
    /// Centroid position as supplied (pixels).
    pub row: f32,
    pub col: f32,
    /// Catalog unit direction.
    pub catalog_direction: [f32; 3],
    pub magnitude: f32,
    /// Angle between the centroid ray and the rotated catalog star (arcsec).
    pub residual_arcsec: f32,
}

/// A catalog star projected into the image with the solved attitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedStar {
    pub star_id: u64,
    pub row: f32,
    pub col: f32,
    pub magnitude: f32,
}

/// Work counters across the whole sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    pub points_tried: usize,
    pub patterns_checked: usize,
    pub candidates_verified: usize,
}

impl SweepStats {
    pub(crate) fn merge(&mut self, other: &SweepStats) {
        self.points_tried += other.points_tried;
        self.patterns_checked += other.patterns_checked;
        self.candidates_verified += other.candidates_verified;
    }
}

/// Optional visual diagnostics of a solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualDiagnostics {
    /// Catalog stars inside the image footprint, brightest first.
    pub projected_stars: Vec<ProjectedStar>,
    /// Centroid indices of the pattern that seeded the solution.
    pub pattern_centroids: Option<[usize; 4]>,
    pub pattern_star_ids: Option<[u64; 4]>,
    pub sweep: SweepStats,
}

/// One hypothesis that reached verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub sweep_index: usize,
    pub fov_deg: f32,
    pub distortion_k: f32,
    pub pattern_centroids: [usize; 4],
    pub pattern_star_ids: [u64; 4],
    pub num_matches: usize,
    pub rms_residual_arcsec: f32,
    pub probability: f64,
    pub accepted: bool,
}

// ── Solve result ────────────────────────────────────────────────────────────

/// Result of a plate-solve attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveResult {
    pub status: SolveStatus,
    /// Set when `status` is `NoMatchFound`.
    pub failure_reason: Option<FailureReason>,
    /// Quaternion rotating catalog-frame vectors into the camera frame.
    /// Camera frame: +X toward increasing column, +Y toward increasing row, +Z boresight.
    /// Usage: `camera_vec = attitude * catalog_vec`
    pub attitude: Option<Quaternion>,
    /// Boresight right ascension (degrees).
    pub ra_deg: Option<f32>,
    /// Boresight declination (degrees).
    pub dec_deg: Option<f32>,
    /// Position angle of image up, north through east (degrees).
    pub roll_deg: Option<f32>,
    /// Horizontal field of view (degrees).
    pub fov_deg: Option<f32>,
    /// Estimated 1-σ uncertainty of `fov_deg`.
    pub fov_error_deg: Option<f32>,
    /// Radial distortion coefficient of the winning hypothesis.
    pub distortion_k: Option<f32>,
    pub num_matches: usize,
    pub matches: Vec<StarMatch>,
    /// Centroid indices without a catalog counterpart, ascending.
    pub unmatched_centroids: Vec<usize>,
    pub rms_residual_arcsec: Option<f32>,
    pub p90_residual_arcsec: Option<f32>,
    pub max_residual_arcsec: Option<f32>,
    /// Probability that the match is a coincidence.
    pub probability: Option<f64>,
    /// Wall-clock time spent solving, in milliseconds.
    pub solve_time_ms: f32,
    /// `(height, width)` of the solved image.
    pub image_size: (u32, u32),
    pub visual: Option<VisualDiagnostics>,
    pub raw_candidates: Option<Vec<CandidateSummary>>,
}

impl SolveResult {
    /// A result without a solution.
    pub(crate) fn failure(
        status: SolveStatus,
        failure_reason: Option<FailureReason>,
        image_size: (u32, u32),
        solve_time_ms: f32,
    ) -> Self {
        Self {
            status,
            failure_reason,
            attitude: None,
            ra_deg: None,
            dec_deg: None,
            roll_deg: None,
            fov_deg: None,
            fov_error_deg: None,
            distortion_k: None,
            num_matches: 0,
            matches: Vec::new(),
            unmatched_centroids: Vec::new(),
            rms_residual_arcsec: None,
            p90_residual_arcsec: None,
            max_residual_arcsec: None,
            probability: None,
            solve_time_ms,
            image_size,
            visual: None,
            raw_candidates: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.status == SolveStatus::MatchFound
    }

    /// Attitude, focal length in pixels and distortion of a solution.
    fn camera(&self) -> Option<(Quaternion, f32, RadialDistortion)> {
        let q = self.attitude?;
        let fov = self.fov_deg?.to_radians();
        let f = focal_length_px(fov, self.image_size.1);
        Some((q, f, RadialDistortion::new(self.distortion_k.unwrap_or(0.0))))
    }

    /// Sky position (RA, Dec in degrees) of an image position.
    ///
    /// Returns `None` if the solve was unsuccessful.
    pub fn pixel_to_world(&self, row: f32, col: f32) -> Option<(f32, f32)> {
        let (q, f, distortion) = self.camera()?;
        let (height, width) = self.image_size;
        let (x, y) = distortion.undistort(
            col - width as f32 / 2.0,
            row - height as f32 / 2.0,
            width,
        );
        let cam = Vector3::new(x / f, y / f, 1.0).normalize();
        let (ra, dec) = uvec_to_radec(&(q.inverse() * cam));
        Some((ra.to_degrees(), dec.to_degrees()))
    }

    /// Image position `(row, col)` of a sky position (RA, Dec in degrees).
    ///
    /// Returns `None` if the solve was unsuccessful or the point is behind the camera.
    pub fn world_to_pixel(&self, ra_deg: f32, dec_deg: f32) -> Option<(f32, f32)> {
        let (q, f, distortion) = self.camera()?;
        let cam = q * radec_to_uvec(ra_deg.to_radians(), dec_deg.to_radians());
        if cam.z <= 0.0 {
            return None;
        }
        let (height, width) = self.image_size;
        let (x, y) = distortion.distort(cam.x / cam.z * f, cam.y / cam.z * f, width);
        Some((y + height as f32 / 2.0, x + width as f32 / 2.0))
    }
}
