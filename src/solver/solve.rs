//! Solve entry points and result assembly.

use std::time::Instant;

use tracing::{debug, info};

use crate::centroid::focal_length_px;
use crate::centroid_extraction::{self, CentroidExtractionConfig, GrayImage};
use crate::distortion::RadialDistortion;
use crate::error::Result;
use crate::Centroid;

use super::attitude::{attitude_angles, quaternion_from_matrix};
use super::config::SolveConfig;
use super::database::CatalogDatabase;
use super::matcher::{MatchCandidate, Matcher, StopReason};
use super::pattern::PATTERN_SIZE;
use super::result::{
    FailureReason, ProjectedStar, SolveResult, SolveStatus, StarMatch, SweepStats,
    VisualDiagnostics,
};

const ARCSEC_PER_RAD: f32 = 206_264.8;

// ── Solve entry points ──────────────────────────────────────────────────────

impl CatalogDatabase {
    /// Extract centroids from `image` and solve them.
    ///
    /// When `extraction.max_centroids` is unset, `config.max_centroids` caps the
    /// extraction too.
    pub fn solve_from_image(
        &self,
        image: &GrayImage,
        extraction: &CentroidExtractionConfig,
        config: &SolveConfig,
    ) -> Result<SolveResult> {
        let t0 = Instant::now();
        config.validate(image.size())?;
        config.validate_for(self.properties())?;

        let mut extraction = extraction.clone();
        if extraction.max_centroids.is_none() {
            extraction.max_centroids = config.max_centroids;
        }
        let centroids = centroid_extraction::extract(image, &extraction)?;
        debug!(
            "Extracted {} centroids in {:.1} ms",
            centroids.len(),
            t0.elapsed().as_secs_f32() * 1000.0
        );
        self.solve_from_centroids_since(&centroids, image.size(), config, t0)
    }

    /// Solve for the camera attitude from image centroids.
    ///
    /// Centroids are `(row, col)` pixel positions from the top-left corner of an
    /// image of `image_size = (height, width)` pixels. Centroids with a weight are
    /// tried brightest first; the rest follow in input order.
    ///
    /// Failing to find a match is not an error: the result carries
    /// [`SolveStatus::NoMatchFound`] with a [`FailureReason`], or `Timeout` /
    /// `Cancelled` when the search was stopped before any match.
    pub fn solve_from_centroids(
        &self,
        centroids: &[Centroid],
        image_size: (u32, u32),
        config: &SolveConfig,
    ) -> Result<SolveResult> {
        self.solve_from_centroids_since(centroids, image_size, config, Instant::now())
    }

    fn solve_from_centroids_since(
        &self,
        centroids: &[Centroid],
        image_size: (u32, u32),
        config: &SolveConfig,
        t0: Instant,
    ) -> Result<SolveResult> {
        config.validate(image_size)?;
        config.validate_for(self.properties())?;
        let elapsed_ms = || t0.elapsed().as_secs_f32() * 1000.0;

        let matcher = Matcher::new(self, centroids, image_size, config, t0);
        if matcher.num_usable() < PATTERN_SIZE {
            debug!("Only {} usable centroids; need {PATTERN_SIZE}", matcher.num_usable());
            return Ok(SolveResult::failure(
                SolveStatus::NoMatchFound,
                Some(FailureReason::TooFewCentroids),
                image_size,
                elapsed_ms(),
            ));
        }

        let outcome = matcher.run();
        let raw = config.return_raw_matches.then_some(outcome.raw);

        let Some(best) = outcome.best else {
            let (status, reason) = match outcome.stopped {
                Some(StopReason::Timeout) => (SolveStatus::Timeout, None),
                Some(StopReason::Cancelled) => (SolveStatus::Cancelled, None),
                None => (
                    SolveStatus::NoMatchFound,
                    Some(FailureReason::NoConsistentPattern),
                ),
            };
            info!(
                "No solution ({status:?}) after {} sweep points in {:.1} ms",
                outcome.stats.points_tried,
                elapsed_ms()
            );
            let mut result = SolveResult::failure(status, reason, image_size, elapsed_ms());
            if config.return_visual_diagnostics {
                result.visual = Some(VisualDiagnostics {
                    projected_stars: Vec::new(),
                    pattern_centroids: None,
                    pattern_star_ids: None,
                    sweep: outcome.stats,
                });
            }
            result.raw_candidates = raw;
            return Ok(result);
        };

        let mut result = self.assemble(centroids, image_size, config, &best, outcome.stats)?;
        result.raw_candidates = raw;
        result.solve_time_ms = elapsed_ms();
        info!(
            "Solved: RA {:.4}°, Dec {:.4}°, roll {:.2}°, FOV {:.4}°, \
             {} matches, {:.2}\" RMS in {:.1} ms",
            result.ra_deg.unwrap_or_default(),
            result.dec_deg.unwrap_or_default(),
            result.roll_deg.unwrap_or_default(),
            result.fov_deg.unwrap_or_default(),
            result.num_matches,
            result.rms_residual_arcsec.unwrap_or_default(),
            result.solve_time_ms
        );
        Ok(result)
    }

    // ── Result assembly ──

    fn assemble(
        &self,
        centroids: &[Centroid],
        image_size: (u32, u32),
        config: &SolveConfig,
        best: &MatchCandidate,
        stats: SweepStats,
    ) -> Result<SolveResult> {
        let mut matches = Vec::with_capacity(best.matches.len());
        for (&(centroid_index, slot), &residual) in best.matches.iter().zip(&best.residuals_rad) {
            let star_id = self.stars()[slot].id;
            let direction = self.direction_of(star_id)?;
            let centroid = &centroids[centroid_index];
            matches.push(StarMatch {
                centroid_index,
                star_id,
                row: centroid.row,
                col: centroid.col,
                catalog_direction: [direction.x, direction.y, direction.z],
                magnitude: self.magnitude_of(star_id)?,
                residual_arcsec: residual * ARCSEC_PER_RAD,
            });
        }

        let mut matched = vec![false; centroids.len()];
        for m in &matches {
            matched[m.centroid_index] = true;
        }
        let unmatched_centroids = (0..centroids.len()).filter(|&i| !matched[i]).collect();

        let mut sorted: Vec<f32> = matches.iter().map(|m| m.residual_arcsec).collect();
        sorted.sort_by(f32::total_cmp);
        let p90 = sorted.get((0.9 * (sorted.len().saturating_sub(1)) as f32) as usize).copied();

        let attitude = quaternion_from_matrix(&best.rotation);
        let (ra_deg, dec_deg, roll_deg) = attitude_angles(&attitude);
        let pattern_star_ids = best.pattern_slots.map(|s| self.stars()[s].id);

        let visual = config.return_visual_diagnostics.then(|| VisualDiagnostics {
            projected_stars: self.project_stars(best, image_size),
            pattern_centroids: Some(best.pattern_centroids),
            pattern_star_ids: Some(pattern_star_ids),
            sweep: stats,
        });

        Ok(SolveResult {
            status: SolveStatus::MatchFound,
            failure_reason: None,
            attitude: Some(attitude),
            ra_deg: Some(ra_deg),
            dec_deg: Some(dec_deg),
            roll_deg: Some(roll_deg),
            fov_deg: Some(best.fov_rad.to_degrees()),
            fov_error_deg: Some(best.fov_error_rad.to_degrees()),
            distortion_k: Some(best.distortion_k),
            num_matches: matches.len(),
            matches,
            unmatched_centroids,
            rms_residual_arcsec: Some(best.rms_rad * ARCSEC_PER_RAD),
            p90_residual_arcsec: p90,
            max_residual_arcsec: sorted.last().copied(),
            probability: Some(best.probability),
            solve_time_ms: 0.0,
            image_size,
            visual,
            raw_candidates: None,
        })
    }

    /// Catalog stars that land inside the image with the solved camera, brightest first.
    fn project_stars(&self, best: &MatchCandidate, image_size: (u32, u32)) -> Vec<ProjectedStar> {
        let (height, width) = image_size;
        let f = focal_length_px(best.fov_rad, width);
        let distortion = RadialDistortion::new(best.distortion_k);
        let (half_w, half_h) = (width as f32 / 2.0, height as f32 / 2.0);
        let (cx, cy) = distortion.undistort(half_w, half_h, width);
        let half_diagonal = (cx.hypot(cy) / f).atan();
        let boresight = best.rotation.transpose() * crate::Vector3::z();

        self.query_cone(&boresight, half_diagonal)
            .into_iter()
            .filter_map(|slot| {
                let star = &self.stars()[slot];
                let cam = best.rotation * star.direction();
                if cam.z <= 0.0 {
                    return None;
                }
                let (x, y) = distortion.distort(cam.x / cam.z * f, cam.y / cam.z * f, width);
                (x.abs() <= half_w && y.abs() <= half_h).then(|| ProjectedStar {
                    star_id: star.id,
                    row: y + half_h,
                    col: x + half_w,
                    magnitude: star.magnitude,
                })
            })
            .collect()
    }
}
