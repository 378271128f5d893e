//! Hypothesis search over the sweep grid.
//!
//! For each sweep point the brightest centroids are turned into camera rays,
//! combined four at a time and looked up in the pattern table. A hit gives a
//! rotation from the four stars, which is then verified by projecting the
//! catalog into the image and counting matched centroids. An accepted hit is
//! refined with all matched stars before it competes with the other points.

use std::time::Instant;

use tracing::{debug, trace};

use crate::centroid::{brightness_order, focal_length_px};
use crate::distortion::RadialDistortion;
use crate::{Centroid, Matrix3, Vector3};

use super::attitude::find_rotation;
use super::combinations::{n_choose_k, BreadthFirstCombinations};
use super::config::{CancelToken, SolveConfig};
use super::database::{CatalogDatabase, PatternEntry};
use super::generate::separation_for_density;
use super::pattern::{
    angle_between, canonical_order, edge_ratios, sorted_edge_angles, NUM_EDGES, NUM_EDGE_RATIOS,
    PATTERN_SIZE,
};
use super::result::{CandidateSummary, SweepStats};
use super::sweep::{SweepGrid, SweepPoint};

/// Why the search stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Timeout,
    Cancelled,
}

/// Which pattern-star combinations a pass of the sweep tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    /// Combinations of the `pattern_checking_stars` brightest pattern stars.
    Brightest,
    /// Every later combination of all cluster-busted centroids.
    Extended,
}

/// An accepted and refined hypothesis.
#[derive(Debug, Clone)]
pub(crate) struct MatchCandidate {
    /// Catalog → camera rotation.
    pub rotation: Matrix3,
    pub fov_rad: f32,
    pub fov_error_rad: f32,
    pub distortion_k: f32,
    /// `(centroid index, star slot)` pairs, ascending by centroid index.
    pub matches: Vec<(usize, usize)>,
    /// Per-match angular residual, same order as `matches`.
    pub residuals_rad: Vec<f32>,
    pub rms_rad: f32,
    pub probability: f64,
    /// Centroid indices of the seeding pattern, canonical order.
    pub pattern_centroids: [usize; PATTERN_SIZE],
    pub pattern_slots: [usize; PATTERN_SIZE],
    pub sweep_index: usize,
}

impl MatchCandidate {
    /// More matches win, then lower RMS residual, then the earlier sweep point.
    fn beats(&self, other: &MatchCandidate) -> bool {
        self.matches
            .len()
            .cmp(&other.matches.len())
            .then_with(|| other.rms_rad.total_cmp(&self.rms_rad))
            .then_with(|| other.sweep_index.cmp(&self.sweep_index))
            .is_gt()
    }
}

/// Everything the search produced.
#[derive(Debug, Default)]
pub(crate) struct MatchOutcome {
    pub best: Option<MatchCandidate>,
    pub stopped: Option<StopReason>,
    pub stats: SweepStats,
    pub raw: Vec<CandidateSummary>,
}

impl MatchOutcome {
    /// Fold the outcome of a later sweep point into this one.
    fn absorb(&mut self, point: MatchOutcome) {
        self.stats.merge(&point.stats);
        self.raw.extend(point.raw);
        if self.stopped.is_none() {
            self.stopped = point.stopped;
        }
        if let Some(candidate) = point.best {
            let better = match &self.best {
                Some(best) => candidate.beats(best),
                None => true,
            };
            if better {
                self.best = Some(candidate);
            }
        }
    }
}

/// Undistorted centre offsets of the verification centroids at one sweep point.
struct Frame {
    offsets: Vec<(f32, f32)>,
}

impl Frame {
    fn vectors(&self, focal_length: f32) -> Vec<Vector3> {
        self.offsets
            .iter()
            .map(|&(x, y)| Vector3::new(x / focal_length, y / focal_length, 1.0).normalize())
            .collect()
    }
}

/// A hypothesis after counting matches, before refinement.
struct Verification {
    rotation: Matrix3,
    /// `(verification position, star slot)`.
    matches: Vec<(usize, usize)>,
    num_nearby: usize,
}

pub(crate) struct Matcher<'a> {
    db: &'a CatalogDatabase,
    config: &'a SolveConfig,
    centroids: &'a [Centroid],
    image_size: (u32, u32),
    /// Indices of usable centroids, brightest first, capped at the
    /// verification count.
    verify: Vec<usize>,
    started: Instant,
}

impl<'a> Matcher<'a> {
    pub fn new(
        db: &'a CatalogDatabase,
        centroids: &'a [Centroid],
        image_size: (u32, u32),
        config: &'a SolveConfig,
        started: Instant,
    ) -> Self {
        let limit = config
            .max_centroids
            .unwrap_or(db.properties().verification_stars_per_fov as usize);
        let verify = brightness_order(centroids)
            .into_iter()
            .filter(|&i| centroids[i].row.is_finite() && centroids[i].col.is_finite())
            .take(limit)
            .collect();
        Self {
            db,
            config,
            centroids,
            image_size,
            verify,
            started,
        }
    }

    /// Centroids that take part in verification.
    pub fn num_usable(&self) -> usize {
        self.verify.len()
    }

    fn stop_reason(&self) -> Option<StopReason> {
        if self
            .config
            .cancel
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
        {
            return Some(StopReason::Cancelled);
        }
        match self.config.solve_timeout_ms {
            Some(ms) if self.started.elapsed().as_millis() >= u128::from(ms) => {
                Some(StopReason::Timeout)
            }
            _ => None,
        }
    }

    /// Search the whole sweep grid.
    ///
    /// The first pass only combines the `pattern_checking_stars` brightest
    /// pattern stars. If no sweep point yields a match, a second pass carries
    /// on breadth-first through the remaining combinations of every
    /// cluster-busted centroid, until it succeeds or the search is stopped.
    pub fn run(&self) -> MatchOutcome {
        let grid = SweepGrid::for_solve(self.config, self.db.properties());
        debug!(
            "Sweeping {} FOV x {} distortion hypotheses with {} centroids",
            grid.fov_values().len(),
            grid.distortion_values().len(),
            self.verify.len()
        );

        let mut outcome = self.sweep(&grid, Tier::Brightest);
        if outcome.best.is_none() && outcome.stopped.is_none() {
            debug!("No match among the brightest pattern stars, extending the search");
            outcome.absorb(self.sweep(&grid, Tier::Extended));
        }
        outcome
    }

    /// Search every point of `grid` at one tier.
    fn sweep(&self, grid: &SweepGrid, tier: Tier) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            let points: Vec<SweepPoint> = grid.clone().collect();
            let per_point: Vec<MatchOutcome> = points
                .into_par_iter()
                .map(|point| self.search_point(point, tier))
                .collect();
            for point in per_point {
                outcome.absorb(point);
            }
        }

        #[cfg(not(feature = "parallel"))]
        for point in grid.clone() {
            let result = self.search_point(point, tier);
            let stopped = result.stopped.is_some();
            outcome.absorb(result);
            if stopped {
                break;
            }
        }

        outcome
    }

    /// Search one (FOV, distortion) hypothesis.
    fn search_point(&self, point: SweepPoint, tier: Tier) -> MatchOutcome {
        let mut out = MatchOutcome::default();
        if let Some(reason) = self.stop_reason() {
            out.stopped = Some(reason);
            return out;
        }
        if tier == Tier::Brightest {
            out.stats.points_tried = 1;
        }

        let (_, width) = self.image_size;
        let distortion = RadialDistortion::new(point.distortion_k);
        let frame = Frame {
            offsets: self
                .verify
                .iter()
                .map(|&i| {
                    let (x, y) = self.centroids[i].offset_from_center(self.image_size);
                    distortion.undistort(x, y, width)
                })
                .collect(),
        };
        let vectors = frame.vectors(focal_length_px(point.fov_rad, width));

        // Cluster buster, brightest first
        let props = self.db.properties();
        let separation = separation_for_density(point.fov_rad, props.verification_stars_per_fov);
        let cos_sep = separation.cos();
        let mut pattern_stars: Vec<usize> = Vec::new();
        for i in 0..vectors.len() {
            if pattern_stars.iter().all(|&j| vectors[i].dot(&vectors[j]) <= cos_sep) {
                pattern_stars.push(i);
            }
        }
        trace!(
            "Sweep point {}: FOV {:.3}°, k {:.4}, {} pattern stars",
            point.index,
            point.fov_rad.to_degrees(),
            point.distortion_k,
            pattern_stars.len()
        );
        if pattern_stars.len() < PATTERN_SIZE {
            return out;
        }

        // Breadth-first order puts every combination of the K brightest first
        let brightest = n_choose_k(
            pattern_stars.len().min(self.config.pattern_checking_stars),
            PATTERN_SIZE,
        );
        let (skip, take) = match tier {
            Tier::Brightest => (0, brightest),
            Tier::Extended => (brightest, usize::MAX),
        };

        let max_error = self
            .config
            .pattern_max_error
            .map_or(props.pattern_max_error, |e| e.max(props.pattern_max_error));

        let combos = BreadthFirstCombinations::new(&pattern_stars, PATTERN_SIZE)
            .skip(skip)
            .take(take);
        for combo in combos {
            if let Some(reason) = self.stop_reason() {
                out.stopped = Some(reason);
                break;
            }
            out.stats.patterns_checked += 1;

            let combo: [usize; PATTERN_SIZE] = std::array::from_fn(|i| combo[i]);
            let image_vectors: [Vector3; PATTERN_SIZE] = std::array::from_fn(|i| vectors[combo[i]]);
            let edges = sorted_edge_angles(&image_vectors);
            let image_largest = edges[NUM_EDGES - 1];
            if image_largest <= 0.0 {
                continue;
            }
            let ratios = edge_ratios(&edges);

            let mut accepted: Option<MatchCandidate> = None;
            for entry in self.db.lookup_near(&ratios, max_error) {
                let catalog_vectors = self.db.pattern_vectors(entry);
                let catalog_ratios = edge_ratios(&sorted_edge_angles(&catalog_vectors));
                if (0..NUM_EDGE_RATIOS).any(|i| (catalog_ratios[i] - ratios[i]).abs() > max_error) {
                    continue;
                }
                let fov = point.fov_rad * entry.largest_edge / image_largest;
                if !self.fov_is_consistent(fov) {
                    trace!("Rejected pattern hit at implied FOV {:.3}°", fov.to_degrees());
                    continue;
                }
                out.stats.candidates_verified += 1;

                let Some((ordered, slots, verification)) =
                    self.verify_hypothesis(&frame, point, &combo, entry, fov)
                else {
                    continue;
                };
                let probability = self.false_positive_probability(
                    verification.matches.len(),
                    verification.num_nearby,
                );
                let is_accepted = verification.matches.len() >= self.config.min_matches
                    && probability < self.config.match_threshold;
                let pattern_centroids = ordered.map(|pos| self.verify[pos]);

                if is_accepted {
                    let candidate =
                        self.refine(&frame, point, fov, verification, pattern_centroids, slots);
                    debug!(
                        "MATCH: {} matches, prob={:.2e}, fov={:.3}°, k={:.4}",
                        candidate.matches.len(),
                        candidate.probability,
                        candidate.fov_rad.to_degrees(),
                        candidate.distortion_k
                    );
                    if self.config.return_raw_matches {
                        out.raw.push(self.summary(&candidate, point, true));
                    }
                    let better = match &accepted {
                        Some(best) => candidate.beats(best),
                        None => true,
                    };
                    if better {
                        accepted = Some(candidate);
                    }
                } else if self.config.return_raw_matches {
                    let f = focal_length_px(fov, width);
                    let vectors = frame.vectors(f);
                    let rms_rad = rms(&residuals(
                        &verification.rotation,
                        self.db,
                        &vectors,
                        &verification.matches,
                    ));
                    out.raw.push(CandidateSummary {
                        sweep_index: point.index,
                        fov_deg: fov.to_degrees(),
                        distortion_k: point.distortion_k,
                        pattern_centroids,
                        pattern_star_ids: slots.map(|s| self.db.stars()[s].id),
                        num_matches: verification.matches.len(),
                        rms_residual_arcsec: rms_rad.to_degrees() * 3600.0,
                        probability,
                        accepted: false,
                    });
                }
            }

            if accepted.is_some() {
                out.best = accepted;
                break;
            }
        }
        out
    }

    /// Whether a pattern's implied FOV is compatible with the configuration.
    fn fov_is_consistent(&self, fov_rad: f32) -> bool {
        match (
            self.config.field_of_view_estimate_deg,
            self.config.field_of_view_max_error_deg,
        ) {
            (Some(estimate), Some(max_error)) => {
                (fov_rad.to_degrees() - estimate).abs() <= max_error
            }
            (Some(_), None) => true,
            (None, _) => {
                let props = self.db.properties();
                let widen = 2.0 * self.config.match_radius_tolerance;
                fov_rad >= props.min_fov_rad * (1.0 - widen)
                    && fov_rad <= props.max_fov_rad * (1.0 + widen)
            }
        }
    }

    /// Fit the four-star rotation at the implied FOV and count matches.
    ///
    /// Returns the pattern's verification positions and star slots in
    /// canonical order, or `None` if the four stars do not agree.
    fn verify_hypothesis(
        &self,
        frame: &Frame,
        point: SweepPoint,
        combo: &[usize; PATTERN_SIZE],
        entry: &PatternEntry,
        fov_rad: f32,
    ) -> Option<([usize; PATTERN_SIZE], [usize; PATTERN_SIZE], Verification)> {
        let f = focal_length_px(fov_rad, self.image_size.1);
        let vectors = frame.vectors(f);
        let image: [Vector3; PATTERN_SIZE] = std::array::from_fn(|i| vectors[combo[i]]);
        let order = canonical_order(&image);
        let ordered: [usize; PATTERN_SIZE] = order.map(|i| combo[i]);
        let image_ordered: [Vector3; PATTERN_SIZE] = order.map(|i| image[i]);
        let catalog = self.db.pattern_vectors(entry);

        let rotation = find_rotation(&image_ordered, &catalog)?;
        let radius = self.config.match_radius_tolerance * fov_rad;
        if (0..PATTERN_SIZE)
            .any(|i| angle_between(&(rotation * catalog[i]), &image_ordered[i]) > radius)
        {
            return None;
        }

        let (matches, num_nearby) =
            self.match_stars(&rotation, fov_rad, point.distortion_k, &vectors);
        let slots = entry.stars.map(|s| s as usize);
        Some((
            ordered,
            slots,
            Verification {
                rotation,
                matches,
                num_nearby,
            },
        ))
    }

    /// Project catalog stars with `rotation` and pair them one-to-one with
    /// centroid rays, closest pairs first.
    ///
    /// Returns `(verification position, star slot)` pairs ascending by position,
    /// and the number of catalog stars considered.
    fn match_stars(
        &self,
        rotation: &Matrix3,
        fov_rad: f32,
        distortion_k: f32,
        vectors: &[Vector3],
    ) -> (Vec<(usize, usize)>, usize) {
        let (height, width) = self.image_size;
        let f = focal_length_px(fov_rad, width);
        let distortion = RadialDistortion::new(distortion_k);
        let radius = self.config.match_radius_tolerance * fov_rad;
        let (half_w, half_h) = (width as f32 / 2.0, height as f32 / 2.0);

        let (cx, cy) = distortion.undistort(half_w, half_h, width);
        let half_diagonal = (cx.hypot(cy) / f).atan() + radius;
        let boresight = rotation.transpose() * Vector3::z();

        let mut nearby: Vec<(usize, Vector3)> = Vec::new();
        for slot in self.db.query_cone(&boresight, half_diagonal) {
            let cam = rotation * self.db.stars()[slot].direction();
            if cam.z <= 0.0 {
                continue;
            }
            let (x, y) = distortion.distort(cam.x / cam.z * f, cam.y / cam.z * f, width);
            if x.abs() > half_w || y.abs() > half_h {
                continue;
            }
            nearby.push((slot, cam));
            if nearby.len() >= 2 * vectors.len() {
                break;
            }
        }

        let cos_radius = radius.cos();
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ci, v) in vectors.iter().enumerate() {
            for (pi, (_, cam)) in nearby.iter().enumerate() {
                if v.dot(cam) >= cos_radius {
                    let angle = angle_between(v, cam);
                    if angle <= radius {
                        pairs.push((angle, ci, pi));
                    }
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut centroid_used = vec![false; vectors.len()];
        let mut star_used = vec![false; nearby.len()];
        let mut matches = Vec::new();
        for (_, ci, pi) in pairs {
            if centroid_used[ci] || star_used[pi] {
                continue;
            }
            centroid_used[ci] = true;
            star_used[pi] = true;
            matches.push((ci, nearby[pi].0));
        }
        matches.sort_unstable();
        (matches, nearby.len())
    }

    /// Probability, scaled by the number of database patterns, that
    /// `num_matches` agreements arise by chance.
    fn false_positive_probability(&self, num_matches: usize, num_nearby: usize) -> f64 {
        let n = self.verify.len();
        let tolerance = self.config.match_radius_tolerance as f64;
        let prob_single = num_nearby as f64 * tolerance * tolerance;
        let prob_mismatch = binomial_cdf(
            (n as i64 - (num_matches as i64 - 2)).max(0) as u32,
            n as u32,
            1.0 - prob_single.min(1.0),
        );
        prob_mismatch * self.db.num_patterns().max(1) as f64
    }

    /// Refit an accepted hypothesis on all its matches, rescale the FOV and
    /// match once more.
    fn refine(
        &self,
        frame: &Frame,
        point: SweepPoint,
        fov_rad: f32,
        verification: Verification,
        pattern_centroids: [usize; PATTERN_SIZE],
        pattern_slots: [usize; PATTERN_SIZE],
    ) -> MatchCandidate {
        let width = self.image_size.1;
        let mut rotation = verification.rotation;
        let mut matches = verification.matches;
        let mut num_nearby = verification.num_nearby;

        let vectors = frame.vectors(focal_length_px(fov_rad, width));
        rotation = fit_matches(self.db, &vectors, &matches).unwrap_or(rotation);

        let (fov, fov_error) =
            refine_fov(self.db, frame, &rotation, &matches, width).unwrap_or((fov_rad, 0.0));
        let vectors = frame.vectors(focal_length_px(fov, width));
        rotation = fit_matches(self.db, &vectors, &matches).unwrap_or(rotation);

        let (rematched, nearby) = self.match_stars(&rotation, fov, point.distortion_k, &vectors);
        if rematched.len() >= matches.len() {
            matches = rematched;
            num_nearby = nearby;
            rotation = fit_matches(self.db, &vectors, &matches).unwrap_or(rotation);
        }

        let residuals_rad = residuals(&rotation, self.db, &vectors, &matches);
        let probability = self.false_positive_probability(matches.len(), num_nearby);
        MatchCandidate {
            rotation,
            fov_rad: fov,
            fov_error_rad: fov_error,
            distortion_k: point.distortion_k,
            matches: matches.iter().map(|&(pos, slot)| (self.verify[pos], slot)).collect(),
            rms_rad: rms(&residuals_rad),
            residuals_rad,
            probability,
            pattern_centroids,
            pattern_slots,
            sweep_index: point.index,
        }
        .sorted_by_centroid()
    }

    fn summary(
        &self,
        candidate: &MatchCandidate,
        point: SweepPoint,
        accepted: bool,
    ) -> CandidateSummary {
        CandidateSummary {
            sweep_index: point.index,
            fov_deg: candidate.fov_rad.to_degrees(),
            distortion_k: candidate.distortion_k,
            pattern_centroids: candidate.pattern_centroids,
            pattern_star_ids: candidate.pattern_slots.map(|s| self.db.stars()[s].id),
            num_matches: candidate.matches.len(),
            rms_residual_arcsec: candidate.rms_rad.to_degrees() * 3600.0,
            probability: candidate.probability,
            accepted,
        }
    }
}

impl MatchCandidate {
    /// Order matches (and their residuals) by original centroid index.
    fn sorted_by_centroid(mut self) -> Self {
        let mut paired: Vec<((usize, usize), f32)> = self
            .matches
            .iter()
            .copied()
            .zip(self.residuals_rad.iter().copied())
            .collect();
        paired.sort_by_key(|&((ci, _), _)| ci);
        self.matches = paired.iter().map(|&(m, _)| m).collect();
        self.residuals_rad = paired.iter().map(|&(_, r)| r).collect();
        self
    }
}

/// Rotation fitted to every matched pair.
fn fit_matches(
    db: &CatalogDatabase,
    vectors: &[Vector3],
    matches: &[(usize, usize)],
) -> Option<Matrix3> {
    let camera: Vec<Vector3> = matches.iter().map(|&(pos, _)| vectors[pos]).collect();
    let catalog: Vec<Vector3> = matches
        .iter()
        .map(|&(_, slot)| db.stars()[slot].direction())
        .collect();
    find_rotation(&camera, &catalog)
}

fn residuals(
    rotation: &Matrix3,
    db: &CatalogDatabase,
    vectors: &[Vector3],
    matches: &[(usize, usize)],
) -> Vec<f32> {
    matches
        .iter()
        .map(|&(pos, slot)| {
            angle_between(&vectors[pos], &(rotation * db.stars()[slot].direction()))
        })
        .collect()
}

fn rms(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f32>() / values.len() as f32).sqrt()
}

/// Least-squares focal length from matched stars.
///
/// Fits `ρ = f · tan θ`, where `ρ` is a centroid's undistorted distance from
/// the image centre and `θ` the rotated catalog star's angle from the boresight.
/// Returns the FOV and its 1-σ error, or `None` without enough leverage.
fn refine_fov(
    db: &CatalogDatabase,
    frame: &Frame,
    rotation: &Matrix3,
    matches: &[(usize, usize)],
    width: u32,
) -> Option<(f32, f32)> {
    let samples: Vec<(f64, f64)> = matches
        .iter()
        .filter_map(|&(pos, slot)| {
            let cam = rotation * db.stars()[slot].direction();
            if cam.z <= 0.0 {
                return None;
            }
            let (x, y) = frame.offsets[pos];
            let rho = (x as f64).hypot(y as f64);
            let tan_theta = (cam.x as f64).hypot(cam.y as f64) / cam.z as f64;
            (tan_theta > 1e-6).then_some((rho, tan_theta))
        })
        .collect();
    if samples.len() < 3 {
        return None;
    }
    let stt: f64 = samples.iter().map(|(_, t)| t * t).sum();
    let srt: f64 = samples.iter().map(|(r, t)| r * t).sum();
    let f = srt / stt;
    if !f.is_finite() || f <= 0.0 {
        return None;
    }
    let sse: f64 = samples.iter().map(|(r, t)| (r - f * t).powi(2)).sum();
    let sigma_f = (sse / (samples.len() - 1) as f64).sqrt() / stt.sqrt();

    let half = width as f64 / 2.0;
    let fov = 2.0 * (half / f).atan();
    let sigma_fov = 2.0 * half * sigma_f / (f * f + half * half);
    Some((fov as f32, sigma_fov as f32))
}

/// Compute the binomial CDF: P(X <= k) where X ~ Binomial(n, p).
fn binomial_cdf(k: u32, n: u32, p: f64) -> f64 {
    if k >= n || p <= 0.0 {
        return 1.0;
    }
    if p >= 1.0 {
        return 0.0;
    }
    let q = 1.0 - p;

    // P(X=0) = q^n, then the ratio P(X=i)/P(X=i-1)
    let mut log_term = n as f64 * q.ln();
    let mut cdf = log_term.exp();
    for i in 1..=u64::from(k) {
        log_term += ((u64::from(n) - i + 1) as f64).ln() - (i as f64).ln() + p.ln() - q.ln();
        cdf += log_term.exp();
    }
    cdf.min(1.0)
}
