//! Database generation: builds the pattern index from a list of star records.
//!
//! 1. Apply the magnitude cut, sort by brightness.
//! 2. Choose FOV scales between the minimum and maximum FOV.
//! 3. For each scale, thin the stars with the cluster buster and distribute
//!    lattice fields over the sky.
//! 4. In each field, take 4-star combinations of the brightest kept stars and
//!    hash them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ensure_config, Error, Result};
use crate::sky_index::{SkyIndex, MAX_CELLS_PER_AXIS};
use crate::{StarRecord, Vector3};

use super::combinations::BreadthFirstCombinations;
use super::database::{
    CatalogDatabase, DatabaseProperties, PatternEntry, MIN_PATTERN_MAX_ERROR,
};
use super::pattern::{
    bins_for_max_error, canonical_order, edge_ratios, sorted_edge_angles, PatternHash,
    NUM_EDGES, PATTERN_SCHEME_VERSION, PATTERN_SIZE,
};

/// Parameters controlling database generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateDatabaseConfig {
    /// Maximum FOV in degrees.
    pub max_fov_deg: f32,
    /// Minimum FOV in degrees. If None, equals max_fov (single-scale database).
    pub min_fov_deg: Option<f32>,
    /// Faintest star magnitude to include. None = derive from star density.
    pub star_max_magnitude: Option<f32>,
    /// Maximum edge-ratio error for pattern matching.
    /// Determines bin count: bins = round(0.25 / pattern_max_error).
    pub pattern_max_error: f32,
    /// Lattice fields per sky-tiling field. Default 100.
    pub lattice_field_oversampling: u32,
    /// Patterns to generate per lattice field. Default 50.
    pub patterns_per_lattice_field: u32,
    /// Catalog stars per FOV kept by the cluster buster. Default 150.
    pub verification_stars_per_fov: u32,
    /// Ratio between consecutive FOV scales. Default 1.5.
    pub multiscale_step: f32,
    /// Epoch of the supplied positions, recorded in the properties.
    pub epoch: f32,
    /// Voxels per axis of the cone-search index.
    pub sky_index_cells: u32,
}

impl Default for GenerateDatabaseConfig {
    fn default() -> Self {
        Self {
            max_fov_deg: 30.0,
            min_fov_deg: None,
            star_max_magnitude: None,
            pattern_max_error: 0.001,
            lattice_field_oversampling: 100,
            patterns_per_lattice_field: 50,
            verification_stars_per_fov: 150,
            multiscale_step: 1.5,
            epoch: 2000.0,
            sky_index_cells: 32,
        }
    }
}

impl GenerateDatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        let max = self.max_fov_deg;
        let min = self.min_fov_deg.unwrap_or(max);
        ensure_config!(
            min.is_finite() && max.is_finite() && min > 0.0 && max < 180.0,
            "FOV range must lie in (0°, 180°), got {min}°..{max}°"
        );
        ensure_config!(min <= max, "min_fov_deg ({min}) exceeds max_fov_deg ({max})");
        ensure_config!(
            (MIN_PATTERN_MAX_ERROR..0.25).contains(&self.pattern_max_error),
            "pattern_max_error must lie in [{MIN_PATTERN_MAX_ERROR}, 0.25), got {}",
            self.pattern_max_error
        );
        ensure_config!(
            self.lattice_field_oversampling >= 1,
            "lattice_field_oversampling must be at least 1"
        );
        ensure_config!(
            self.patterns_per_lattice_field >= 1,
            "patterns_per_lattice_field must be at least 1"
        );
        ensure_config!(
            self.verification_stars_per_fov >= PATTERN_SIZE as u32,
            "verification_stars_per_fov must be at least {PATTERN_SIZE}"
        );
        ensure_config!(
            self.multiscale_step > 1.0,
            "multiscale_step must exceed 1, got {}",
            self.multiscale_step
        );
        ensure_config!(
            (1..=MAX_CELLS_PER_AXIS).contains(&self.sky_index_cells),
            "sky_index_cells must lie in 1..={MAX_CELLS_PER_AXIS}, got {}",
            self.sky_index_cells
        );
        Ok(())
    }
}

// ── Sky geometry utilities ──────────────────────────────────────────────────

/// Approximate number of FOV-sized fields needed to tile the full sky.
fn num_fields_for_sky(fov_rad: f32) -> usize {
    let cone_solid_angle = 2.0 * std::f32::consts::PI * (1.0 - (fov_rad / 2.0).cos());
    if cone_solid_angle <= 0.0 {
        return 1;
    }
    ((4.0 * std::f32::consts::PI / cone_solid_angle).ceil() as usize).max(1)
}

/// Typical spacing of `stars_per_fov` stars spread uniformly over a FOV circle.
pub(crate) fn separation_for_density(fov_rad: f32, stars_per_fov: u32) -> f32 {
    (fov_rad / 2.0) * (std::f32::consts::PI / stars_per_fov as f32).sqrt()
}

/// `n` near-uniform points on the unit sphere (golden spiral).
fn fibonacci_sphere_lattice(n: usize) -> Vec<Vector3> {
    let golden_ratio = (1.0 + 5.0_f64.sqrt()) / 2.0;
    (0..n)
        .map(|i| {
            let z = 1.0 - (2.0 * i as f64 + 1.0) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let theta = std::f64::consts::TAU * i as f64 / golden_ratio;
            Vector3::new((r * theta.cos()) as f32, (r * theta.sin()) as f32, z as f32)
        })
        .collect()
}

/// Geometrically spaced FOV scales from `min` to `max`, both included.
fn pattern_fov_scales(min_fov: f32, max_fov: f32, step: f32) -> Vec<f32> {
    let ratio = max_fov / min_fov;
    if ratio < step.sqrt() {
        return vec![max_fov];
    }
    let divisions = (ratio.ln() / step.ln()).ceil() as usize + 1;
    (0..divisions)
        .map(|i| {
            let t = i as f32 / (divisions - 1) as f32;
            (min_fov.ln() + t * (max_fov.ln() - min_fov.ln())).exp()
        })
        .collect()
}

/// Magnitude of the star that gives every field at `min_fov` about
/// `verification_stars_per_fov` stars. `stars` is brightness sorted.
fn magnitude_cutoff(stars: &[StarRecord], min_fov: f32, verification_stars_per_fov: u32) -> f32 {
    let needed =
        (num_fields_for_sky(min_fov) as f64 * verification_stars_per_fov as f64 * 0.7) as usize;
    match stars.get(needed.min(stars.len().saturating_sub(1))) {
        Some(s) => s.magnitude,
        None => f32::INFINITY,
    }
}

/// Keep a star unless a brighter kept star lies within `separation`.
fn cluster_bust(stars: &[StarRecord], index: &SkyIndex, separation: f32) -> Vec<bool> {
    let mut keep = vec![false; stars.len()];
    for slot in 0..stars.len() {
        let occupied = index
            .query(stars, &stars[slot].direction(), separation)
            .into_iter()
            .take_while(|&other| other < slot)
            .any(|other| keep[other]);
        keep[slot] = !occupied;
    }
    keep
}

// ── Database generation ─────────────────────────────────────────────────────

impl CatalogDatabase {
    /// Build a database from catalog stars.
    ///
    /// Star ids must be unique. Directions do not need to be sorted; the
    /// stored star table is ordered brightest first.
    pub fn generate(stars: &[StarRecord], config: &GenerateDatabaseConfig) -> Result<Self> {
        config.validate()?;
        let max_fov = config.max_fov_deg.to_radians();
        let min_fov = config.min_fov_deg.unwrap_or(config.max_fov_deg).to_radians();
        let pattern_bins = bins_for_max_error(config.pattern_max_error);
        info!(
            "Pattern bins: {}, max_error: {}",
            pattern_bins, config.pattern_max_error
        );

        if let Some(bad) = stars.iter().find(|s| {
            !s.magnitude.is_finite()
                || s.uvec.iter().any(|c| !c.is_finite())
                || s.direction().norm() < 0.5
        }) {
            return Err(Error::InvalidConfiguration(format!(
                "star {} has a non-finite magnitude or direction",
                bad.id
            )));
        }

        let mut stars: Vec<StarRecord> = stars.to_vec();
        stars.sort_by(|a, b| a.magnitude.total_cmp(&b.magnitude).then(a.id.cmp(&b.id)));
        let star_max_magnitude = config.star_max_magnitude.unwrap_or_else(|| {
            magnitude_cutoff(&stars, min_fov, config.verification_stars_per_fov)
        });
        let num_before = stars.len();
        stars.retain(|s| s.magnitude <= star_max_magnitude);
        info!(
            "Kept {} of {} stars brighter than magnitude {:.2}",
            stars.len(),
            num_before,
            star_max_magnitude
        );
        ensure_config!(
            stars.len() >= PATTERN_SIZE,
            "need at least {PATTERN_SIZE} stars after the magnitude cut, have {}",
            stars.len()
        );

        let index = SkyIndex::build(&stars, config.sky_index_cells);
        let vectors: Vec<Vector3> = stars.iter().map(StarRecord::direction).collect();

        let pattern_fovs = pattern_fov_scales(min_fov, max_fov, config.multiscale_step);
        info!(
            "Generating patterns at {} FOV scales: {:?} deg",
            pattern_fovs.len(),
            pattern_fovs.iter().map(|f| f.to_degrees()).collect::<Vec<_>>()
        );

        let mut pattern_set: HashSet<[u32; PATTERN_SIZE]> = HashSet::new();
        let mut hashed: Vec<(PatternHash, PatternEntry)> = Vec::new();

        // Largest scale first
        for &pattern_fov in pattern_fovs.iter().rev() {
            let separation = separation_for_density(pattern_fov, config.verification_stars_per_fov);
            let keep = cluster_bust(&stars, &index, separation);
            info!(
                "FOV {:.2}°: cluster-buster separation {:.3}°, {} pattern stars",
                pattern_fov.to_degrees(),
                separation.to_degrees(),
                keep.iter().filter(|&&k| k).count()
            );

            let n_fields =
                num_fields_for_sky(pattern_fov) * config.lattice_field_oversampling as usize;
            let mut added = 0usize;
            for center in fibonacci_sphere_lattice(n_fields) {
                // Query results come out in slot (brightness) order
                let field: Vec<usize> = index
                    .query(&stars, &center, pattern_fov / 2.0)
                    .into_iter()
                    .filter(|&slot| keep[slot])
                    .collect();
                if field.len() < PATTERN_SIZE {
                    continue;
                }

                for combo in BreadthFirstCombinations::new(&field, PATTERN_SIZE)
                    .take(config.patterns_per_lattice_field as usize)
                {
                    let mut key: [u32; PATTERN_SIZE] = std::array::from_fn(|i| combo[i] as u32);
                    key.sort_unstable();
                    if !pattern_set.insert(key) {
                        continue;
                    }
                    let pattern_vecs: [Vector3; PATTERN_SIZE] =
                        std::array::from_fn(|i| vectors[key[i] as usize]);
                    let edges = sorted_edge_angles(&pattern_vecs);
                    let largest_edge = edges[NUM_EDGES - 1];
                    if largest_edge <= 0.0 {
                        continue;
                    }
                    let order = canonical_order(&pattern_vecs);
                    let entry = PatternEntry {
                        stars: std::array::from_fn(|i| key[order[i]]),
                        largest_edge,
                    };
                    let hash = PatternHash::from_ratios(&edge_ratios(&edges), pattern_bins);
                    hashed.push((hash, entry));
                    added += 1;
                    if hashed.len() % 100_000 == 0 {
                        debug!("Generated {} patterns so far...", hashed.len());
                    }
                }
            }
            info!(
                "Added {} new patterns at this FOV ({} total)",
                added,
                hashed.len()
            );
        }

        let properties = DatabaseProperties {
            pattern_bins,
            pattern_max_error: config.pattern_max_error,
            min_fov_rad: min_fov,
            max_fov_rad: max_fov,
            star_max_magnitude,
            num_stars: 0,
            num_patterns: 0,
            epoch: config.epoch,
            verification_stars_per_fov: config.verification_stars_per_fov,
            lattice_field_oversampling: config.lattice_field_oversampling,
            patterns_per_lattice_field: config.patterns_per_lattice_field,
            pattern_scheme_version: PATTERN_SCHEME_VERSION,
        };
        let db = Self::from_parts(stars, hashed, properties, config.sky_index_cells)?;
        info!(
            "Database generation complete: {} stars, {} patterns",
            db.stars().len(),
            db.num_patterns()
        );
        Ok(db)
    }
}
