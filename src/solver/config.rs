//! Solve configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ensure_config, Result};

use super::database::{DatabaseProperties, MAX_LOOKUP_ERROR_FACTOR};
use super::pattern::PATTERN_SIZE;

/// Most coefficients a distortion range may sweep.
pub const MAX_DISTORTION_STEPS: u32 = 1000;

/// Radial distortion coefficients to try.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionSearch {
    /// One known coefficient (0 = pinhole).
    Fixed(f32),
    /// `steps` coefficients evenly spaced over `[min, max]`, tried from the
    /// middle outward.
    Range { min: f32, max: f32, steps: u32 },
}

impl Default for DistortionSearch {
    fn default() -> Self {
        DistortionSearch::Fixed(0.0)
    }
}

/// Cooperative cancellation flag shared between a solve and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Parameters controlling the plate-solve attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveConfig {
    /// Estimated horizontal field of view in degrees (across the image width).
    /// None = search the database's FOV range.
    pub field_of_view_estimate_deg: Option<f32>,
    /// Maximum FOV error in degrees. The solver sweeps
    /// `estimate ± max_error`, exact estimate first. None = estimate only.
    pub field_of_view_max_error_deg: Option<f32>,
    /// Radial distortion coefficient(s) to try.
    pub distortion: DistortionSearch,
    /// Brightest centroids used for verification. None = up to the database's
    /// verification stars per FOV.
    pub max_centroids: Option<usize>,
    /// Minimum matched stars for acceptance. Default 6.
    pub min_matches: usize,
    /// Brightest (cluster-busted) centroids combined into patterns (K). Default 8.
    pub pattern_checking_stars: usize,
    /// Maximum match distance as a fraction of the FOV. Default 0.01.
    pub match_radius_tolerance: f32,
    /// False-positive probability threshold. Default 1e-5.
    pub match_threshold: f64,
    /// Edge-ratio tolerance for pattern lookup. None = database value; smaller
    /// values are raised to the database value.
    pub pattern_max_error: Option<f32>,
    /// Timeout in milliseconds. None = no timeout. Default 10000.
    pub solve_timeout_ms: Option<u64>,
    /// Fill [`SolveResult::visual`](super::SolveResult::visual).
    pub return_visual_diagnostics: bool,
    /// Fill [`SolveResult::raw_candidates`](super::SolveResult::raw_candidates).
    pub return_raw_matches: bool,
    #[serde(skip)]
    pub cancel: Option<CancelToken>,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            field_of_view_estimate_deg: None,
            field_of_view_max_error_deg: None,
            distortion: DistortionSearch::default(),
            max_centroids: None,
            min_matches: 6,
            pattern_checking_stars: 8,
            match_radius_tolerance: 0.01,
            match_threshold: 1e-5,
            pattern_max_error: None,
            solve_timeout_ms: Some(10_000),
            return_visual_diagnostics: false,
            return_raw_matches: false,
            cancel: None,
        }
    }
}

impl SolveConfig {
    /// Configuration with a FOV estimate and tolerance, in degrees.
    pub fn with_fov(estimate_deg: f32, max_error_deg: f32) -> Self {
        Self {
            field_of_view_estimate_deg: Some(estimate_deg),
            field_of_view_max_error_deg: Some(max_error_deg),
            ..Default::default()
        }
    }

    /// Reject contradictory or out-of-range settings for an image of
    /// `(height, width)` pixels.
    pub fn validate(&self, image_size: (u32, u32)) -> Result<()> {
        let (height, width) = image_size;
        ensure_config!(
            height > 0 && width > 0,
            "image size must be non-zero, got {height}x{width}"
        );
        ensure_config!(
            self.pattern_checking_stars >= PATTERN_SIZE,
            "pattern_checking_stars must be at least {PATTERN_SIZE}, got {}",
            self.pattern_checking_stars
        );
        ensure_config!(
            self.min_matches >= PATTERN_SIZE,
            "min_matches must be at least {PATTERN_SIZE}, got {}",
            self.min_matches
        );
        if let Some(max) = self.max_centroids {
            ensure_config!(
                self.min_matches <= max,
                "min_matches ({}) exceeds max_centroids ({max})",
                self.min_matches
            );
            ensure_config!(
                self.pattern_checking_stars <= max,
                "pattern_checking_stars ({}) exceeds max_centroids ({max})",
                self.pattern_checking_stars
            );
        }
        if let Some(fov) = self.field_of_view_estimate_deg {
            ensure_config!(
                fov.is_finite() && fov > 0.0 && fov < 180.0,
                "field_of_view_estimate_deg must lie in (0, 180), got {fov}"
            );
        }
        if let Some(err) = self.field_of_view_max_error_deg {
            ensure_config!(
                err.is_finite() && err >= 0.0,
                "field_of_view_max_error_deg must be >= 0, got {err}"
            );
            if let Some(fov) = self.field_of_view_estimate_deg {
                ensure_config!(
                    fov + err < 180.0,
                    "field of view search {fov}° ± {err}° reaches 180°"
                );
            }
        }
        ensure_config!(
            self.match_radius_tolerance > 0.0 && self.match_radius_tolerance <= 0.5,
            "match_radius_tolerance must lie in (0, 0.5], got {}",
            self.match_radius_tolerance
        );
        ensure_config!(
            self.match_threshold > 0.0 && self.match_threshold <= 1.0,
            "match_threshold must lie in (0, 1], got {}",
            self.match_threshold
        );
        if let Some(err) = self.pattern_max_error {
            ensure_config!(
                err.is_finite() && err > 0.0 && err < 0.25,
                "pattern_max_error must lie in (0, 0.25), got {err}"
            );
        }
        match self.distortion {
            DistortionSearch::Fixed(k) => {
                ensure_config!(
                    k.is_finite() && k.abs() < 1.0,
                    "distortion must satisfy |k| < 1, got {k}"
                );
            }
            DistortionSearch::Range { min, max, steps } => {
                ensure_config!(min <= max, "distortion range min ({min}) exceeds max ({max})");
                ensure_config!(
                    (1..=MAX_DISTORTION_STEPS).contains(&steps),
                    "distortion range steps must lie in 1..={MAX_DISTORTION_STEPS}, got {steps}"
                );
                ensure_config!(
                    min.is_finite() && max.is_finite() && min.abs() < 1.0 && max.abs() < 1.0,
                    "distortion range must satisfy |k| < 1, got {min}..{max}"
                );
            }
        }
        Ok(())
    }

    /// Reject settings that do not fit the database being solved against.
    pub fn validate_for(&self, properties: &DatabaseProperties) -> Result<()> {
        if let Some(err) = self.pattern_max_error {
            let limit = MAX_LOOKUP_ERROR_FACTOR * properties.pattern_max_error;
            ensure_config!(
                err <= limit,
                "pattern_max_error {err} exceeds {limit} \
                 ({MAX_LOOKUP_ERROR_FACTOR}x the database's)"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn defaults_are_valid() {
        assert!(SolveConfig::default().validate((1024, 1024)).is_ok());
    }

    #[test]
    fn contradictory_settings_are_rejected() {
        let bad = [
            SolveConfig {
                min_matches: 10,
                max_centroids: Some(8),
                ..Default::default()
            },
            SolveConfig {
                pattern_checking_stars: 3,
                ..Default::default()
            },
            SolveConfig {
                field_of_view_estimate_deg: Some(-5.0),
                ..Default::default()
            },
            SolveConfig {
                distortion: DistortionSearch::Range { min: 0.1, max: -0.1, steps: 3 },
                ..Default::default()
            },
            SolveConfig {
                match_radius_tolerance: 0.0,
                ..Default::default()
            },
            SolveConfig::with_fov(20.0, 1.0e5),
            SolveConfig::with_fov(179.0, 1.0),
            SolveConfig {
                distortion: DistortionSearch::Range { min: -0.1, max: 0.1, steps: u32::MAX },
                ..Default::default()
            },
        ];
        for config in &bad {
            assert!(
                matches!(config.validate((512, 512)), Err(Error::InvalidConfiguration(_))),
                "{config:?}"
            );
        }
        assert!(SolveConfig::default().validate((0, 512)).is_err());
    }

    #[test]
    fn lookup_error_is_bounded_by_database() {
        let properties = DatabaseProperties {
            pattern_bins: 250,
            pattern_max_error: 0.001,
            min_fov_rad: 0.2,
            max_fov_rad: 0.3,
            star_max_magnitude: 7.0,
            num_stars: 0,
            num_patterns: 0,
            epoch: 2000.0,
            verification_stars_per_fov: 150,
            lattice_field_oversampling: 100,
            patterns_per_lattice_field: 50,
            pattern_scheme_version: 1,
        };
        let wide = SolveConfig {
            pattern_max_error: Some(0.2),
            ..SolveConfig::with_fov(15.0, 0.0)
        };
        assert!(wide.validate((1024, 1024)).is_ok());
        assert!(matches!(wide.validate_for(&properties), Err(Error::InvalidConfiguration(_))));

        let modest = SolveConfig {
            pattern_max_error: Some(0.003),
            ..Default::default()
        };
        assert!(modest.validate_for(&properties).is_ok());
        assert!(SolveConfig::default().validate_for(&properties).is_ok());
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let config = SolveConfig {
            cancel: Some(token.clone()),
            ..Default::default()
        };
        token.cancel();
        assert!(config.cancel.as_ref().is_some_and(CancelToken::is_cancelled));
    }
}
