//! End-to-end solves of synthetic centroids projected from a random sky with
//! known attitudes.

mod common;

use std::collections::BTreeSet;
use std::sync::OnceLock;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use starfix::{
    CancelToken, CatalogDatabase, Centroid, DistortionSearch, FailureReason, SolveConfig,
    SolveStatus,
};

use common::*;

fn database() -> &'static CatalogDatabase {
    static DB: OnceLock<CatalogDatabase> = OnceLock::new();
    DB.get_or_init(|| {
        init_tracing();
        sky_database()
    })
}

fn config() -> SolveConfig {
    SolveConfig::with_fov(SKY_FOV_DEG, 0.5)
}

#[test]
fn test_round_trip_recovers_attitude() {
    let db = database();
    let mut rng = StdRng::seed_from_u64(42);
    for trial in 0..5 {
        let truth = random_rotation(&mut rng);
        let stars = image_stars(db, &truth, SKY_FOV_DEG.to_radians(), SKY_IMAGE_SIZE, 0.0);
        let centroids = centroids_of(&stars);
        assert!(centroids.len() >= 8, "trial {trial}: only {} stars", centroids.len());

        let result = db
            .solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &config())
            .unwrap();
        assert_eq!(result.status, SolveStatus::MatchFound, "trial {trial}");

        let rotation = result.attitude.unwrap().to_rotation_matrix().into_inner();
        let err = rotation_error_deg(&rotation, &truth);
        assert!(err < 0.01, "trial {trial}: attitude off by {err}°");
        assert!((result.fov_deg.unwrap() - SKY_FOV_DEG).abs() < 0.01);

        // Every synthetic star matched to its own catalog entry
        assert_eq!(result.num_matches, centroids.len(), "trial {trial}");
        assert!(result.unmatched_centroids.is_empty());
        for m in &result.matches {
            assert_eq!(m.star_id, stars[m.centroid_index].id);
            assert!(m.residual_arcsec < 1.0);
        }
        assert!(result.probability.unwrap() < 1e-5);
    }
}

#[test]
fn test_solved_wcs_maps_back_to_centroids() {
    let db = database();
    let mut rng = StdRng::seed_from_u64(3);
    let truth = random_rotation(&mut rng);
    let stars = image_stars(db, &truth, SKY_FOV_DEG.to_radians(), SKY_IMAGE_SIZE, 0.0);
    let result = db
        .solve_from_centroids(&centroids_of(&stars), SKY_IMAGE_SIZE, &config())
        .unwrap();
    assert!(result.is_match());

    for m in &result.matches {
        let star = db.star(m.star_id).unwrap();
        let (ra, dec) = star.radec();
        let (row, col) = result
            .world_to_pixel(ra.to_degrees(), dec.to_degrees())
            .unwrap();
        assert!((row - m.row).abs() < 0.05 && (col - m.col).abs() < 0.05);

        let (ra2, dec2) = result.pixel_to_world(m.row, m.col).unwrap();
        let back = starfix::star::radec_to_uvec(ra2.to_radians(), dec2.to_radians());
        let arcsec = (back - star.direction()).norm().to_degrees() * 3600.0;
        assert!(arcsec < 2.0, "{arcsec}\"");
    }
}

#[test]
fn test_permuted_centroids_give_same_match_set() {
    let db = database();
    let mut rng = StdRng::seed_from_u64(11);
    let truth = random_rotation(&mut rng);
    let stars = image_stars(db, &truth, SKY_FOV_DEG.to_radians(), SKY_IMAGE_SIZE, 0.0);
    let centroids = centroids_of(&stars);

    let mut permuted: Vec<(usize, Centroid)> = centroids.iter().copied().enumerate().collect();
    permuted.shuffle(&mut rng);
    let permuted_centroids: Vec<Centroid> = permuted.iter().map(|(_, c)| *c).collect();

    let a = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &config()).unwrap();
    let b = db
        .solve_from_centroids(&permuted_centroids, SKY_IMAGE_SIZE, &config())
        .unwrap();
    assert!(a.is_match() && b.is_match());

    let ids = |r: &starfix::SolveResult| {
        r.matches.iter().map(|m| m.star_id).collect::<BTreeSet<_>>()
    };
    assert_eq!(ids(&a), ids(&b));

    // Indices in `b` refer to the permuted list
    for m in &b.matches {
        let original = permuted[m.centroid_index].0;
        assert_eq!(stars[original].id, m.star_id);
    }
    let qa = a.attitude.unwrap();
    let qb = b.attitude.unwrap();
    assert!(qa.angle_to(&qb).to_degrees() < 1e-3);
}

#[test]
fn test_repeated_solve_is_identical() {
    let db = database();
    let mut rng = StdRng::seed_from_u64(5);
    let truth = random_rotation(&mut rng);
    let centroids = centroids_of(&image_stars(
        db,
        &truth,
        SKY_FOV_DEG.to_radians(),
        SKY_IMAGE_SIZE,
        0.0,
    ));
    let config = SolveConfig {
        return_visual_diagnostics: true,
        return_raw_matches: true,
        ..config()
    };
    let a = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &config).unwrap();
    let b = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &config).unwrap();
    assert!(a.is_match());
    assert_eq!(a.attitude, b.attitude);
    assert_eq!(a.fov_deg, b.fov_deg);
    assert_eq!(a.matches, b.matches);
    assert_eq!(a.probability, b.probability);
    assert_eq!(a.visual, b.visual);
    assert_eq!(a.raw_candidates, b.raw_candidates);
}

#[test]
fn test_diagnostics_are_reported_on_request() {
    let db = database();
    let mut rng = StdRng::seed_from_u64(8);
    let truth = random_rotation(&mut rng);
    let stars = image_stars(db, &truth, SKY_FOV_DEG.to_radians(), SKY_IMAGE_SIZE, 0.0);
    let centroids = centroids_of(&stars);

    let plain = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &config()).unwrap();
    assert!(plain.visual.is_none() && plain.raw_candidates.is_none());

    let config = SolveConfig {
        return_visual_diagnostics: true,
        return_raw_matches: true,
        ..config()
    };
    let result = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &config).unwrap();
    let visual = result.visual.as_ref().unwrap();
    let projected: BTreeSet<u64> = visual.projected_stars.iter().map(|p| p.star_id).collect();
    assert!(stars.iter().all(|s| projected.contains(&s.id)));
    assert!(visual.sweep.points_tried >= 1 && visual.sweep.candidates_verified >= 1);
    let pattern = visual.pattern_centroids.unwrap();
    let pattern_ids = visual.pattern_star_ids.unwrap();
    for (ci, id) in pattern.iter().zip(pattern_ids) {
        assert_eq!(stars[*ci].id, id);
    }

    let raw = result.raw_candidates.as_ref().unwrap();
    assert!(raw.iter().any(|c| c.accepted));
    assert!(raw.iter().all(|c| c.pattern_centroids.iter().all(|&i| i < centroids.len())));
}

#[test]
fn test_unweighted_centroids_use_input_order() {
    let db = database();
    let mut rng = StdRng::seed_from_u64(21);
    let truth = random_rotation(&mut rng);
    let mut stars = image_stars(db, &truth, SKY_FOV_DEG.to_radians(), SKY_IMAGE_SIZE, 0.0);
    stars.sort_by(|a, b| a.magnitude.total_cmp(&b.magnitude));
    let centroids: Vec<Centroid> = stars.iter().map(|s| Centroid::new(s.row, s.col)).collect();
    let result = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &config()).unwrap();
    assert!(result.is_match());
    assert_eq!(result.num_matches, centroids.len());
}

#[test]
fn test_solve_without_fov_estimate() {
    let db = database();
    let mut rng = StdRng::seed_from_u64(17);
    let truth = random_rotation(&mut rng);
    let stars = image_stars(db, &truth, SKY_FOV_DEG.to_radians(), SKY_IMAGE_SIZE, 0.0);
    let result = db
        .solve_from_centroids(&centroids_of(&stars), SKY_IMAGE_SIZE, &SolveConfig::default())
        .unwrap();
    assert!(result.is_match());
    assert!((result.fov_deg.unwrap() - SKY_FOV_DEG).abs() < 0.01);
    let rotation = result.attitude.unwrap().to_rotation_matrix().into_inner();
    assert!(rotation_error_deg(&rotation, &truth) < 0.01);
}

#[test]
fn test_distortion_sweep_recovers_coefficient() {
    let db = database();
    let mut rng = StdRng::seed_from_u64(29);
    let truth = random_rotation(&mut rng);
    let stars = image_stars(db, &truth, SKY_FOV_DEG.to_radians(), SKY_IMAGE_SIZE, 0.05);
    let centroids = centroids_of(&stars);
    let config = SolveConfig {
        distortion: DistortionSearch::Range {
            min: 0.0,
            max: 0.1,
            steps: 5,
        },
        ..config()
    };
    let result = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &config).unwrap();
    assert!(result.is_match());
    assert!((result.distortion_k.unwrap() - 0.05).abs() < 1e-6);
    assert_eq!(result.num_matches, centroids.len());
    let rotation = result.attitude.unwrap().to_rotation_matrix().into_inner();
    assert!(rotation_error_deg(&rotation, &truth) < 0.01);
}

#[test]
fn test_too_few_centroids() {
    let db = database();
    let centroids = vec![
        Centroid::with_weight(100.0, 100.0, 3.0),
        Centroid::with_weight(400.0, 700.0, 2.0),
        Centroid::with_weight(900.0, 300.0, 1.0),
    ];
    let result = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &config()).unwrap();
    assert_eq!(result.status, SolveStatus::NoMatchFound);
    assert_eq!(result.failure_reason, Some(FailureReason::TooFewCentroids));
    assert!(result.attitude.is_none());

    // Non-finite positions do not count
    let mut with_nan = centroids.clone();
    with_nan.push(Centroid::new(f32::NAN, 10.0));
    let result = db.solve_from_centroids(&with_nan, SKY_IMAGE_SIZE, &config()).unwrap();
    assert_eq!(result.failure_reason, Some(FailureReason::TooFewCentroids));
}

#[test]
fn test_fewer_centroids_than_pattern_stars_still_searches() {
    let db = database();
    // Five centroids cannot reach six matches
    let centroids: Vec<Centroid> = [
        (100.0, 120.0),
        (300.0, 800.0),
        (650.0, 410.0),
        (900.0, 100.0),
        (512.0, 512.0),
    ]
    .iter()
    .map(|&(r, c)| Centroid::new(r, c))
    .collect();
    let config = SolveConfig {
        return_visual_diagnostics: true,
        ..config()
    };
    let result = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &config).unwrap();
    assert_eq!(result.status, SolveStatus::NoMatchFound);
    assert_eq!(result.failure_reason, Some(FailureReason::NoConsistentPattern));
    assert!(result.visual.unwrap().sweep.patterns_checked >= 5);
}

#[test]
fn test_timeout_and_cancel_stop_search() {
    let db = database();
    let mut rng = StdRng::seed_from_u64(42);
    let truth = random_rotation(&mut rng);
    let centroids = centroids_of(&image_stars(
        db,
        &truth,
        SKY_FOV_DEG.to_radians(),
        SKY_IMAGE_SIZE,
        0.0,
    ));

    let timeout = SolveConfig {
        solve_timeout_ms: Some(0),
        ..config()
    };
    let result = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &timeout).unwrap();
    assert_eq!(result.status, SolveStatus::Timeout);
    assert!(result.failure_reason.is_none());

    let token = CancelToken::new();
    token.cancel();
    let cancelled = SolveConfig {
        cancel: Some(token),
        ..config()
    };
    let result = db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &cancelled).unwrap();
    assert_eq!(result.status, SolveStatus::Cancelled);
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let db = database();
    let centroids = vec![Centroid::new(1.0, 1.0); 10];
    let bad = SolveConfig {
        pattern_checking_stars: 2,
        ..config()
    };
    assert!(matches!(
        db.solve_from_centroids(&centroids, SKY_IMAGE_SIZE, &bad),
        Err(starfix::Error::InvalidConfiguration(_))
    ));
    assert!(matches!(
        db.solve_from_centroids(&centroids, (0, 1024), &config()),
        Err(starfix::Error::InvalidConfiguration(_))
    ));
}
