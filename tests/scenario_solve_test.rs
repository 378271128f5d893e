//! The 26-star reference field: bright stars at fixed pixel positions of a
//! 2048×2048, 20° image, solved against a multiscale 10–30° database.

mod common;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use starfix::{
    focal_length_px, CatalogDatabase, Centroid, GenerateDatabaseConfig, Matrix3, SolveConfig,
    SolveStatus, StarRecord, Vector3,
};

use common::*;

const IMAGE_SIZE: (u32, u32) = (2048, 2048);
const FOV_DEG: f32 = 20.0;

/// (row, col) of the reference field, brightest first.
const FIELD: [(f32, f32); 26] = [
    (22.0000, 172.0000),
    (58.0000, 1322.0000),
    (281.4778, 1809.5222),
    (363.5357, 665.4929),
    (391.5174, 1176.0152),
    (446.2828, 989.0202),
    (514.0821, 1720.3455),
    (528.6808, 476.3013),
    (539.0000, 7.0000),
    (753.0000, 749.0000),
    (847.0000, 1879.0000),
    (856.5020, 1096.7631),
    (861.2842, 874.3388),
    (872.0000, 743.0000),
    (1137.0000, 1184.0000),
    (1227.7500, 1159.9601),
    (1238.0000, 945.0000),
    (1374.6011, 1609.8778),
    (1590.2715, 1874.9944),
    (1705.8259, 880.1600),
    (1749.5196, 62.0208),
    (1833.6779, 334.9551),
    (1851.0000, 766.4679),
    (1897.2766, 1577.3298),
    (1906.4833, 908.0000),
    (2035.3622, 886.7347),
];

/// Catalog in which the reference field appears at `rotation`: the 26 field
/// stars, faint unimaged stars inside the field and a background sky outside it.
fn scenario_catalog(rotation: &Matrix3, seed: u64) -> Vec<StarRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    let f = focal_length_px(FOV_DEG.to_radians(), IMAGE_SIZE.1);
    let to_sky = |row: f32, col: f32| {
        let cam = Vector3::new((col - 1024.0) / f, (row - 1024.0) / f, 1.0).normalize();
        rotation.transpose() * cam
    };

    let mut stars: Vec<StarRecord> = FIELD
        .iter()
        .enumerate()
        .map(|(i, &(row, col))| {
            StarRecord::from_direction(i as u64 + 1, to_sky(row, col), 1.0 + 0.2 * i as f32)
        })
        .collect();

    for i in 0..20 {
        let (row, col) = (rng.random_range(0.0..2048.0), rng.random_range(0.0..2048.0));
        stars.push(StarRecord::from_direction(
            50_000 + i,
            to_sky(row, col),
            rng.random_range(7.5..8.0),
        ));
    }

    let boresight = rotation.transpose() * Vector3::z();
    let exclusion = 16f32.to_radians().cos();
    let mut id = 100;
    while id < 4100 {
        let z: f32 = rng.random_range(-1.0..1.0);
        let theta: f32 = rng.random_range(0.0..std::f32::consts::TAU);
        let r = (1.0 - z * z).sqrt();
        let v = Vector3::new(r * theta.cos(), r * theta.sin(), z);
        if v.dot(&boresight) > exclusion {
            continue;
        }
        stars.push(StarRecord::from_direction(id, v, rng.random_range(6.5..7.5)));
        id += 1;
    }
    stars
}

fn scenario_database(stars: &[StarRecord]) -> CatalogDatabase {
    let config = GenerateDatabaseConfig {
        max_fov_deg: 30.0,
        min_fov_deg: Some(10.0),
        star_max_magnitude: Some(8.0),
        pattern_max_error: 0.005,
        lattice_field_oversampling: 10,
        patterns_per_lattice_field: 30,
        verification_stars_per_fov: 150,
        ..Default::default()
    };
    CatalogDatabase::generate(stars, &config).unwrap()
}

fn field_centroids() -> Vec<Centroid> {
    FIELD.iter().map(|&(row, col)| Centroid::new(row, col)).collect()
}

#[test]
fn test_reference_field_solves() {
    init_tracing();
    let truth = rotation_from_ra_dec_roll(83f32.to_radians(), (-5f32).to_radians(), 0.4);
    let db = scenario_database(&scenario_catalog(&truth, 1));
    assert_eq!(db.properties().min_fov_deg().round(), 10.0);

    let config = SolveConfig::with_fov(FOV_DEG, 1.0);
    let result = db
        .solve_from_centroids(&field_centroids(), IMAGE_SIZE, &config)
        .unwrap();

    assert_eq!(result.status, SolveStatus::MatchFound);
    assert!(result.num_matches >= config.min_matches);
    assert_eq!(result.num_matches, FIELD.len());
    for m in &result.matches {
        assert_eq!(m.star_id, m.centroid_index as u64 + 1);
    }

    let tolerance_arcsec = config.match_radius_tolerance * FOV_DEG * 3600.0;
    assert!(result.rms_residual_arcsec.unwrap() < tolerance_arcsec);
    assert!(result.max_residual_arcsec.unwrap() >= result.p90_residual_arcsec.unwrap());

    let rotation = result.attitude.unwrap().to_rotation_matrix().into_inner();
    assert!(rotation_error_deg(&rotation, &truth) < 0.01);
    assert!((result.ra_deg.unwrap() - 83.0).abs() < 0.01);
    assert!((result.dec_deg.unwrap() + 5.0).abs() < 0.01);
    assert!((result.fov_deg.unwrap() - FOV_DEG).abs() < 0.01);
}

#[test]
fn test_reference_field_solves_over_database_range() {
    let truth = rotation_from_ra_dec_roll(250f32.to_radians(), 40f32.to_radians(), 2.0);
    let db = scenario_database(&scenario_catalog(&truth, 2));

    // No FOV estimate: the sweep covers the database's 10–30° range
    let result = db
        .solve_from_centroids(&field_centroids(), IMAGE_SIZE, &SolveConfig::default())
        .unwrap();
    assert_eq!(result.status, SolveStatus::MatchFound);
    assert_eq!(result.num_matches, FIELD.len());
    assert!((result.fov_deg.unwrap() - FOV_DEG).abs() < 0.01);
    let rotation = result.attitude.unwrap().to_rotation_matrix().into_inner();
    assert!(rotation_error_deg(&rotation, &truth) < 0.01);
}

#[test]
fn test_shuffled_unweighted_field_gives_same_matches() {
    let truth = rotation_from_ra_dec_roll(120f32.to_radians(), 15f32.to_radians(), 1.2);
    let db = scenario_database(&scenario_catalog(&truth, 3));
    let config = SolveConfig::with_fov(FOV_DEG, 1.0);

    for seed in 0..10 {
        // Without weights the input order is the only brightness hint
        let mut order: Vec<usize> = (0..FIELD.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let centroids: Vec<Centroid> = order
            .iter()
            .map(|&i| Centroid::new(FIELD[i].0, FIELD[i].1))
            .collect();

        let result = db.solve_from_centroids(&centroids, IMAGE_SIZE, &config).unwrap();
        assert_eq!(result.status, SolveStatus::MatchFound, "seed {seed}");
        assert_eq!(result.num_matches, FIELD.len(), "seed {seed}");
        for m in &result.matches {
            assert_eq!(m.star_id, order[m.centroid_index] as u64 + 1, "seed {seed}");
        }
        let rotation = result.attitude.unwrap().to_rotation_matrix().into_inner();
        assert!(rotation_error_deg(&rotation, &truth) < 0.01, "seed {seed}");
    }
}
