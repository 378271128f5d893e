//! Synthetic sky helpers shared by the integration tests.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use starfix::distortion::RadialDistortion;
use starfix::{focal_length_px, CatalogDatabase, Centroid, GenerateDatabaseConfig, StarRecord};
use starfix::{Matrix3, Vector3};

pub const SKY_FOV_DEG: f32 = 15.0;
pub const SKY_IMAGE_SIZE: (u32, u32) = (1024, 1024);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

/// `n` stars uniform on the sphere with magnitudes in `[1, 6.5)`, ids from 1000.
pub fn random_sky(seed: u64, n: usize) -> Vec<StarRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let z: f32 = rng.random_range(-1.0..1.0);
            let theta: f32 = rng.random_range(0.0..std::f32::consts::TAU);
            let r = (1.0 - z * z).sqrt();
            let magnitude = rng.random_range(1.0..6.5);
            StarRecord::from_direction(
                1000 + i as u64,
                Vector3::new(r * theta.cos(), r * theta.sin(), z),
                magnitude,
            )
        })
        .collect()
}

/// Single-scale database over a random sky, sized for quick generation.
pub fn sky_database() -> CatalogDatabase {
    let config = GenerateDatabaseConfig {
        max_fov_deg: SKY_FOV_DEG,
        min_fov_deg: None,
        star_max_magnitude: None,
        pattern_max_error: 0.005,
        lattice_field_oversampling: 20,
        patterns_per_lattice_field: 30,
        verification_stars_per_fov: 50,
        ..Default::default()
    };
    CatalogDatabase::generate(&random_sky(7, 4000), &config).expect("database generation")
}

/// Catalog → camera rotation pointing the boresight at (ra, dec), rolled about it.
pub fn rotation_from_ra_dec_roll(ra: f32, dec: f32, roll: f32) -> Matrix3 {
    let cam_z = Vector3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin());
    let raw_x = Vector3::z().cross(&cam_z);
    let x0 = if raw_x.norm() > 1e-6 {
        raw_x.normalize()
    } else {
        Vector3::x().cross(&cam_z).normalize()
    };
    let y0 = cam_z.cross(&x0);
    let cam_x = x0 * roll.cos() + y0 * roll.sin();
    let cam_y = -x0 * roll.sin() + y0 * roll.cos();
    Matrix3::new(
        cam_x.x, cam_x.y, cam_x.z, //
        cam_y.x, cam_y.y, cam_y.z, //
        cam_z.x, cam_z.y, cam_z.z,
    )
}

/// Uniformly random attitude.
pub fn random_rotation(rng: &mut StdRng) -> Matrix3 {
    let ra = rng.random_range(0.0..std::f32::consts::TAU);
    let dec = rng.random_range(-1.0f32..1.0).asin();
    let roll = rng.random_range(0.0..std::f32::consts::TAU);
    rotation_from_ra_dec_roll(ra, dec, roll)
}

/// A catalog star imaged by a synthetic camera.
#[derive(Debug, Clone, Copy)]
pub struct ImagedStar {
    pub id: u64,
    pub magnitude: f32,
    pub row: f32,
    pub col: f32,
}

/// Project every database star through a pinhole camera with radial
/// distortion `k`, keeping those at least one pixel inside the image.
pub fn image_stars(
    db: &CatalogDatabase,
    rotation: &Matrix3,
    fov_rad: f32,
    image_size: (u32, u32),
    k: f32,
) -> Vec<ImagedStar> {
    let (height, width) = image_size;
    let f = focal_length_px(fov_rad, width);
    let distortion = RadialDistortion::new(k);
    let (half_w, half_h) = (width as f32 / 2.0, height as f32 / 2.0);
    db.stars()
        .iter()
        .filter_map(|star| {
            let cam = rotation * star.direction();
            if cam.z <= 0.0 {
                return None;
            }
            let (x, y) = distortion.distort(cam.x / cam.z * f, cam.y / cam.z * f, width);
            (x.abs() < half_w - 1.0 && y.abs() < half_h - 1.0).then_some(ImagedStar {
                id: star.id,
                magnitude: star.magnitude,
                row: y + half_h,
                col: x + half_w,
            })
        })
        .collect()
}

/// Weighted centroids of imaged stars, brighter stars weighing more.
pub fn centroids_of(stars: &[ImagedStar]) -> Vec<Centroid> {
    stars
        .iter()
        .map(|s| Centroid::with_weight(s.row, s.col, 10.0 - s.magnitude))
        .collect()
}

/// Angle of the rotation `a · bᵀ`, in degrees.
pub fn rotation_error_deg(a: &Matrix3, b: &Matrix3) -> f32 {
    let m = (a * b.transpose()).cast::<f64>();
    let axis = nalgebra::Vector3::new(
        m[(2, 1)] - m[(1, 2)],
        m[(0, 2)] - m[(2, 0)],
        m[(1, 0)] - m[(0, 1)],
    );
    let sin = 0.5 * axis.norm();
    let cos = 0.5 * (m.trace() - 1.0);
    sin.atan2(cos).to_degrees() as f32
}
