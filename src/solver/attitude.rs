//! Rotation fitting and attitude angles.

use nalgebra::{Matrix3 as Matrix3d, Rotation3, Vector3 as Vector3d};

use crate::star::uvec_to_radec;
use crate::{Matrix3, Quaternion, Vector3};

/// Least-squares rotation `R` with `camera[i] ≈ R · catalog[i]` (Wahba's problem).
///
/// Solved by SVD of the cross-covariance `H = Σ camera ⊗ catalog` in f64. A
/// reflection is turned into the nearest proper rotation by flipping the sign
/// of the smallest singular direction. Returns `None` for fewer than 2 pairs or a
/// failed decomposition.
pub fn find_rotation(camera: &[Vector3], catalog: &[Vector3]) -> Option<Matrix3> {
    if camera.len() != catalog.len() || camera.len() < 2 {
        return None;
    }
    let mut h = Matrix3d::<f64>::zeros();
    for (c, s) in camera.iter().zip(catalog) {
        h += c.cast::<f64>() * s.cast::<f64>().transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let d = (u * v_t).determinant().signum();
    let r = u * Matrix3d::from_diagonal(&Vector3d::new(1.0, 1.0, d)) * v_t;
    if r.iter().all(|x| x.is_finite()) {
        Some(r.cast::<f32>())
    } else {
        None
    }
}

/// Unit quaternion of a (numerically orthonormal) rotation matrix.
pub fn quaternion_from_matrix(rotation: &Matrix3) -> Quaternion {
    Quaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*rotation))
}

/// Boresight right ascension, declination and roll in degrees for a
/// catalog → camera rotation.
///
/// Roll is the position angle of the image "up" direction (toward row 0, the
/// camera −Y axis) measured from celestial north through east, in `[0, 360)`.
/// At the celestial poles north is taken along the catalog −X axis.
pub fn attitude_angles(rotation: &Quaternion) -> (f32, f32, f32) {
    let inv = rotation.inverse();
    let boresight = inv * Vector3::z();
    let up = inv * -Vector3::y();
    let (ra, dec) = uvec_to_radec(&boresight);

    let pole = Vector3::z();
    let mut north = pole - boresight * pole.dot(&boresight);
    if north.norm() < 1e-6 {
        north = -Vector3::x() - boresight * (-Vector3::x()).dot(&boresight);
    }
    let north = north.normalize();
    let east = north.cross(&boresight);
    let roll = up.dot(&east).atan2(up.dot(&north)).to_degrees().rem_euclid(360.0);
    (ra.to_degrees(), dec.to_degrees(), roll)
}
