use rkyv::{Archive, Deserialize, Serialize};

use crate::Vector3;

/// One catalog entry used for star matching.
///
/// Directions are unit vectors in the catalog reference frame (ICRS-like:
/// +X toward RA 0 / Dec 0, +Z toward the north celestial pole). Proper motion,
/// if any, is assumed to have been applied to the observation epoch already.
/// The magnitude is a generic brightness value; lower is brighter.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct StarRecord {
    pub id: u64,
    pub uvec: [f32; 3],
    pub magnitude: f32,
}

impl StarRecord {
    /// Build a record from right ascension and declination in radians.
    pub fn from_radec(id: u64, ra_rad: f32, dec_rad: f32, magnitude: f32) -> Self {
        let v = radec_to_uvec(ra_rad, dec_rad);
        Self {
            id,
            uvec: [v.x, v.y, v.z],
            magnitude,
        }
    }

    /// Build a record from a direction; the vector is normalized.
    pub fn from_direction(id: u64, direction: Vector3, magnitude: f32) -> Self {
        let v = direction.normalize();
        Self {
            id,
            uvec: [v.x, v.y, v.z],
            magnitude,
        }
    }

    pub fn direction(&self) -> Vector3 {
        Vector3::from(self.uvec)
    }

    /// Right ascension and declination in radians, RA in `[0, 2π)`.
    pub fn radec(&self) -> (f32, f32) {
        uvec_to_radec(&self.direction())
    }
}

pub fn radec_to_uvec(ra_rad: f32, dec_rad: f32) -> Vector3 {
    let (sin_ra, cos_ra) = ra_rad.sin_cos();
    let (sin_dec, cos_dec) = dec_rad.sin_cos();
    Vector3::new(cos_dec * cos_ra, cos_dec * sin_ra, sin_dec)
}

pub fn uvec_to_radec(v: &Vector3) -> (f32, f32) {
    let dec = v.z.clamp(-1.0, 1.0).asin();
    let ra = v.y.atan2(v.x).rem_euclid(std::f32::consts::TAU);
    (ra, dec)
}
