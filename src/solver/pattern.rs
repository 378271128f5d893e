//! Four-star pattern descriptors.
//!
//! A pattern is a group of 4 stars. Its geometric signature is derived from the
//! 6 pairwise angular separations (C(4,2) = 6): sorted ascending, the 5 smaller
//! ones are divided by the largest, giving 5 edge ratios in [0, 1] that do not
//! change under rotation or (to first order) scale.
//!
//! Each ratio is quantized into `bins` integer bins and the 5 bin numbers are
//! folded into one 64-bit [`PatternHash`]. Because measured ratios carry noise,
//! lookups enumerate every bucket whose ratio box intersects `ratio ± max_error`
//! (see [`neighbor_keys`]), nearest buckets first.

use serde::{Deserialize, Serialize};

use crate::Vector3;

/// Number of stars in each pattern.
pub const PATTERN_SIZE: usize = 4;
/// Number of pairwise edges: C(4,2) = 6.
pub const NUM_EDGES: usize = 6;
/// Number of edge ratios (all edges except the largest): 6 - 1 = 5.
pub const NUM_EDGE_RATIOS: usize = 5;

/// Version of the descriptor and hash layout. Stored in database assets; bump
/// whenever edge ratios, quantization or canonical ordering change.
pub const PATTERN_SCHEME_VERSION: u32 = 1;

/// Number of bins per ratio dimension for a tolerated ratio error.
pub fn bins_for_max_error(pattern_max_error: f32) -> u32 {
    ((0.25 / pattern_max_error).round() as u32).max(1)
}

// ── Angle / distance conversions on the unit sphere ─────────────────────────

/// Chord length between two unit vectors → angle between them (radians).
#[inline]
pub fn angle_from_distance(dist: f32) -> f32 {
    2.0 * (0.5 * dist).clamp(-1.0, 1.0).asin()
}

/// Angle between two unit vectors, accurate for small separations.
#[inline]
pub fn angle_between(a: &Vector3, b: &Vector3) -> f32 {
    angle_from_distance((a - b).norm())
}

// ── Descriptor ──────────────────────────────────────────────────────────────

/// The 6 pairwise angles of a 4-star group, ascending.
pub fn sorted_edge_angles(vectors: &[Vector3; PATTERN_SIZE]) -> [f32; NUM_EDGES] {
    let mut edges = [0.0f32; NUM_EDGES];
    let mut n = 0;
    for i in 0..PATTERN_SIZE {
        for j in (i + 1)..PATTERN_SIZE {
            edges[n] = angle_between(&vectors[i], &vectors[j]);
            n += 1;
        }
    }
    edges.sort_unstable_by(f32::total_cmp);
    edges
}

/// The 5 smaller edges divided by the largest. All zero for a degenerate group.
pub fn edge_ratios(sorted_edges: &[f32; NUM_EDGES]) -> [f32; NUM_EDGE_RATIOS] {
    let largest = sorted_edges[NUM_EDGES - 1];
    if largest <= 0.0 {
        return [0.0; NUM_EDGE_RATIOS];
    }
    std::array::from_fn(|i| sorted_edges[i] / largest)
}

/// Bin numbers of 5 ratios. A ratio of exactly 1 falls in the last bin.
pub fn quantize(ratios: &[f32; NUM_EDGE_RATIOS], bins: u32) -> [u32; NUM_EDGE_RATIOS] {
    std::array::from_fn(|i| ((ratios[i].max(0.0) * bins as f32) as u32).min(bins - 1))
}

/// Quantized pattern code: `Σ key[i] · bins^i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternHash(pub u64);

impl PatternHash {
    pub fn from_key(key: &[u32; NUM_EDGE_RATIOS], bins: u32) -> Self {
        let bins = bins as u64;
        let (code, _) = key.iter().fold((0u64, 1u64), |(code, factor), &k| {
            (
                code.wrapping_add((k as u64).wrapping_mul(factor)),
                factor.wrapping_mul(bins),
            )
        });
        Self(code)
    }

    pub fn from_ratios(ratios: &[f32; NUM_EDGE_RATIOS], bins: u32) -> Self {
        Self::from_key(&quantize(ratios, bins), bins)
    }
}

/// Every bin key whose ratio box intersects `ratios ± max_error`, sorted by
/// squared bin distance from the key of `ratios` (ties in enumeration order).
pub fn neighbor_keys(
    ratios: &[f32; NUM_EDGE_RATIOS],
    max_error: f32,
    bins: u32,
) -> Vec<[u32; NUM_EDGE_RATIOS]> {
    let center = quantize(ratios, bins);
    let lo: [u32; NUM_EDGE_RATIOS] =
        std::array::from_fn(|i| quantize_one(ratios[i] - max_error, bins));
    let hi: [u32; NUM_EDGE_RATIOS] =
        std::array::from_fn(|i| quantize_one(ratios[i] + max_error, bins));

    let mut keys = Vec::new();
    let mut current = lo;
    loop {
        keys.push(current);
        // Odometer increment over the box
        let mut dim = 0;
        loop {
            if dim == NUM_EDGE_RATIOS {
                let dist = |k: &[u32; NUM_EDGE_RATIOS]| -> u32 {
                    (0..NUM_EDGE_RATIOS)
                        .map(|i| (k[i] as i64 - center[i] as i64).pow(2) as u32)
                        .sum()
                };
                keys.sort_by_key(dist);
                return keys;
            }
            if current[dim] < hi[dim] {
                current[dim] += 1;
                break;
            }
            current[dim] = lo[dim];
            dim += 1;
        }
    }
}

fn quantize_one(ratio: f32, bins: u32) -> u32 {
    ((ratio.max(0.0) * bins as f32) as u32).min(bins - 1)
}

// ── Canonical ordering ──────────────────────────────────────────────────────

/// Order of the 4 pattern stars by distance from their mean direction, ties by
/// position. Image and catalog patterns put in this order pair up star by star.
pub fn canonical_order(vectors: &[Vector3; PATTERN_SIZE]) -> [usize; PATTERN_SIZE] {
    let mean = vectors.iter().fold(Vector3::zeros(), |acc, v| acc + v) / PATTERN_SIZE as f32;
    let dist: [f32; PATTERN_SIZE] = std::array::from_fn(|i| (vectors[i] - mean).norm_squared());
    let mut order = [0, 1, 2, 3];
    order.sort_by(|&a, &b| dist[a].total_cmp(&dist[b]).then(a.cmp(&b)));
    order
}
