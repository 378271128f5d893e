//! Spatial index over unit vectors for fast cone (angular radius) queries.
//!
//! The cube `[-1, 1]^3` enclosing the unit sphere is cut into
//! `cells_per_axis^3` voxels. Each star slot is filed under the voxel containing
//! its direction; voxels are stored as one compact offset table into a flat
//! slot list. A cone of angular radius `r` around `d` is contained in the ball of
//! chord radius `2 sin(r / 2)` around `d`, so a query only visits voxels
//! overlapping that ball's bounding box, then filters by dot product.
//!
//! Slots are kept in ascending order inside every voxel and query results are
//! sorted, so with a brightness-sorted star table results come out brightest first.

use rkyv::{Archive, Deserialize, Serialize};

use crate::{StarRecord, Vector3};

/// Largest voxel count per axis an index may have.
pub const MAX_CELLS_PER_AXIS: u32 = 256;

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct SkyIndex {
    cells_per_axis: u32,
    /// `cells_per_axis^3 + 1` offsets into `slots`.
    cell_starts: Vec<u32>,
    slots: Vec<u32>,
}

impl SkyIndex {
    /// Index `stars` with `cells_per_axis` voxels along each cube axis, clamped
    /// to `1..=MAX_CELLS_PER_AXIS`.
    pub fn build(stars: &[StarRecord], cells_per_axis: u32) -> Self {
        let n = cells_per_axis.clamp(1, MAX_CELLS_PER_AXIS);
        let num_cells = (n * n * n) as usize;

        let mut counts = vec![0u32; num_cells + 1];
        let cells: Vec<usize> = stars
            .iter()
            .map(|s| cell_of(n, &s.direction()))
            .collect();
        for &cell in &cells {
            counts[cell + 1] += 1;
        }
        for i in 1..counts.len() {
            counts[i] += counts[i - 1];
        }

        let cell_starts = counts;
        let mut fill = cell_starts.clone();
        let mut slots = vec![0u32; stars.len()];
        for (slot, &cell) in cells.iter().enumerate() {
            slots[fill[cell] as usize] = slot as u32;
            fill[cell] += 1;
        }

        Self {
            cells_per_axis: n,
            cell_starts,
            slots,
        }
    }

    /// Slots of all stars within `radius_rad` of `dir`, sorted ascending.
    ///
    /// `dir` need not be normalized; a zero vector yields no results.
    pub fn query(&self, stars: &[StarRecord], dir: &Vector3, radius_rad: f32) -> Vec<usize> {
        let norm = dir.norm();
        if stars.is_empty() || norm == 0.0 || !norm.is_finite() {
            return Vec::new();
        }
        let dir = dir / norm;
        let radius = radius_rad.clamp(0.0, std::f32::consts::PI);
        let cos_radius = radius.cos();
        let chord = 2.0 * (radius / 2.0).sin();

        let n = self.cells_per_axis;
        let lo: [u32; 3] = std::array::from_fn(|axis| axis_cell(n, dir[axis] - chord));
        let hi: [u32; 3] = std::array::from_fn(|axis| axis_cell(n, dir[axis] + chord));

        let mut out = Vec::new();
        for ix in lo[0]..=hi[0] {
            for iy in lo[1]..=hi[1] {
                for iz in lo[2]..=hi[2] {
                    let cell = ((ix * n + iy) * n + iz) as usize;
                    let start = self.cell_starts[cell] as usize;
                    let end = self.cell_starts[cell + 1] as usize;
                    out.extend(
                        self.slots[start..end]
                            .iter()
                            .map(|&slot| slot as usize)
                            .filter(|&slot| stars[slot].direction().dot(&dir) >= cos_radius),
                    );
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// Structural consistency check used after deserializing an asset.
    pub(crate) fn check(&self, num_stars: usize) -> Result<(), String> {
        if !(1..=MAX_CELLS_PER_AXIS).contains(&self.cells_per_axis) {
            return Err(format!(
                "sky index has {} cells per axis, expected 1..={MAX_CELLS_PER_AXIS}",
                self.cells_per_axis
            ));
        }
        let n = self.cells_per_axis as usize;
        if self.cell_starts.len() != n * n * n + 1 {
            return Err(format!(
                "sky index offset table has {} entries, expected {}",
                self.cell_starts.len(),
                n * n * n + 1
            ));
        }
        if self.cell_starts.windows(2).any(|w| w[0] > w[1]) {
            return Err("sky index offsets are not monotone".into());
        }
        if self.cell_starts.first() != Some(&0)
            || self.cell_starts.last().map(|&e| e as usize) != Some(self.slots.len())
        {
            return Err("sky index offsets do not span the slot list".into());
        }
        if self.slots.len() != num_stars || self.slots.iter().any(|&s| s as usize >= num_stars) {
            return Err("sky index references stars outside the star table".into());
        }
        Ok(())
    }
}

fn axis_cell(n: u32, coord: f32) -> u32 {
    let u = ((coord.clamp(-1.0, 1.0) + 1.0) * 0.5 * n as f32).floor();
    (u as u32).min(n - 1)
}

fn cell_of(n: u32, v: &Vector3) -> usize {
    let (ix, iy, iz) = (axis_cell(n, v.x), axis_cell(n, v.y), axis_cell(n, v.z));
    ((ix * n + iy) * n + iz) as usize
}
