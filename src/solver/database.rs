//! The catalog database: star table, spatial index, pattern index, metadata.
//!
//! Stars are stored brightest first, so a star's slot is also its brightness
//! rank. Patterns reference stars by slot; callers see star ids.
//!
//! On disk a database is a 24-byte header followed by an rkyv payload:
//!
//! ```text
//! magic "STARFXDB" | format version u32 LE | pattern scheme version u32 LE
//!   | payload length u64 LE | payload
//! ```

use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::sky_index::SkyIndex;
use crate::{StarRecord, Vector3};

use super::pattern::{
    bins_for_max_error, neighbor_keys, PatternHash, NUM_EDGE_RATIOS, PATTERN_SCHEME_VERSION,
    PATTERN_SIZE,
};

/// Leading bytes of every database asset.
pub const DATABASE_MAGIC: [u8; 8] = *b"STARFXDB";
/// Version of the container layout and payload structure.
pub const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 24;
/// Near-hash lookups never search wider than this multiple of the database's
/// own ratio tolerance, which keeps the searched box at a few bins per axis.
pub const MAX_LOOKUP_ERROR_FACTOR: f32 = 4.0;
/// Smallest ratio tolerance a database may be built with.
pub(crate) const MIN_PATTERN_MAX_ERROR: f32 = 1e-4;

// ── Metadata ────────────────────────────────────────────────────────────────

/// Parameters the database was built with.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize)]
pub struct DatabaseProperties {
    /// Quantization bins per edge-ratio dimension, `round(0.25 / pattern_max_error)`.
    pub pattern_bins: u32,
    /// Edge-ratio tolerance the bins were sized for.
    pub pattern_max_error: f32,
    /// Smallest field of view the patterns cover (radians).
    pub min_fov_rad: f32,
    /// Largest field of view the patterns cover (radians).
    pub max_fov_rad: f32,
    /// Faintest magnitude kept.
    pub star_max_magnitude: f32,
    pub num_stars: u32,
    pub num_patterns: u32,
    /// Epoch of the star positions (e.g. 2000.0 for J2000/ICRS).
    pub epoch: f32,
    /// Catalog stars per field used for cluster busting and verification.
    pub verification_stars_per_fov: u32,
    pub lattice_field_oversampling: u32,
    pub patterns_per_lattice_field: u32,
    pub pattern_scheme_version: u32,
}

impl DatabaseProperties {
    pub fn min_fov_deg(&self) -> f32 {
        self.min_fov_rad.to_degrees()
    }

    pub fn max_fov_deg(&self) -> f32 {
        self.max_fov_rad.to_degrees()
    }
}

// ── Pattern index ───────────────────────────────────────────────────────────

/// One catalog pattern.
#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
pub struct PatternEntry {
    /// Star slots in canonical order (distance from the pattern's mean
    /// direction, ties by slot).
    pub stars: [u32; PATTERN_SIZE],
    /// Largest pairwise angle of the pattern (radians).
    pub largest_edge: f32,
}

/// Patterns grouped into buckets by hash code.
///
/// `codes` is sorted and unique; bucket `i` holds
/// `entries[offsets[i]..offsets[i + 1]]`.
#[derive(Debug, Clone, Default, Archive, Serialize, Deserialize)]
pub(crate) struct PatternIndex {
    codes: Vec<u64>,
    offsets: Vec<u32>,
    entries: Vec<PatternEntry>,
}

impl PatternIndex {
    pub(crate) fn from_hashed(mut hashed: Vec<(PatternHash, PatternEntry)>) -> Self {
        hashed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.stars.cmp(&b.1.stars)));
        let mut codes = Vec::new();
        let mut offsets = Vec::new();
        let mut entries = Vec::with_capacity(hashed.len());
        for (hash, entry) in hashed {
            if codes.last() != Some(&hash.0) {
                codes.push(hash.0);
                offsets.push(entries.len() as u32);
            }
            entries.push(entry);
        }
        offsets.push(entries.len() as u32);
        Self {
            codes,
            offsets,
            entries,
        }
    }

    fn bucket(&self, hash: PatternHash) -> &[PatternEntry] {
        match self.codes.binary_search(&hash.0) {
            Ok(i) => &self.entries[self.offsets[i] as usize..self.offsets[i + 1] as usize],
            Err(_) => &[],
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn check(&self, num_stars: usize) -> std::result::Result<(), String> {
        if self.offsets.len() != self.codes.len() + 1 {
            return Err(format!(
                "pattern index has {} buckets but {} offsets",
                self.codes.len(),
                self.offsets.len()
            ));
        }
        if self.codes.windows(2).any(|w| w[0] >= w[1]) {
            return Err("pattern bucket codes are not strictly ascending".into());
        }
        if self.offsets.windows(2).any(|w| w[0] > w[1])
            || self.offsets.first() != Some(&0)
            || self.offsets.last().map(|&o| o as usize) != Some(self.entries.len())
        {
            return Err("pattern bucket offsets are not monotone over the entry list".into());
        }
        for entry in &self.entries {
            if entry.stars.iter().any(|&s| s as usize >= num_stars) {
                return Err(format!(
                    "pattern {:?} references a star outside the table",
                    entry.stars
                ));
            }
            let mut sorted = entry.stars;
            sorted.sort_unstable();
            if sorted.windows(2).any(|w| w[0] == w[1]) {
                return Err(format!("pattern {:?} repeats a star", entry.stars));
            }
            if !(entry.largest_edge.is_finite() && entry.largest_edge > 0.0) {
                return Err(format!("pattern {:?} has an invalid largest edge", entry.stars));
            }
        }
        Ok(())
    }
}

// ── The database ────────────────────────────────────────────────────────────

/// A loaded catalog database. Immutable; share it by reference across threads.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct CatalogDatabase {
    /// Brightest first.
    stars: Vec<StarRecord>,
    /// Star ids ascending; `id_slots[i]` is the slot of `sorted_ids[i]`.
    sorted_ids: Vec<u64>,
    id_slots: Vec<u32>,
    sky_index: SkyIndex,
    patterns: PatternIndex,
    properties: DatabaseProperties,
}

impl CatalogDatabase {
    /// Assemble a database from brightness-sorted stars and hashed patterns.
    /// `properties.num_stars` and `num_patterns` are filled in here.
    pub(crate) fn from_parts(
        stars: Vec<StarRecord>,
        patterns: Vec<(PatternHash, PatternEntry)>,
        mut properties: DatabaseProperties,
        sky_cells_per_axis: u32,
    ) -> Result<Self> {
        let mut by_id: Vec<(u64, u32)> = stars
            .iter()
            .enumerate()
            .map(|(slot, s)| (s.id, slot as u32))
            .collect();
        by_id.sort_unstable();
        if let Some(w) = by_id.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(Error::InvalidConfiguration(format!(
                "star id {} appears more than once",
                w[0].0
            )));
        }
        let (sorted_ids, id_slots) = by_id.into_iter().unzip();

        let sky_index = SkyIndex::build(&stars, sky_cells_per_axis);
        let patterns = PatternIndex::from_hashed(patterns);
        properties.num_stars = stars.len() as u32;
        properties.num_patterns = patterns.len() as u32;

        Ok(Self {
            stars,
            sorted_ids,
            id_slots,
            sky_index,
            patterns,
            properties,
        })
    }

    // ── Queries ──

    /// All stars, brightest first. The position of a star is its slot.
    pub fn stars(&self) -> &[StarRecord] {
        &self.stars
    }

    pub fn properties(&self) -> &DatabaseProperties {
        &self.properties
    }

    pub fn num_patterns(&self) -> usize {
        self.patterns.len()
    }

    /// Patterns stored under exactly `hash`. Empty if the bucket does not exist.
    pub fn lookup(&self, hash: PatternHash) -> &[PatternEntry] {
        self.patterns.bucket(hash)
    }

    /// Patterns in every bucket whose ratio box intersects `ratios ± max_error`,
    /// nearest buckets first. Callers still compare exact ratios.
    ///
    /// `max_error` is capped at [`MAX_LOOKUP_ERROR_FACTOR`] times the database's
    /// `pattern_max_error`.
    pub fn lookup_near(
        &self,
        ratios: &[f32; NUM_EDGE_RATIOS],
        max_error: f32,
    ) -> Vec<&PatternEntry> {
        let bins = self.properties.pattern_bins;
        let max_error = max_error.min(MAX_LOOKUP_ERROR_FACTOR * self.properties.pattern_max_error);
        neighbor_keys(ratios, max_error, bins)
            .iter()
            .flat_map(|key| self.patterns.bucket(PatternHash::from_key(key, bins)))
            .collect()
    }

    /// Slot of the star with catalog id `star_id`.
    pub fn slot_of(&self, star_id: u64) -> Option<usize> {
        self.sorted_ids
            .binary_search(&star_id)
            .ok()
            .map(|i| self.id_slots[i] as usize)
    }

    pub fn star(&self, star_id: u64) -> Result<&StarRecord> {
        self.slot_of(star_id)
            .map(|slot| &self.stars[slot])
            .ok_or(Error::UnknownStarId(star_id))
    }

    /// Unit direction of a star in the catalog frame.
    pub fn direction_of(&self, star_id: u64) -> Result<Vector3> {
        Ok(self.star(star_id)?.direction())
    }

    pub fn magnitude_of(&self, star_id: u64) -> Result<f32> {
        Ok(self.star(star_id)?.magnitude)
    }

    /// Slots of the stars within `radius_rad` of `direction`, brightest first.
    pub fn query_cone(&self, direction: &Vector3, radius_rad: f32) -> Vec<usize> {
        self.sky_index.query(&self.stars, direction, radius_rad)
    }

    pub(crate) fn pattern_vectors(&self, entry: &PatternEntry) -> [Vector3; PATTERN_SIZE] {
        std::array::from_fn(|i| self.stars[entry.stars[i] as usize].direction())
    }

    // ── Serialization ──

    /// Serialize to the versioned asset format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| Error::DatabaseFormat(format!("serialization failed: {e}")))?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&DATABASE_MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&PATTERN_SCHEME_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), &bytes)?;
        info!("Saved database to {} ({} bytes)", path.as_ref().display(), bytes.len());
        Ok(())
    }

    /// Parse and validate an asset produced by [`to_bytes`](Self::to_bytes).
    pub fn load(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::DatabaseFormat(format!(
                "asset is {} bytes, shorter than the {HEADER_LEN}-byte header",
                bytes.len()
            )));
        }
        if bytes[..8] != DATABASE_MAGIC {
            return Err(Error::DatabaseFormat("not a starfix database (bad magic)".into()));
        }
        let word = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let format_version = word(8);
        if format_version != FORMAT_VERSION {
            return Err(Error::DatabaseFormat(format!(
                "unsupported format version {format_version} (expected {FORMAT_VERSION})"
            )));
        }
        let scheme_version = word(12);
        if scheme_version != PATTERN_SCHEME_VERSION {
            return Err(Error::DatabaseFormat(format!(
                "unsupported pattern scheme version {scheme_version} \
                 (expected {PATTERN_SCHEME_VERSION})"
            )));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[16..24]);
        let declared = u64::from_le_bytes(len_bytes);
        let actual = (bytes.len() - HEADER_LEN) as u64;
        if actual < declared {
            return Err(Error::DatabaseFormat(format!(
                "payload truncated: {actual} of {declared} bytes"
            )));
        }
        if actual > declared {
            return Err(Error::DatabaseFormat(format!(
                "{} unexpected bytes after the payload",
                actual - declared
            )));
        }

        // rkyv needs an aligned buffer
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(declared as usize);
        aligned.extend_from_slice(&bytes[HEADER_LEN..]);
        let db = rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::DatabaseFormat(format!("payload validation failed: {e}")))?;
        db.check().map_err(Error::DatabaseFormat)?;

        info!(
            "Loaded database: {} stars, {} patterns, FOV {:.1}°–{:.1}°",
            db.stars.len(),
            db.patterns.len(),
            db.properties.min_fov_deg(),
            db.properties.max_fov_deg()
        );
        Ok(db)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::load(&bytes)
    }

    /// Structural consistency of a decoded database.
    fn check(&self) -> std::result::Result<(), String> {
        let props = &self.properties;
        let n = self.stars.len();
        if props.pattern_scheme_version != PATTERN_SCHEME_VERSION {
            return Err(format!(
                "payload pattern scheme version {} does not match the header",
                props.pattern_scheme_version
            ));
        }
        if props.num_stars as usize != n || props.num_patterns as usize != self.patterns.len() {
            return Err("star or pattern count disagrees with the properties".into());
        }
        if !(MIN_PATTERN_MAX_ERROR..0.25).contains(&props.pattern_max_error) {
            return Err(format!(
                "pattern max error {} outside [{MIN_PATTERN_MAX_ERROR}, 0.25)",
                props.pattern_max_error
            ));
        }
        if props.pattern_bins != bins_for_max_error(props.pattern_max_error) {
            return Err(format!(
                "{} pattern bins do not match pattern max error {}",
                props.pattern_bins, props.pattern_max_error
            ));
        }
        let fov_range = 0.0..std::f32::consts::PI;
        if !(fov_range.contains(&props.min_fov_rad)
            && fov_range.contains(&props.max_fov_rad)
            && props.min_fov_rad > 0.0
            && props.min_fov_rad <= props.max_fov_rad)
        {
            return Err("field of view range is invalid".into());
        }
        if props.verification_stars_per_fov < PATTERN_SIZE as u32 {
            return Err(format!(
                "verification stars per FOV ({}) below the pattern size",
                props.verification_stars_per_fov
            ));
        }
        let bad_star = self.stars.iter().find(|s| {
            !s.magnitude.is_finite()
                || s.uvec.iter().any(|c| !c.is_finite())
                || (s.direction().norm() - 1.0).abs() > 1e-3
        });
        if let Some(star) = bad_star {
            return Err(format!("star {} has a non-finite magnitude or direction", star.id));
        }
        if self.stars.windows(2).any(|w| w[0].magnitude > w[1].magnitude) {
            return Err("star table is not sorted by brightness".into());
        }
        if self.sorted_ids.len() != n || self.id_slots.len() != n {
            return Err("id table size disagrees with the star table".into());
        }
        if self.sorted_ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err("id table is not strictly ascending".into());
        }
        let ids_consistent = self
            .sorted_ids
            .iter()
            .zip(&self.id_slots)
            .all(|(&id, &slot)| (slot as usize) < n && self.stars[slot as usize].id == id);
        if !ids_consistent {
            return Err("id table does not point at the matching stars".into());
        }
        self.sky_index.check(n)?;
        self.patterns.check(n)
    }
}
