//! Lost-in-space plate solver based on 4-star geometric hashing.
//!
//! 1. **Database generation**: precomputes 4-star patterns from a star catalog,
//!    hashing their edge ratios into a lookup table ([`CatalogDatabase::generate`]).
//! 2. **Solving**: for each (FOV, distortion) hypothesis of a [`SweepGrid`], tries
//!    4-centroid combinations brightest first, looks up matching catalog patterns,
//!    estimates the rotation by SVD and verifies it by counting star matches
//!    ([`CatalogDatabase::solve_from_centroids`]).

pub mod attitude;
pub mod combinations;
pub mod config;
pub mod database;
pub mod generate;
mod matcher;
pub mod pattern;
pub mod result;
mod solve;
pub mod sweep;

pub use config::{CancelToken, DistortionSearch, SolveConfig};
pub use database::{CatalogDatabase, DatabaseProperties, PatternEntry};
pub use generate::GenerateDatabaseConfig;
pub use pattern::PatternHash;
pub use result::{
    CandidateSummary, FailureReason, ProjectedStar, SolveResult, SolveStatus, StarMatch,
    SweepStats, VisualDiagnostics,
};
pub use sweep::{SweepGrid, SweepPoint};
