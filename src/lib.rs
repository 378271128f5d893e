//! # starfix
//!
//! A **lost-in-space star plate solver**: given an image of the night sky (or star
//! centroids already extracted from one), identify the stars against a catalog and
//! return the camera's pointing direction, with no prior attitude estimate.
//!
//! ## Example
//!
//! ```no_run
//! use starfix::{CatalogDatabase, Centroid, SolveConfig, SolveStatus};
//!
//! # fn main() -> starfix::Result<()> {
//! let db = CatalogDatabase::load_from_file("data/catalog.starfix")?;
//!
//! // (row, col) from the top-left corner; weight = brightness
//! let centroids = vec![
//!     Centroid::with_weight(512.3, 301.8, 950.0),
//!     Centroid::with_weight(120.0, 870.4, 720.0),
//!     // ... more centroids ...
//! ];
//!
//! let config = SolveConfig::with_fov(15.0, 1.0);
//! let result = db.solve_from_centroids(&centroids, (1024, 1024), &config)?;
//! if result.status == SolveStatus::MatchFound {
//!     println!(
//!         "RA {:.3}°, Dec {:.3}°, roll {:.2}° with {} matches",
//!         result.ra_deg.unwrap_or_default(),
//!         result.dec_deg.unwrap_or_default(),
//!         result.roll_deg.unwrap_or_default(),
//!         result.num_matches
//!     );
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Centroid extraction**: background subtraction, noise-scaled threshold and
//!    connected-component moments ([`centroid_extraction`])
//! 2. **Pattern generation**: combinations of 4 bright centroids, described by 5
//!    ratios of their 6 pairwise angular separations
//! 3. **Hash lookup**: quantized ratios index a precomputed catalog pattern table
//! 4. **Attitude estimation**: Wahba's problem solved by SVD
//! 5. **Verification**: catalog stars projected into the image are matched to
//!    centroids and the binomial false-positive probability must fall below a
//!    threshold
//! 6. **Refinement**: rotation and FOV refit on every matched star

mod centroid;
pub mod centroid_extraction;
pub mod distortion;
pub mod error;
pub mod sky_index;
pub mod solver;
pub mod star;

pub use centroid::{focal_length_px, fov_from_focal_length, Centroid};
pub use centroid_extraction::{CentroidExtractionConfig, ExtractionResult, GrayImage};
pub use distortion::RadialDistortion;
pub use error::{Error, Result};
pub use solver::{
    CancelToken, CatalogDatabase, DatabaseProperties, DistortionSearch, FailureReason,
    GenerateDatabaseConfig, SolveConfig, SolveResult, SolveStatus, StarMatch,
};
pub use star::StarRecord;

// 32-bit floats are sufficient for most of the math; the SVD in the rotation
// fit runs in 64-bit.
pub type Quaternion = nalgebra::UnitQuaternion<f32>;
pub type Vector3 = nalgebra::Vector3<f32>;
pub type Matrix3 = nalgebra::Matrix3<f32>;
