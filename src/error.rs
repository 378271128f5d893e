//! Error type shared by the whole crate.
//!
//! A failed plate solve is *not* an error: "no match" comes back as a
//! [`SolveStatus`](crate::SolveStatus) inside an `Ok(SolveResult)`. The variants
//! here cover broken inputs (assets, configuration, images) and internal
//! inconsistencies.

/// Errors returned by database loading, configuration validation and solving.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The database asset is malformed, truncated, or was written with an
    /// incompatible format / pattern-hash scheme version.
    #[error("database format error: {0}")]
    DatabaseFormat(String),

    /// A star id referenced by a match is absent from the database.
    /// Indicates a corrupt pattern index.
    #[error("unknown star id {0}")]
    UnknownStarId(u64),

    /// Contradictory or out-of-range configuration, detected before any work starts.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The pixel buffer does not describe a valid image.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for returning `Error::InvalidConfiguration` when `cond` is false.
macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Error::InvalidConfiguration(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_config;
