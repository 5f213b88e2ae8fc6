//! Error types for quadmap.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QuadmapError>;

/// All the ways a conversion run or a query can fail.
///
/// Conversion errors are fatal: the run aborts and the partially written
/// output directory must be discarded. Read-side errors are returned per
/// query; [`Corrupt`](QuadmapError::Corrupt) means the on-disk data is
/// damaged, while [`NotFound`](QuadmapError::NotFound) is the normal
/// answer for an identifier that does not exist.
#[derive(Debug, Error)]
pub enum QuadmapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Degrees that do not fit the 32-bit fixed-point range.
    #[error("coordinate ({lat}, {lon}) outside the fixed-point range")]
    CoordinateRange { lat: f64, lon: f64 },

    /// A polyline must never reference a point outside the dataset.
    #[error("polyline {polyline} references point {point} absent from the dataset")]
    UnresolvedPointRef { polyline: i64, point: i64 },

    /// A member kind byte read from disk that no known kind matches.
    #[error("unrecognized member kind tag 0x{0:02x}")]
    UnknownMemberKind(u8),

    /// Two logical files escaped to the same on-disk path.
    #[error("file name conflict at {}", .0.display())]
    NameConflict(PathBuf),

    /// A quadtree child offset did not fit its 32-bit slot.
    #[error("quadtree offset exceeds 32 bits")]
    OffsetOverflow,

    /// Damaged or truncated on-disk data.
    #[error("corrupt database: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),
}
