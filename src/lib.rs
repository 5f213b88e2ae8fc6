//! Write-once quadtree spatial database for map extracts.
//!
//! quadmap converts a stream of tagged map entities (points, polylines
//! and groupings) into an immutable directory of seekable quadtree files,
//! then answers bounded-region, tag-filtered queries against it without
//! loading the dataset into memory.
//!
//! ```rust
//! use quadmap::{Converter, Entity, LatLon, LatLonRect, MapReader, MemorySource, RawPoint};
//!
//! let dir = tempfile::tempdir()?;
//! let mut source = MemorySource::new(vec![Entity::Point(RawPoint {
//!     id: 71,
//!     lat: 10.0,
//!     lon: 20.0,
//!     tags: vec![("amenity".to_string(), "cafe".to_string())],
//! })]);
//! Converter::default().convert(&mut source, dir.path())?;
//!
//! let reader = MapReader::open(dir.path())?;
//! let area = LatLonRect::from_points(
//!     LatLon::from_degrees(9.0, 19.0).unwrap(),
//!     LatLon::from_degrees(11.0, 21.0).unwrap(),
//! );
//! let found: Vec<_> = reader
//!     .query_points("amenity", None, &area)?
//!     .collect::<quadmap::Result<_>>()?;
//! assert_eq!(found.len(), 1);
//! assert_eq!(found[0].value, "cafe");
//! # Ok::<(), quadmap::QuadmapError>(())
//! ```

pub mod convert;
pub mod db;
pub mod error;
pub mod format;
pub mod quadtree;
pub mod stream;
pub mod strings;
pub mod varint;

pub use convert::{ConvertConfig, ConvertStats, Converter};
pub use db::{
    Grouping, MapReader, Member, MemberRef, PointQuery, Polyline, PolylineScan, RefQuery,
    TaggedPoint, TaggedRef,
};
pub use error::{QuadmapError, Result};
pub use quadtree::QuadtreeParams;
pub use stream::{
    Entity, EntityKind, EntitySource, GroupingsLast, MemorySource, RawGrouping, RawMember,
    RawPoint, RawPolyline, Tags,
};

pub use quadmap_types::{LatLon, LatLonRect};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{ConvertConfig, Converter, MapReader, QuadmapError, Result};

    pub use crate::{Entity, EntityKind, EntitySource, GroupingsLast, MemorySource};

    pub use crate::{LatLon, LatLonRect};

    pub use crate::{RawGrouping, RawMember, RawPoint, RawPolyline};
}
