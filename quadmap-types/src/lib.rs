//! # quadmap-types
//!
//! Core coordinate types for the quadmap database.
//!
//! This crate provides the fixed-point geographic primitives the database
//! is built on:
//!
//! - [`LatLon`]: a latitude/longitude pair in signed 32-bit fixed-point
//!   representation (scale 1e7), packable into a single `u64`
//! - [`LatLonRect`]: an incrementally grown bounding rectangle with the
//!   bit-prefix operations used by the quadtree encoder and decoder
//!
//! All types are serializable with Serde.
//!
//! ## Examples
//!
//! ```rust
//! use quadmap_types::{LatLon, LatLonRect};
//!
//! let berlin = LatLon::from_degrees(52.5200, 13.4050).unwrap();
//! let packed = berlin.packed();
//! assert_eq!(LatLon::from_packed(packed), berlin);
//!
//! let mut rect = LatLonRect::new();
//! rect.add_point(berlin);
//! assert!(rect.contains(berlin));
//! ```

pub mod point;
pub mod rect;

pub use point::LatLon;
pub use rect::LatLonRect;
