//! The conversion pipeline: one pass over the entity stream, then one
//! encoding pass over the accumulated tag buckets.
//!
//! The stream is consumed in canonical order with groupings last (see
//! [`crate::stream::GroupingsLast`]). Points are held in memory as an
//! `source ID -> packed coordinate` map; polylines and groupings are
//! renumbered into dense 1-based IDs and written to their data files as
//! they arrive. After the stream ends, every observed tag key is
//! partitioned into buckets and each bucket is encoded as a quadtree.

pub mod buckets;
pub mod registry;

use crate::error::{QuadmapError, Result};
use crate::format::{self, FileKind};
use crate::quadtree::{QuadtreeParams, build_quadtree};
use crate::stream::{
    Entity, EntityKind, EntitySource, RawGrouping, RawPoint, RawPolyline, write_string,
};
use crate::strings::StringTableWriter;
use crate::varint::{write_svarint, write_uvarint};
use buckets::TagIndex;
use bytes::BufMut;
use quadmap_types::{LatLon, LatLonRect};
use registry::{FileId, FileRegistry};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Tuning knobs of a conversion run.
///
/// The defaults match the shipped format: readers opened with
/// [`MapReader::open`](crate::db::MapReader::open) assume the default
/// depth limits, so a database written with different ones must be read
/// with the same config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    /// Tree shape for point tag buckets. The split threshold must stay
    /// zero: point leaf items store only the low 16 coordinate bits, so
    /// the tree has to reach the depth limit wherever items remain.
    #[serde(default = "ConvertConfig::default_point_tree")]
    pub point_tree: QuadtreeParams,

    /// Tree shape for polyline tag buckets.
    #[serde(default = "ConvertConfig::default_polyline_tree")]
    pub polyline_tree: QuadtreeParams,

    /// Tree shape for grouping tag buckets.
    #[serde(default = "ConvertConfig::default_grouping_tree")]
    pub grouping_tree: QuadtreeParams,

    /// A `(key, value)` pair with more members than this gets its own
    /// quadtree file; the rest of the key merges into a remainder bucket.
    #[serde(default = "ConvertConfig::default_dedicated_value_threshold")]
    pub dedicated_value_threshold: usize,

    /// Remainder buckets at least this large intern their values through
    /// a string table instead of inlining them per item.
    #[serde(default = "ConvertConfig::default_interned_remainder_threshold")]
    pub interned_remainder_threshold: usize,

    /// Log ingestion progress every this many entities.
    #[serde(default = "ConvertConfig::default_progress_interval")]
    pub progress_interval: u64,
}

impl ConvertConfig {
    const fn default_point_tree() -> QuadtreeParams {
        QuadtreeParams {
            depth_limit: 16,
            split_threshold: 0,
        }
    }

    const fn default_polyline_tree() -> QuadtreeParams {
        QuadtreeParams {
            depth_limit: 16,
            split_threshold: 300,
        }
    }

    const fn default_grouping_tree() -> QuadtreeParams {
        QuadtreeParams {
            depth_limit: 14,
            split_threshold: 500,
        }
    }

    const fn default_dedicated_value_threshold() -> usize {
        500
    }

    const fn default_interned_remainder_threshold() -> usize {
        500
    }

    const fn default_progress_interval() -> u64 {
        1_000_000
    }

    /// Tree shape used for `kind`'s tag buckets.
    pub fn tree_params(&self, kind: EntityKind) -> QuadtreeParams {
        match kind {
            EntityKind::Point => self.point_tree,
            EntityKind::Polyline => self.polyline_tree,
            EntityKind::Grouping => self.grouping_tree,
        }
    }
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            point_tree: Self::default_point_tree(),
            polyline_tree: Self::default_polyline_tree(),
            grouping_tree: Self::default_grouping_tree(),
            dedicated_value_threshold: Self::default_dedicated_value_threshold(),
            interned_remainder_threshold: Self::default_interned_remainder_threshold(),
            progress_interval: Self::default_progress_interval(),
        }
    }
}

/// What one conversion run produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvertStats {
    pub points: u64,
    pub polylines: u64,
    pub groupings: u64,
    /// Grouping members referencing entities outside the dataset.
    pub dropped_members: u64,
    pub point_tag_keys: usize,
    pub polyline_tag_keys: usize,
    pub grouping_tag_keys: usize,
}

/// Converts an entity stream into an on-disk quadtree database.
///
/// A converter is stateless between runs; all per-run state lives on the
/// stack of [`convert`](Converter::convert). Construction is strictly
/// sequential and single-threaded, and a fatal error leaves the output
/// directory in an undefined state that must be discarded.
#[derive(Debug, Clone, Default)]
pub struct Converter {
    config: ConvertConfig,
}

impl Converter {
    pub fn new(config: ConvertConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    /// Run the conversion, writing the database under `db_root`.
    ///
    /// The source must deliver every point and polyline before any
    /// grouping that references it; wrap arbitrary sources in
    /// [`GroupingsLast`](crate::stream::GroupingsLast) to guarantee that.
    pub fn convert<S: EntitySource>(&self, source: &mut S, db_root: &Path) -> Result<ConvertStats> {
        let mut registry = FileRegistry::new(db_root)?;
        let files = RootFiles::create(&mut registry)?;
        let mut labels = StringTableWriter::new(PathBuf::from(format::GROUPINGS_STRINGS));
        let mut state = IngestState::default();

        log::info!("converting extract into {}", db_root.display());
        source.for_each_entity(&mut |entity| {
            state.entities_seen += 1;
            if state.entities_seen % self.config.progress_interval == 0 {
                log::info!("processed {} entities", state.entities_seen);
            }
            match entity {
                Entity::Point(point) => ingest_point(&mut state, point),
                Entity::Polyline(polyline) => {
                    ingest_polyline(&mut state, &mut registry, &files, polyline)
                }
                Entity::Grouping(grouping) => {
                    ingest_grouping(&mut state, &mut registry, &files, &mut labels, grouping)
                }
            }
        })?;

        let stats = ConvertStats {
            points: state.points.len() as u64,
            polylines: state.polyline_ids.len() as u64,
            groupings: state.grouping_ids.len() as u64,
            dropped_members: state.dropped_members,
            point_tag_keys: state.point_tags.key_count(),
            polyline_tag_keys: state.polyline_tags.key_count(),
            grouping_tag_keys: state.grouping_tags.key_count(),
        };
        log::info!(
            "ingested {} points, {} polylines, {} groupings ({} grouping members dropped)",
            stats.points,
            stats.polylines,
            stats.groupings,
            stats.dropped_members
        );

        registry.set_count(files.polylines, stats.polylines);
        registry.set_count(files.polyline_offsets, stats.polylines);
        registry.set_count(files.polyline_source_ids, stats.polylines);
        registry.set_count(files.groupings, stats.groupings);
        registry.set_count(files.grouping_offsets, stats.groupings);
        registry.set_count(files.grouping_source_ids, stats.groupings);
        labels.finish(&mut registry);

        let IngestState {
            points: _,
            polyline_ids: _,
            grouping_ids: _,
            point_tags,
            polyline_tags,
            grouping_tags,
            polyline_rects,
            grouping_rects,
            ..
        } = state;

        write_tag_buckets(
            &mut registry,
            &self.config,
            EntityKind::Point,
            point_tags,
            |&packed, lat, lon, mask| {
                // Points have no rectangle; membership is exact bit
                // equality against the cell address.
                let c = LatLon::from_packed(packed);
                (c.lat & mask) == lat && (c.lon & mask) == lon
            },
            |&packed, buf| {
                let c = LatLon::from_packed(packed);
                buf.put_u16_le(c.lat as u16);
                buf.put_u16_le(c.lon as u16);
            },
        )?;
        write_tag_buckets(
            &mut registry,
            &self.config,
            EntityKind::Polyline,
            polyline_tags,
            |&dense, lat, lon, mask| polyline_rects[(dense - 1) as usize].overlaps(lat, lon, mask),
            |&dense, buf| buf.put_u32_le(dense),
        )?;
        write_tag_buckets(
            &mut registry,
            &self.config,
            EntityKind::Grouping,
            grouping_tags,
            |&dense, lat, lon, mask| grouping_rects[(dense - 1) as usize].overlaps(lat, lon, mask),
            |&dense, buf| buf.put_u32_le(dense),
        )?;

        registry.finish()?;
        log::info!("conversion finished");
        Ok(stats)
    }
}

struct RootFiles {
    polylines: FileId,
    polyline_offsets: FileId,
    polyline_source_ids: FileId,
    groupings: FileId,
    grouping_offsets: FileId,
    grouping_source_ids: FileId,
}

impl RootFiles {
    fn create(registry: &mut FileRegistry) -> Result<Self> {
        Ok(Self {
            polylines: registry
                .create_deferred(Path::new(format::POLYLINES_DATA), FileKind::PolylineData)?,
            polyline_offsets: registry
                .create_deferred(Path::new(format::POLYLINES_OFFSETS), FileKind::Offsets)?,
            polyline_source_ids: registry
                .create_deferred(Path::new(format::POLYLINE_SOURCE_IDS), FileKind::SourceIds)?,
            groupings: registry
                .create_deferred(Path::new(format::GROUPINGS_DATA), FileKind::GroupingData)?,
            grouping_offsets: registry
                .create_deferred(Path::new(format::GROUPINGS_OFFSETS), FileKind::Offsets)?,
            grouping_source_ids: registry
                .create_deferred(Path::new(format::GROUPING_SOURCE_IDS), FileKind::SourceIds)?,
        })
    }
}

#[derive(Default)]
struct IngestState {
    /// Source point ID to packed coordinate, for the whole run.
    points: FxHashMap<i64, u64>,
    polyline_ids: FxHashMap<i64, u32>,
    grouping_ids: FxHashMap<i64, u32>,
    point_tags: TagIndex<u64>,
    polyline_tags: TagIndex<u32>,
    grouping_tags: TagIndex<u32>,
    /// Bounding rectangles indexed by dense ID minus one.
    polyline_rects: Vec<LatLonRect>,
    grouping_rects: Vec<LatLonRect>,
    prev_polyline_pos: u64,
    prev_polyline_sid: i64,
    prev_grouping_pos: u64,
    prev_grouping_sid: i64,
    entities_seen: u64,
    dropped_members: u64,
}

fn ingest_point(state: &mut IngestState, point: RawPoint) -> Result<()> {
    let coord =
        LatLon::from_degrees(point.lat, point.lon).ok_or(QuadmapError::CoordinateRange {
            lat: point.lat,
            lon: point.lon,
        })?;
    let packed = coord.packed();
    state.points.insert(point.id, packed);
    for (key, value) in &point.tags {
        state.point_tags.insert(key, value, packed);
    }
    Ok(())
}

fn ingest_polyline(
    state: &mut IngestState,
    registry: &mut FileRegistry,
    files: &RootFiles,
    polyline: RawPolyline,
) -> Result<()> {
    let dense = (state.polyline_ids.len() + 1) as u32;
    state.polyline_ids.insert(polyline.id, dense);

    let position = registry.writer(files.polylines).position();
    write_uvarint(
        registry.writer(files.polyline_offsets),
        position - state.prev_polyline_pos,
    )?;
    state.prev_polyline_pos = position;

    let mut rect = LatLonRect::new();
    let data = registry.writer(files.polylines);
    write_uvarint(data, polyline.point_refs.len() as u64)?;
    let mut prev: Option<LatLon> = None;
    for &point_id in &polyline.point_refs {
        let packed =
            *state
                .points
                .get(&point_id)
                .ok_or(QuadmapError::UnresolvedPointRef {
                    polyline: polyline.id,
                    point: point_id,
                })?;
        let coord = LatLon::from_packed(packed);
        match prev {
            // First point in full; the rest as deltas, which stay short
            // thanks to spatial locality along the path.
            None => data.write_all(&packed.to_le_bytes())?,
            Some(prev) => {
                write_svarint(data, coord.lat as i64 - prev.lat as i64)?;
                write_svarint(data, coord.lon as i64 - prev.lon as i64)?;
            }
        }
        rect.add_point(coord);
        prev = Some(coord);
    }
    state.polyline_rects.push(rect);

    for (key, value) in &polyline.tags {
        state.polyline_tags.insert(key, value, dense);
    }

    write_uvarint(
        registry.writer(files.polyline_source_ids),
        polyline.id.wrapping_sub(state.prev_polyline_sid) as u64,
    )?;
    state.prev_polyline_sid = polyline.id;
    Ok(())
}

enum ResolvedTarget {
    Packed(u64),
    Dense(u32),
}

fn ingest_grouping(
    state: &mut IngestState,
    registry: &mut FileRegistry,
    files: &RootFiles,
    labels: &mut StringTableWriter,
    grouping: RawGrouping,
) -> Result<()> {
    let dense = (state.grouping_ids.len() + 1) as u32;
    state.grouping_ids.insert(grouping.id, dense);

    // Resolve members before writing anything: the on-disk member count
    // field records the serialized members only, and region-clipped
    // extracts routinely reference entities that are not in the dataset.
    let mut rect = LatLonRect::new();
    let mut resolved = Vec::with_capacity(grouping.members.len());
    for member in &grouping.members {
        let target = match member.kind {
            EntityKind::Point => state.points.get(&member.id).map(|&packed| {
                rect.add_point(LatLon::from_packed(packed));
                ResolvedTarget::Packed(packed)
            }),
            EntityKind::Polyline => state.polyline_ids.get(&member.id).map(|&id| {
                if let Some(r) = state.polyline_rects.get((id - 1) as usize) {
                    rect.add_rect(r);
                }
                ResolvedTarget::Dense(id)
            }),
            EntityKind::Grouping => state.grouping_ids.get(&member.id).map(|&id| {
                // A self or forward reference has no rectangle yet; its
                // dense ID is still recorded.
                if let Some(r) = state.grouping_rects.get((id - 1) as usize) {
                    rect.add_rect(r);
                }
                ResolvedTarget::Dense(id)
            }),
        };
        match target {
            Some(target) => {
                let label = labels.intern(registry, &member.label)?;
                resolved.push((member.kind, label, target));
            }
            None => {
                state.dropped_members += 1;
                log::debug!(
                    "dropping {:?} member {} of grouping {}: not in dataset",
                    member.kind,
                    member.id,
                    grouping.id
                );
            }
        }
    }

    let position = registry.writer(files.groupings).position();
    write_uvarint(
        registry.writer(files.grouping_offsets),
        position - state.prev_grouping_pos,
    )?;
    state.prev_grouping_pos = position;

    let data = registry.writer(files.groupings);
    write_uvarint(data, resolved.len() as u64)?;
    for (kind, label, target) in resolved {
        data.write_all(&[kind.member_tag()])?;
        write_uvarint(data, label)?;
        match target {
            ResolvedTarget::Packed(packed) => data.write_all(&packed.to_le_bytes())?,
            ResolvedTarget::Dense(id) => write_uvarint(data, id as u64)?,
        }
    }
    state.grouping_rects.push(rect);

    for (key, value) in &grouping.tags {
        state.grouping_tags.insert(key, value, dense);
    }

    write_uvarint(
        registry.writer(files.grouping_source_ids),
        grouping.id.wrapping_sub(state.prev_grouping_sid) as u64,
    )?;
    state.prev_grouping_sid = grouping.id;
    Ok(())
}

fn write_tag_buckets<T: Copy>(
    registry: &mut FileRegistry,
    config: &ConvertConfig,
    kind: EntityKind,
    index: TagIndex<T>,
    filter: impl Fn(&T, i32, i32, i32) -> bool + Copy,
    encode: impl Fn(&T, &mut Vec<u8>) + Copy,
) -> Result<()> {
    let params = config.tree_params(kind);
    let partitions = index.into_partitions(config.dedicated_value_threshold);
    if partitions.is_empty() {
        return Ok(());
    }
    log::info!(
        "writing {} tag keys for {} entities",
        partitions.len(),
        kind.file_prefix()
    );
    for partition in partitions {
        for (value, members) in &partition.dedicated {
            let rel = format::tag_file_path(kind, &partition.key, Some(value), "qtr");
            let file = registry.create(&rel, kind.tag_file_kind(), members.len() as u64)?;
            let tree = build_quadtree(members, params, filter, |member, buf| {
                encode(member, buf);
                Ok(())
            })?;
            let start = registry.writer(file).position();
            tree.write_to(registry.writer(file), start)?;
        }

        let remainder = partition.remainder;
        let rel = format::tag_file_path(kind, &partition.key, None, "qtr");
        let file = registry.create(&rel, kind.tag_file_kind(), remainder.len() as u64)?;
        let mut table = if remainder.len() < config.interned_remainder_threshold {
            None
        } else {
            Some(StringTableWriter::new(format::tag_file_path(
                kind,
                &partition.key,
                None,
                "strings",
            )))
        };
        let tree = build_quadtree(
            &remainder,
            params,
            |(_, member), lat, lon, mask| filter(member, lat, lon, mask),
            |(value, member), buf| {
                encode(member, buf);
                match &mut table {
                    // Small remainders carry the value inline per item;
                    // large ones intern it once and store the offset.
                    None => write_string(buf, value)?,
                    Some(table) => {
                        let offset = table.intern(registry, value)?;
                        write_uvarint(buf, offset)?;
                    }
                }
                Ok(())
            },
        )?;
        let start = registry.writer(file).position();
        tree.write_to(registry.writer(file), start)?;
        if let Some(table) = table {
            table.finish(registry);
        }
    }
    Ok(())
}
