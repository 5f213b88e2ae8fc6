//! The entity stream consumed by the conversion pipeline.
//!
//! The source-format decoder is an external collaborator: anything that
//! can stream a map extract implements [`EntitySource`]. The pipeline
//! additionally requires that every point and polyline arrives before any
//! grouping that references it; [`GroupingsLast`] wraps an arbitrary
//! source and enforces that order by replaying groupings from a
//! gzip-compressed side cache.

use crate::error::{QuadmapError, Result};
use crate::format::FileKind;
use crate::varint::{read_uvarint, write_uvarint};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

/// Free-form key/value tags, at most one value per key.
pub type Tags = Vec<(String, String)>;

/// The three kinds of entity a map extract contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Point,
    Polyline,
    Grouping,
}

impl EntityKind {
    pub(crate) const ALL: [EntityKind; 3] =
        [EntityKind::Point, EntityKind::Polyline, EntityKind::Grouping];

    /// Prefix used in database file names.
    pub(crate) fn file_prefix(self) -> &'static str {
        match self {
            EntityKind::Point => "point",
            EntityKind::Polyline => "polyline",
            EntityKind::Grouping => "grouping",
        }
    }

    /// Byte tag identifying a grouping member of this kind on disk.
    pub(crate) fn member_tag(self) -> u8 {
        match self {
            EntityKind::Point => b'P',
            EntityKind::Polyline => b'L',
            EntityKind::Grouping => b'G',
        }
    }

    pub(crate) fn from_member_tag(tag: u8) -> Option<Self> {
        match tag {
            b'P' => Some(EntityKind::Point),
            b'L' => Some(EntityKind::Polyline),
            b'G' => Some(EntityKind::Grouping),
            _ => None,
        }
    }

    /// Header kind of this entity's tag-bucket quadtree files.
    pub(crate) fn tag_file_kind(self) -> FileKind {
        match self {
            EntityKind::Point => FileKind::PointTags,
            EntityKind::Polyline => FileKind::PolylineTags,
            EntityKind::Grouping => FileKind::GroupingTags,
        }
    }
}

/// A single tagged location.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPoint {
    /// Sparse identifier assigned by the source dataset.
    pub id: i64,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    pub tags: Tags,
}

/// An ordered sequence of point references.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPolyline {
    pub id: i64,
    /// Source IDs of the points the polyline passes through, in order.
    pub point_refs: Vec<i64>,
    pub tags: Tags,
}

/// One member of a grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMember {
    pub kind: EntityKind,
    /// Free-form label describing the member's role in the grouping.
    pub label: String,
    /// Source ID of the referenced entity.
    pub id: i64,
}

/// An ordered, labeled collection of points, polylines and groupings.
#[derive(Debug, Clone, PartialEq)]
pub struct RawGrouping {
    pub id: i64,
    pub members: Vec<RawMember>,
    pub tags: Tags,
}

/// One entity of the extract.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Point(RawPoint),
    Polyline(RawPolyline),
    Grouping(RawGrouping),
}

/// A sequential reader of a map extract.
///
/// Each call to [`for_each_entity`](EntitySource::for_each_entity) is an
/// independent full scan in the extract's canonical order; the pipeline
/// scans twice, so sources must be re-runnable.
pub trait EntitySource {
    fn for_each_entity(&mut self, f: &mut dyn FnMut(Entity) -> Result<()>) -> Result<()>;
}

/// An in-memory source, for tests and small synthetic extracts.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    entities: Vec<Entity>,
}

impl MemorySource {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }
}

impl EntitySource for MemorySource {
    fn for_each_entity(&mut self, f: &mut dyn FnMut(Entity) -> Result<()>) -> Result<()> {
        for entity in &self.entities {
            f(entity.clone())?;
        }
        Ok(())
    }
}

/// Delivers groupings strictly after all points and polylines.
///
/// On first use the inner source is scanned once and every grouping is
/// written to a gzip side cache next to the input (unless the cache
/// already exists from an earlier run). Subsequent scans replay the inner
/// source with groupings filtered out, then replay the cache.
pub struct GroupingsLast<S> {
    inner: S,
    cache_path: PathBuf,
}

impl<S: EntitySource> GroupingsLast<S> {
    pub fn new(inner: S, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            cache_path: cache_path.into(),
        }
    }

    fn ensure_cache(&mut self) -> Result<()> {
        if self.cache_path.exists() {
            log::debug!("reusing grouping cache {}", self.cache_path.display());
            return Ok(());
        }
        log::info!("caching groupings to {}", self.cache_path.display());
        let file = File::create(&self.cache_path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        self.inner.for_each_entity(&mut |entity| {
            if let Entity::Grouping(grouping) = entity {
                write_grouping_record(&mut encoder, &grouping)?;
            }
            Ok(())
        })?;
        encoder.finish()?.flush()?;
        Ok(())
    }
}

impl<S: EntitySource> EntitySource for GroupingsLast<S> {
    fn for_each_entity(&mut self, f: &mut dyn FnMut(Entity) -> Result<()>) -> Result<()> {
        self.ensure_cache()?;
        self.inner.for_each_entity(&mut |entity| match entity {
            Entity::Grouping(_) => Ok(()),
            other => f(other),
        })?;
        let file = File::open(&self.cache_path)?;
        let mut decoder = BufReader::new(GzDecoder::new(BufReader::new(file)));
        while let Some(grouping) = read_grouping_record(&mut decoder)? {
            f(Entity::Grouping(grouping))?;
        }
        Ok(())
    }
}

const RECORD_MARKER: u8 = 1;

fn write_grouping_record<W: Write>(w: &mut W, grouping: &RawGrouping) -> Result<()> {
    w.write_all(&[RECORD_MARKER])?;
    write_uvarint(w, grouping.id as u64)?;
    write_uvarint(w, grouping.members.len() as u64)?;
    for member in &grouping.members {
        w.write_all(&[member.kind.member_tag()])?;
        write_uvarint(w, member.id as u64)?;
        write_string(w, &member.label)?;
    }
    write_uvarint(w, grouping.tags.len() as u64)?;
    for (key, value) in &grouping.tags {
        write_string(w, key)?;
        write_string(w, value)?;
    }
    Ok(())
}

fn read_grouping_record<R: Read>(r: &mut R) -> Result<Option<RawGrouping>> {
    let mut marker = [0u8; 1];
    loop {
        match r.read(&mut marker) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if marker[0] != RECORD_MARKER {
        return Err(QuadmapError::Corrupt(
            "malformed grouping cache record".to_string(),
        ));
    }
    let id = read_uvarint(r)? as i64;
    let member_count = read_uvarint(r)? as usize;
    let mut members = Vec::with_capacity(member_count);
    for _ in 0..member_count {
        let mut tag = [0u8; 1];
        crate::format::read_exact_or_corrupt(r, &mut tag, "grouping cache")?;
        let kind =
            EntityKind::from_member_tag(tag[0]).ok_or(QuadmapError::UnknownMemberKind(tag[0]))?;
        let member_id = read_uvarint(r)? as i64;
        let label = read_string(r)?;
        members.push(RawMember {
            kind,
            label,
            id: member_id,
        });
    }
    let tag_count = read_uvarint(r)? as usize;
    let mut tags = Vec::with_capacity(tag_count);
    for _ in 0..tag_count {
        let key = read_string(r)?;
        let value = read_string(r)?;
        tags.push((key, value));
    }
    Ok(Some(RawGrouping { id, members, tags }))
}

pub(crate) fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    write_uvarint(w, s.len() as u64)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

pub(crate) fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_uvarint(r)? as usize;
    let mut buf = vec![0u8; len];
    crate::format::read_exact_or_corrupt(r, &mut buf, "string")?;
    String::from_utf8(buf).map_err(|_| QuadmapError::Corrupt("invalid UTF-8 string".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_entities() -> Vec<Entity> {
        vec![
            Entity::Grouping(RawGrouping {
                id: 900,
                members: vec![RawMember {
                    kind: EntityKind::Point,
                    label: "stop".to_string(),
                    id: 1,
                }],
                tags: vec![("route".to_string(), "bus".to_string())],
            }),
            Entity::Point(RawPoint {
                id: 1,
                lat: 1.0,
                lon: 2.0,
                tags: Vec::new(),
            }),
            Entity::Polyline(RawPolyline {
                id: 10,
                point_refs: vec![1],
                tags: Vec::new(),
            }),
        ]
    }

    #[test]
    fn test_groupings_delivered_last() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new(sample_entities());
        let mut wrapped = GroupingsLast::new(source, dir.path().join("extract.groupings"));

        let mut order = Vec::new();
        wrapped
            .for_each_entity(&mut |entity| {
                order.push(match entity {
                    Entity::Point(_) => "point",
                    Entity::Polyline(_) => "polyline",
                    Entity::Grouping(_) => "grouping",
                });
                Ok(())
            })
            .unwrap();
        assert_eq!(order, ["point", "polyline", "grouping"]);
        assert!(dir.path().join("extract.groupings").exists());
    }

    #[test]
    fn test_cache_replay_preserves_grouping() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new(sample_entities());
        let mut wrapped = GroupingsLast::new(source, dir.path().join("extract.groupings"));

        let mut collect = |wrapped: &mut GroupingsLast<MemorySource>| {
            let mut groupings = Vec::new();
            wrapped
                .for_each_entity(&mut |entity| {
                    if let Entity::Grouping(g) = entity {
                        groupings.push(g);
                    }
                    Ok(())
                })
                .unwrap();
            groupings
        };

        let first = collect(&mut wrapped);
        // The second scan replays from the existing cache file.
        let second = collect(&mut wrapped);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        let grouping = &first[0];
        assert_eq!(grouping.id, 900);
        assert_eq!(grouping.members.len(), 1);
        assert_eq!(grouping.members[0].label, "stop");
        assert_eq!(grouping.tags, vec![("route".to_string(), "bus".to_string())]);
    }
}
