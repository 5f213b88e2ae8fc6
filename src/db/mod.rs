//! Read side: open a converted database directory and query it.
//!
//! A [`MapReader`] session owns its file handles and caches and shares
//! nothing; any number of sessions may read the same database
//! concurrently because nothing writes to it after construction.

mod tag_query;

pub use tag_query::{PointQuery, RefQuery, TaggedPoint, TaggedRef};

use crate::convert::ConvertConfig;
use crate::error::{QuadmapError, Result};
use crate::format::{self, FileKind, ParsedTagFile, read_u64_le};
use crate::stream::EntityKind;
use crate::strings::StringTableReader;
use crate::varint::{read_svarint, read_uvarint};
use quadmap_types::{LatLon, LatLonRect};
use rustc_hash::FxHashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tag_query::ValueSource;

/// A polyline's resolved geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Polyline {
    pub points: Vec<LatLon>,
}

/// What a grouping member points at.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberRef {
    Point(LatLon),
    Polyline(u32),
    Grouping(u32),
}

/// One serialized member of a grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub label: String,
    pub target: MemberRef,
}

/// A grouping's resolved member list.
#[derive(Debug, Clone, PartialEq)]
pub struct Grouping {
    pub members: Vec<Member>,
}

/// Catalog entry for one tag key of one entity kind.
#[derive(Debug, Default)]
pub(crate) struct TagCatalog {
    pub(crate) dedicated: FxHashMap<String, PathBuf>,
    pub(crate) remainder: Option<PathBuf>,
    pub(crate) strings: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct DenseFiles {
    data: Option<PathBuf>,
    offsets: Option<PathBuf>,
    source_ids: Option<PathBuf>,
    count: u64,
}

/// A read session over one converted database directory.
pub struct MapReader {
    root: PathBuf,
    config: ConvertConfig,
    point_tags: FxHashMap<String, TagCatalog>,
    polyline_tags: FxHashMap<String, TagCatalog>,
    grouping_tags: FxHashMap<String, TagCatalog>,
    polylines: DenseFiles,
    groupings: DenseFiles,
    labels_path: Option<PathBuf>,
    polyline_offsets: Option<Vec<u64>>,
    grouping_offsets: Option<Vec<u64>>,
    polyline_data: Option<BufReader<File>>,
    grouping_data: Option<BufReader<File>>,
    labels: Option<StringTableReader>,
}

impl MapReader {
    /// Open a database written with the default [`ConvertConfig`].
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(root, ConvertConfig::default())
    }

    /// Open a database written with a non-default configuration.
    ///
    /// The tree depth limits must match the writing run: they decide
    /// where leaves omit the early-exit marker.
    pub fn open_with_config(root: impl AsRef<Path>, config: ConvertConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut reader = Self {
            root: root.clone(),
            config,
            point_tags: FxHashMap::default(),
            polyline_tags: FxHashMap::default(),
            grouping_tags: FxHashMap::default(),
            polylines: DenseFiles::default(),
            groupings: DenseFiles::default(),
            labels_path: None,
            polyline_offsets: None,
            grouping_offsets: None,
            polyline_data: None,
            grouping_data: None,
            labels: None,
        };
        reader.scan_dir(&root)?;
        Ok(reader)
    }

    fn scan_dir(&mut self, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.scan_dir(&path)?;
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            self.catalog_file(name, &path)?;
        }
        Ok(())
    }

    fn catalog_file(&mut self, name: &str, path: &Path) -> Result<()> {
        match name {
            format::POLYLINES_DATA => {
                self.polylines.count = expect_kind(path, FileKind::PolylineData)?;
                self.polylines.data = Some(path.to_path_buf());
            }
            format::POLYLINES_OFFSETS => {
                expect_kind(path, FileKind::Offsets)?;
                self.polylines.offsets = Some(path.to_path_buf());
            }
            format::POLYLINE_SOURCE_IDS => {
                expect_kind(path, FileKind::SourceIds)?;
                self.polylines.source_ids = Some(path.to_path_buf());
            }
            format::GROUPINGS_DATA => {
                self.groupings.count = expect_kind(path, FileKind::GroupingData)?;
                self.groupings.data = Some(path.to_path_buf());
            }
            format::GROUPINGS_OFFSETS => {
                expect_kind(path, FileKind::Offsets)?;
                self.groupings.offsets = Some(path.to_path_buf());
            }
            format::GROUPING_SOURCE_IDS => {
                expect_kind(path, FileKind::SourceIds)?;
                self.groupings.source_ids = Some(path.to_path_buf());
            }
            format::GROUPINGS_STRINGS => {
                expect_kind(path, FileKind::Strings)?;
                self.labels_path = Some(path.to_path_buf());
            }
            _ => match format::parse_tag_file_name(name) {
                Some(ParsedTagFile::Dedicated { kind, key, value }) => {
                    expect_kind(path, kind.tag_file_kind())?;
                    self.catalog_mut(kind)
                        .entry(key)
                        .or_default()
                        .dedicated
                        .insert(value, path.to_path_buf());
                }
                Some(ParsedTagFile::Remainder { kind, key }) => {
                    expect_kind(path, kind.tag_file_kind())?;
                    self.catalog_mut(kind).entry(key).or_default().remainder =
                        Some(path.to_path_buf());
                }
                Some(ParsedTagFile::Strings { kind, key }) => {
                    expect_kind(path, FileKind::Strings)?;
                    self.catalog_mut(kind).entry(key).or_default().strings =
                        Some(path.to_path_buf());
                }
                None => {
                    log::debug!("ignoring unrecognized file {}", path.display());
                }
            },
        }
        Ok(())
    }

    fn catalog_mut(&mut self, kind: EntityKind) -> &mut FxHashMap<String, TagCatalog> {
        match kind {
            EntityKind::Point => &mut self.point_tags,
            EntityKind::Polyline => &mut self.polyline_tags,
            EntityKind::Grouping => &mut self.grouping_tags,
        }
    }

    fn catalog(&self, kind: EntityKind) -> &FxHashMap<String, TagCatalog> {
        match kind {
            EntityKind::Point => &self.point_tags,
            EntityKind::Polyline => &self.polyline_tags,
            EntityKind::Grouping => &self.grouping_tags,
        }
    }

    /// The database directory this session reads.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of polylines in the database.
    pub fn polyline_count(&self) -> u64 {
        self.polylines.count
    }

    /// Number of groupings in the database.
    pub fn grouping_count(&self) -> u64 {
        self.groupings.count
    }

    /// Tag keys indexed for `kind`, sorted.
    pub fn tag_keys(&self, kind: EntityKind) -> Vec<&str> {
        let mut keys: Vec<&str> = self.catalog(kind).keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Values of `key` that earned a dedicated bucket, sorted. The
    /// remainder bucket may hold further values.
    pub fn dedicated_values(&self, kind: EntityKind, key: &str) -> Vec<&str> {
        let mut values: Vec<&str> = self
            .catalog(kind)
            .get(key)
            .map(|catalog| catalog.dedicated.keys().map(String::as_str).collect())
            .unwrap_or_default();
        values.sort_unstable();
        values
    }

    /// Points tagged `key` (optionally `key=value`) inside `area`.
    ///
    /// Unknown keys and values yield an empty iterator; that is a normal
    /// result, not an error.
    pub fn query_points(
        &self,
        key: &str,
        value: Option<&str>,
        area: &LatLonRect,
    ) -> Result<PointQuery> {
        let Some(catalog) = self.catalog(EntityKind::Point).get(key) else {
            return Ok(PointQuery::empty());
        };
        let depth = self.config.point_tree.depth_limit;
        let file_kind = EntityKind::Point.tag_file_kind();
        let mut trees = Vec::new();
        match value {
            Some(value) => {
                if let Some(path) = catalog.dedicated.get(value) {
                    trees.push(tag_query::point_tree(
                        path,
                        file_kind,
                        depth,
                        area,
                        ValueSource::Fixed(value.to_string()),
                    )?);
                } else if let Some(path) = &catalog.remainder {
                    trees.push(tag_query::point_tree(
                        path,
                        file_kind,
                        depth,
                        area,
                        ValueSource::for_remainder(catalog),
                    )?);
                }
            }
            None => {
                for (fixed, path) in &catalog.dedicated {
                    trees.push(tag_query::point_tree(
                        path,
                        file_kind,
                        depth,
                        area,
                        ValueSource::Fixed(fixed.clone()),
                    )?);
                }
                if let Some(path) = &catalog.remainder {
                    trees.push(tag_query::point_tree(
                        path,
                        file_kind,
                        depth,
                        area,
                        ValueSource::for_remainder(catalog),
                    )?);
                }
            }
        }
        Ok(PointQuery {
            trees,
            area: *area,
            want_value: value.map(str::to_string),
            current: 0,
        })
    }

    /// Polylines tagged `key` (optionally `key=value`) whose bounding
    /// rectangle may intersect `area`. See [`RefQuery`] for precision.
    pub fn query_polylines(
        &self,
        key: &str,
        value: Option<&str>,
        area: &LatLonRect,
    ) -> Result<RefQuery> {
        self.query_refs(EntityKind::Polyline, key, value, area)
    }

    /// Groupings tagged `key` (optionally `key=value`) whose bounding
    /// rectangle may intersect `area`.
    pub fn query_groupings(
        &self,
        key: &str,
        value: Option<&str>,
        area: &LatLonRect,
    ) -> Result<RefQuery> {
        self.query_refs(EntityKind::Grouping, key, value, area)
    }

    fn query_refs(
        &self,
        kind: EntityKind,
        key: &str,
        value: Option<&str>,
        area: &LatLonRect,
    ) -> Result<RefQuery> {
        let Some(catalog) = self.catalog(kind).get(key) else {
            return Ok(RefQuery::empty());
        };
        let depth = self.config.tree_params(kind).depth_limit;
        let file_kind = kind.tag_file_kind();
        let mut trees = Vec::new();
        match value {
            Some(value) => {
                if let Some(path) = catalog.dedicated.get(value) {
                    trees.push(tag_query::dense_tree(
                        path,
                        file_kind,
                        depth,
                        area,
                        ValueSource::Fixed(value.to_string()),
                    )?);
                } else if let Some(path) = &catalog.remainder {
                    trees.push(tag_query::dense_tree(
                        path,
                        file_kind,
                        depth,
                        area,
                        ValueSource::for_remainder(catalog),
                    )?);
                }
            }
            None => {
                for (fixed, path) in &catalog.dedicated {
                    trees.push(tag_query::dense_tree(
                        path,
                        file_kind,
                        depth,
                        area,
                        ValueSource::Fixed(fixed.clone()),
                    )?);
                }
                if let Some(path) = &catalog.remainder {
                    trees.push(tag_query::dense_tree(
                        path,
                        file_kind,
                        depth,
                        area,
                        ValueSource::for_remainder(catalog),
                    )?);
                }
            }
        }
        Ok(RefQuery {
            trees,
            want_value: value.map(str::to_string),
            seen: Default::default(),
            current: 0,
        })
    }

    /// Resolve a polyline's geometry by dense ID.
    pub fn polyline(&mut self, id: u32) -> Result<Polyline> {
        let offset = self.record_offset(EntityKind::Polyline, id)?;
        let reader = data_reader(
            &mut self.polyline_data,
            &self.polylines.data,
            FileKind::PolylineData,
        )?;
        reader.seek(SeekFrom::Start(offset))?;
        read_polyline_record(reader)
    }

    /// Resolve a grouping's member list by dense ID.
    pub fn grouping(&mut self, id: u32) -> Result<Grouping> {
        let offset = self.record_offset(EntityKind::Grouping, id)?;
        let raw = {
            let reader = data_reader(
                &mut self.grouping_data,
                &self.groupings.data,
                FileKind::GroupingData,
            )?;
            reader.seek(SeekFrom::Start(offset))?;
            read_grouping_record(reader)?
        };
        let mut members = Vec::with_capacity(raw.len());
        if raw.is_empty() {
            return Ok(Grouping { members });
        }
        let labels = self.labels()?;
        for (label_offset, target) in raw {
            members.push(Member {
                label: labels.get(label_offset)?,
                target,
            });
        }
        Ok(Grouping { members })
    }

    /// Sequentially scan every polyline in dense-ID order.
    pub fn polylines_scan(&self) -> Result<PolylineScan> {
        let Some(path) = &self.polylines.data else {
            return Err(QuadmapError::Corrupt(
                "database has no polyline data file".to_string(),
            ));
        };
        let mut reader = BufReader::new(File::open(path)?);
        let (kind, _, count) = format::read_header(&mut reader)?;
        if kind != FileKind::PolylineData {
            return Err(QuadmapError::Corrupt(
                "unexpected file kind in polyline data".to_string(),
            ));
        }
        Ok(PolylineScan {
            reader,
            remaining: count,
            next_id: 1,
        })
    }

    /// Decode the source-ID delta stream of `kind` back into the source
    /// identifiers, indexed by dense ID minus one.
    pub fn source_ids(&self, kind: EntityKind) -> Result<Vec<i64>> {
        let (path, count) = match kind {
            EntityKind::Point => {
                return Err(QuadmapError::NotFound(
                    "points carry no source-ID stream".to_string(),
                ));
            }
            EntityKind::Polyline => (&self.polylines.source_ids, self.polylines.count),
            EntityKind::Grouping => (&self.groupings.source_ids, self.groupings.count),
        };
        let Some(path) = path else {
            return Err(QuadmapError::Corrupt(format!(
                "database has no source-ID stream for {}s",
                kind.file_prefix()
            )));
        };
        let mut reader = BufReader::new(File::open(path)?);
        let (file_kind, _, _) = format::read_header(&mut reader)?;
        if file_kind != FileKind::SourceIds {
            return Err(QuadmapError::Corrupt(
                "unexpected file kind in source-ID stream".to_string(),
            ));
        }
        let mut ids = Vec::with_capacity(count.min(1 << 20) as usize);
        let mut previous = 0i64;
        for _ in 0..count {
            previous = previous.wrapping_add(read_uvarint(&mut reader)? as i64);
            ids.push(previous);
        }
        Ok(ids)
    }

    fn record_offset(&mut self, kind: EntityKind, id: u32) -> Result<u64> {
        if id == 0 {
            return Err(QuadmapError::NotFound(format!(
                "{} 0 (dense IDs start at 1)",
                kind.file_prefix()
            )));
        }
        let (cache, files) = match kind {
            EntityKind::Polyline => (&mut self.polyline_offsets, &self.polylines),
            EntityKind::Grouping => (&mut self.grouping_offsets, &self.groupings),
            EntityKind::Point => {
                return Err(QuadmapError::NotFound(
                    "points have no record stream".to_string(),
                ));
            }
        };
        if cache.is_none() {
            let Some(path) = &files.offsets else {
                return Err(QuadmapError::Corrupt(format!(
                    "database has no offsets file for {}s",
                    kind.file_prefix()
                )));
            };
            *cache = Some(load_offsets(path, files.count)?);
        }
        let offsets = cache.as_deref().unwrap_or_default();
        match offsets.get((id - 1) as usize) {
            Some(&offset) => Ok(offset),
            None => Err(QuadmapError::NotFound(format!(
                "{} {id}",
                kind.file_prefix()
            ))),
        }
    }

    fn labels(&mut self) -> Result<&mut StringTableReader> {
        if self.labels.is_none() {
            let Some(path) = &self.labels_path else {
                return Err(QuadmapError::Corrupt(
                    "database has no grouping label table".to_string(),
                ));
            };
            self.labels = Some(StringTableReader::new(path.clone()));
        }
        self.labels
            .as_mut()
            .ok_or_else(|| QuadmapError::Corrupt("label table unavailable".to_string()))
    }
}

/// Sequential polyline iterator returned by
/// [`MapReader::polylines_scan`].
pub struct PolylineScan {
    reader: BufReader<File>,
    remaining: u64,
    next_id: u32,
}

impl Iterator for PolylineScan {
    type Item = Result<(u32, Polyline)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let id = self.next_id;
        self.next_id += 1;
        match read_polyline_record(&mut self.reader) {
            Ok(polyline) => Some(Ok((id, polyline))),
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

fn expect_kind(path: &Path, expected: FileKind) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let (kind, _, count) = format::read_header(&mut reader)?;
    if kind != expected {
        return Err(QuadmapError::Corrupt(format!(
            "unexpected file kind in {}",
            path.display()
        )));
    }
    Ok(count)
}

fn data_reader<'a>(
    cache: &'a mut Option<BufReader<File>>,
    path: &Option<PathBuf>,
    expected: FileKind,
) -> Result<&'a mut BufReader<File>> {
    if cache.is_none() {
        let Some(path) = path else {
            return Err(QuadmapError::Corrupt(
                "database is missing a data file".to_string(),
            ));
        };
        let mut reader = BufReader::new(File::open(path)?);
        let (kind, _, _) = format::read_header(&mut reader)?;
        if kind != expected {
            return Err(QuadmapError::Corrupt(format!(
                "unexpected file kind in {}",
                path.display()
            )));
        }
        *cache = Some(reader);
    }
    cache
        .as_mut()
        .ok_or_else(|| QuadmapError::Corrupt("data file unavailable".to_string()))
}

fn load_offsets(path: &Path, count: u64) -> Result<Vec<u64>> {
    let mut reader = BufReader::new(File::open(path)?);
    let (kind, _, _) = format::read_header(&mut reader)?;
    if kind != FileKind::Offsets {
        return Err(QuadmapError::Corrupt(format!(
            "unexpected file kind in {}",
            path.display()
        )));
    }
    let mut offsets = Vec::with_capacity(count.min(1 << 20) as usize);
    let mut position = 0u64;
    for _ in 0..count {
        position += read_uvarint(&mut reader)?;
        offsets.push(position);
    }
    Ok(offsets)
}

fn read_polyline_record<R: Read>(r: &mut R) -> Result<Polyline> {
    let count = read_uvarint(r)? as usize;
    let mut points = Vec::with_capacity(count.min(1 << 16));
    let mut prev: Option<LatLon> = None;
    for _ in 0..count {
        let coord = match prev {
            None => LatLon::from_packed(read_u64_le(r)?),
            Some(prev) => {
                let dlat = read_svarint(r)?;
                let dlon = read_svarint(r)?;
                LatLon::from_fixed(
                    (prev.lat as i64 + dlat) as i32,
                    (prev.lon as i64 + dlon) as i32,
                )
            }
        };
        points.push(coord);
        prev = Some(coord);
    }
    Ok(Polyline { points })
}

fn read_grouping_record<R: Read>(r: &mut R) -> Result<Vec<(u64, MemberRef)>> {
    let count = read_uvarint(r)? as usize;
    let mut members = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let mut tag = [0u8; 1];
        format::read_exact_or_corrupt(r, &mut tag, "grouping record")?;
        let kind =
            EntityKind::from_member_tag(tag[0]).ok_or(QuadmapError::UnknownMemberKind(tag[0]))?;
        let label_offset = read_uvarint(r)?;
        let target = match kind {
            EntityKind::Point => MemberRef::Point(LatLon::from_packed(read_u64_le(r)?)),
            EntityKind::Polyline => MemberRef::Polyline(read_uvarint(r)? as u32),
            EntityKind::Grouping => MemberRef::Grouping(read_uvarint(r)? as u32),
        };
        members.push((label_offset, target));
    }
    Ok(members)
}
