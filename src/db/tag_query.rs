//! Tag-bucket queries: quadtree item decoders and the iterators handed
//! to callers.

use crate::db::TagCatalog;
use crate::error::Result;
use crate::format::{self, FileKind, read_u16_le, read_u32_le};
use crate::quadtree::{ItemDecoder, LeafCell, QuadtreeQuery};
use crate::stream::read_string;
use crate::strings::StringTableReader;
use crate::varint::read_uvarint;
use quadmap_types::{LatLon, LatLonRect};
use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// A point yielded by a tag query, with its tag value.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedPoint {
    pub coord: LatLon,
    pub value: String,
}

/// A polyline or grouping yielded by a tag query: its dense ID and tag
/// value. Resolve geometry through
/// [`MapReader::polyline`](crate::db::MapReader::polyline) or
/// [`MapReader::grouping`](crate::db::MapReader::grouping) as needed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedRef {
    pub id: u32,
    pub value: String,
}

/// Where a decoder finds each item's tag value.
pub(crate) enum ValueSource {
    /// Dedicated bucket: every item shares the file's value.
    Fixed(String),
    /// Small remainder bucket: the value follows each item inline.
    Inline,
    /// Large remainder bucket: each item stores a string-table offset.
    Table(StringTableReader),
}

impl ValueSource {
    fn read<R: Read>(&mut self, r: &mut R) -> Result<String> {
        match self {
            ValueSource::Fixed(value) => Ok(value.clone()),
            ValueSource::Inline => read_string(r),
            ValueSource::Table(table) => {
                let offset = read_uvarint(r)?;
                table.get(offset)
            }
        }
    }

    /// Value source of a key's remainder bucket: interned when the
    /// bucket has a string table, inline otherwise.
    pub(crate) fn for_remainder(catalog: &TagCatalog) -> ValueSource {
        match &catalog.strings {
            Some(path) => ValueSource::Table(StringTableReader::new(path.clone())),
            None => ValueSource::Inline,
        }
    }
}

/// Decodes point leaf items: two low-order 16-bit halves completed by the
/// cell's fixed high bits, then the value.
pub(crate) struct PointItemDecoder {
    value: ValueSource,
}

impl ItemDecoder for PointItemDecoder {
    type Item = TaggedPoint;

    fn decode_item<R: Read>(&mut self, r: &mut R, cell: LeafCell) -> Result<TaggedPoint> {
        let low_lat = read_u16_le(r)? as i32;
        let low_lon = read_u16_le(r)? as i32;
        let coord = LatLon::from_fixed(cell.lat_bits | low_lat, cell.lon_bits | low_lon);
        let value = self.value.read(r)?;
        Ok(TaggedPoint { coord, value })
    }
}

/// Decodes dense-ID leaf items (polylines and groupings).
pub(crate) struct DenseItemDecoder {
    value: ValueSource,
}

impl ItemDecoder for DenseItemDecoder {
    type Item = TaggedRef;

    fn decode_item<R: Read>(&mut self, r: &mut R, _cell: LeafCell) -> Result<TaggedRef> {
        let id = read_u32_le(r)?;
        let value = self.value.read(r)?;
        Ok(TaggedRef { id, value })
    }
}

pub(crate) type TreeQuery<D> = QuadtreeQuery<BufReader<File>, D>;

pub(crate) fn open_tree<D: ItemDecoder>(
    path: &Path,
    expected_kind: FileKind,
    depth_limit: u32,
    area: &LatLonRect,
    decoder: D,
) -> Result<TreeQuery<D>> {
    let mut reader = BufReader::new(File::open(path)?);
    let (kind, _, _) = format::read_header(&mut reader)?;
    if kind != expected_kind {
        return Err(crate::error::QuadmapError::Corrupt(format!(
            "unexpected file kind in {}",
            path.display()
        )));
    }
    Ok(QuadtreeQuery::new(
        reader,
        format::HEADER_LEN as u64,
        depth_limit,
        area,
        decoder,
    ))
}

pub(crate) fn point_tree(
    path: &Path,
    kind: FileKind,
    depth_limit: u32,
    area: &LatLonRect,
    value: ValueSource,
) -> Result<TreeQuery<PointItemDecoder>> {
    open_tree(path, kind, depth_limit, area, PointItemDecoder { value })
}

pub(crate) fn dense_tree(
    path: &Path,
    kind: FileKind,
    depth_limit: u32,
    area: &LatLonRect,
    value: ValueSource,
) -> Result<TreeQuery<DenseItemDecoder>> {
    open_tree(path, kind, depth_limit, area, DenseItemDecoder { value })
}

/// Iterator over the points of one tag key inside a query rectangle.
///
/// Yields each matching point exactly once, filtered precisely against
/// the rectangle and, when the query named a value, against that value.
pub struct PointQuery {
    pub(crate) trees: Vec<TreeQuery<PointItemDecoder>>,
    pub(crate) area: LatLonRect,
    pub(crate) want_value: Option<String>,
    pub(crate) current: usize,
}

impl PointQuery {
    pub(crate) fn empty() -> Self {
        Self {
            trees: Vec::new(),
            area: LatLonRect::new(),
            want_value: None,
            current: 0,
        }
    }
}

impl Iterator for PointQuery {
    type Item = Result<TaggedPoint>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let tree = self.trees.get_mut(self.current)?;
            match tree.next() {
                Some(Ok(point)) => {
                    if !self.area.contains(point.coord) {
                        continue;
                    }
                    if let Some(want) = &self.want_value
                        && want != &point.value
                    {
                        continue;
                    }
                    return Some(Ok(point));
                }
                Some(Err(e)) => return Some(Err(e)),
                None => self.current += 1,
            }
        }
    }
}

/// Iterator over the dense IDs of one tag key inside a query rectangle.
///
/// Precision is cell-level: an entity whose bounding rectangle merely
/// comes near the query rectangle may be yielded. Each ID is yielded at
/// most once even when it spans several quadtree cells.
pub struct RefQuery {
    pub(crate) trees: Vec<TreeQuery<DenseItemDecoder>>,
    pub(crate) want_value: Option<String>,
    pub(crate) seen: FxHashSet<u32>,
    pub(crate) current: usize,
}

impl RefQuery {
    pub(crate) fn empty() -> Self {
        Self {
            trees: Vec::new(),
            want_value: None,
            seen: FxHashSet::default(),
            current: 0,
        }
    }
}

impl Iterator for RefQuery {
    type Item = Result<TaggedRef>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let tree = self.trees.get_mut(self.current)?;
            match tree.next() {
                Some(Ok(item)) => {
                    if !self.seen.insert(item.id) {
                        continue;
                    }
                    if let Some(want) = &self.want_value
                        && want != &item.value
                    {
                        continue;
                    }
                    return Some(Ok(item));
                }
                Some(Err(e)) => return Some(Err(e)),
                None => self.current += 1,
            }
        }
    }
}
