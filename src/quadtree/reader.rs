//! Quadtree decoding: a lazy, prefix-pruning traversal.

use super::{EARLY_EXIT, cell_origin, depth_mask};
use crate::error::Result;
use crate::format::read_u32_le;
use crate::varint::read_uvarint;
use quadmap_types::LatLonRect;
use std::io::{Read, Seek, SeekFrom};

/// Fixed high-order coordinate bits of the leaf cell being decoded.
///
/// Leaf items may store only their low-order bits; the decoder supplies
/// the rest from the cell's path through the tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeafCell {
    pub lat_bits: i32,
    pub lon_bits: i32,
}

/// Decodes one leaf item from the byte stream.
pub trait ItemDecoder {
    type Item;

    fn decode_item<R: Read>(&mut self, r: &mut R, cell: LeafCell) -> Result<Self::Item>;
}

struct Frame {
    depth: u32,
    lat_bits: u32,
    lon_bits: u32,
    pos: u64,
}

/// Iterator over the items of one encoded quadtree that may intersect a
/// query rectangle.
///
/// The traversal keeps an explicit stack of `(depth, path bits, file
/// position)` frames and skips every subtree whose cell prefix disagrees
/// with the query rectangle's common leading bits. Pruning is
/// conservative at cell granularity: callers needing exact containment
/// filter the yielded items against the rectangle themselves.
pub struct QuadtreeQuery<R, D: ItemDecoder> {
    reader: R,
    decoder: D,
    depth_limit: u32,
    lat_bits: i32,
    lat_mask: i32,
    lon_bits: i32,
    lon_mask: i32,
    stack: Vec<Frame>,
    leaf_remaining: u64,
    cell: LeafCell,
    finished: bool,
}

impl<R: Read + Seek, D: ItemDecoder> QuadtreeQuery<R, D> {
    /// Start a query over the tree beginning at absolute offset `start`.
    ///
    /// `depth_limit` must match the value the tree was encoded with; it
    /// decides where leaves omit the early-exit marker.
    pub fn new(reader: R, start: u64, depth_limit: u32, area: &LatLonRect, decoder: D) -> Self {
        let (lat_bits, lat_mask) = area.same_bits_lat();
        let (lon_bits, lon_mask) = area.same_bits_lon();
        Self {
            reader,
            decoder,
            depth_limit,
            lat_bits,
            lat_mask,
            lon_bits,
            lon_mask,
            stack: vec![Frame {
                depth: 0,
                lat_bits: 0,
                lon_bits: 0,
                pos: start,
            }],
            leaf_remaining: 0,
            cell: LeafCell::default(),
            finished: area.is_empty(),
        }
    }

    fn step(&mut self) -> Result<Option<D::Item>> {
        loop {
            if self.leaf_remaining > 0 {
                self.leaf_remaining -= 1;
                let item = self.decoder.decode_item(&mut self.reader, self.cell)?;
                return Ok(Some(item));
            }

            let Some(frame) = self.stack.pop() else {
                return Ok(None);
            };

            let lat = cell_origin(frame.lat_bits, frame.depth);
            let lon = cell_origin(frame.lon_bits, frame.depth);
            if frame.depth > 0 {
                let mask = depth_mask(frame.depth);
                if (self.lat_bits & mask) != (lat & self.lat_mask)
                    || (self.lon_bits & mask) != (lon & self.lon_mask)
                {
                    continue;
                }
            }

            self.reader.seek(SeekFrom::Start(frame.pos))?;
            let first = if frame.depth == self.depth_limit {
                EARLY_EXIT
            } else {
                read_u32_le(&mut self.reader)?
            };
            if first == EARLY_EXIT {
                self.leaf_remaining = read_uvarint(&mut self.reader)?;
                self.cell = LeafCell {
                    lat_bits: lat,
                    lon_bits: lon,
                };
                continue;
            }
            let second = read_u32_le(&mut self.reader)?;
            let third = read_u32_le(&mut self.reader)?;

            let depth = frame.depth + 1;
            let lat_bits = frame.lat_bits << 1;
            let lon_bits = frame.lon_bits << 1;
            self.stack.push(Frame {
                depth,
                lat_bits,
                lon_bits,
                pos: frame.pos + 12,
            });
            self.stack.push(Frame {
                depth,
                lat_bits,
                lon_bits: lon_bits | 1,
                pos: first as u64,
            });
            self.stack.push(Frame {
                depth,
                lat_bits: lat_bits | 1,
                lon_bits,
                pos: second as u64,
            });
            self.stack.push(Frame {
                depth,
                lat_bits: lat_bits | 1,
                lon_bits: lon_bits | 1,
                pos: third as u64,
            });
        }
    }
}

impl<R: Read + Seek, D: ItemDecoder> Iterator for QuadtreeQuery<R, D> {
    type Item = Result<D::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
