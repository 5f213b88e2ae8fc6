//! Quadtree encoding.
//!
//! The tree is built as an in-memory arena first: each node knows its
//! serialized byte length, so absolute child offsets are derived
//! analytically and the whole tree is emitted in one linear top-down
//! write. No backward seeks, no placeholder patching.

use super::{EARLY_EXIT, QuadtreeParams, cell_origin, depth_mask};
use crate::error::{QuadmapError, Result};
use crate::varint::{uvarint_len, write_uvarint};
use std::io::Write;

enum Node {
    Leaf {
        /// Present unless the leaf sits exactly at the depth limit.
        early_exit: bool,
        count: u64,
        items: Vec<u8>,
    },
    Branch {
        size: u64,
        children: Box<[Node; 4]>,
    },
}

impl Node {
    fn size(&self) -> u64 {
        match self {
            Node::Leaf {
                early_exit,
                count,
                items,
            } => {
                let marker = if *early_exit { 4 } else { 0 };
                marker + uvarint_len(*count) as u64 + items.len() as u64
            }
            Node::Branch { size, .. } => *size,
        }
    }
}

/// A fully built tree, ready to be written at a known file offset.
pub struct EncodedQuadtree {
    root: Node,
}

impl EncodedQuadtree {
    /// Total encoded length in bytes.
    pub fn encoded_len(&self) -> u64 {
        self.root.size()
    }

    /// Emit the tree. `start_offset` must be the absolute file position
    /// the first byte will land on; child offsets are absolute within the
    /// file, matching what the reader seeks to.
    pub fn write_to<W: Write>(&self, out: &mut W, start_offset: u64) -> Result<()> {
        emit(&self.root, start_offset, out)
    }
}

/// Build the quadtree for `items`.
///
/// `filter` answers whether an item belongs to the cell `(lat, lon,
/// mask)`; an item may belong to several cells (rectangle overlap) or to
/// exactly one (coordinate bit equality). `serialize` renders one item
/// into the leaf buffer.
pub fn build_quadtree<T, F, S>(
    items: &[T],
    params: QuadtreeParams,
    filter: F,
    mut serialize: S,
) -> Result<EncodedQuadtree>
where
    F: Fn(&T, i32, i32, i32) -> bool,
    S: FnMut(&T, &mut Vec<u8>) -> Result<()>,
{
    let all: Vec<&T> = items.iter().collect();
    let root = build_node(all, 0, 0, 0, params, &filter, &mut serialize)?;
    Ok(EncodedQuadtree { root })
}

fn build_node<T, F, S>(
    items: Vec<&T>,
    depth: u32,
    lat_bits: u32,
    lon_bits: u32,
    params: QuadtreeParams,
    filter: &F,
    serialize: &mut S,
) -> Result<Node>
where
    F: Fn(&T, i32, i32, i32) -> bool,
    S: FnMut(&T, &mut Vec<u8>) -> Result<()>,
{
    let items = if depth == 0 {
        items
    } else {
        let mask = depth_mask(depth);
        let lat = cell_origin(lat_bits, depth);
        let lon = cell_origin(lon_bits, depth);
        items
            .into_iter()
            .filter(|&item| filter(item, lat, lon, mask))
            .collect()
    };

    if depth == params.depth_limit || items.is_empty() || items.len() < params.split_threshold {
        let mut buf = Vec::new();
        for &item in &items {
            serialize(item, &mut buf)?;
        }
        return Ok(Node::Leaf {
            early_exit: depth != params.depth_limit,
            count: items.len() as u64,
            items: buf,
        });
    }

    let depth = depth + 1;
    let lat_bits = lat_bits << 1;
    let lon_bits = lon_bits << 1;
    let children = Box::new([
        build_node(
            items.clone(),
            depth,
            lat_bits,
            lon_bits,
            params,
            filter,
            serialize,
        )?,
        build_node(
            items.clone(),
            depth,
            lat_bits,
            lon_bits | 1,
            params,
            filter,
            serialize,
        )?,
        build_node(
            items.clone(),
            depth,
            lat_bits | 1,
            lon_bits,
            params,
            filter,
            serialize,
        )?,
        build_node(
            items,
            depth,
            lat_bits | 1,
            lon_bits | 1,
            params,
            filter,
            serialize,
        )?,
    ]);
    let size = 12 + children.iter().map(Node::size).sum::<u64>();
    Ok(Node::Branch { size, children })
}

fn emit<W: Write>(node: &Node, at: u64, out: &mut W) -> Result<()> {
    match node {
        Node::Leaf {
            early_exit,
            count,
            items,
        } => {
            if *early_exit {
                out.write_all(&EARLY_EXIT.to_le_bytes())?;
            }
            write_uvarint(out, *count)?;
            out.write_all(items)?;
        }
        Node::Branch { children, .. } => {
            let first = at + 12;
            let second = first + children[0].size();
            let third = second + children[1].size();
            let fourth = third + children[2].size();
            for offset in [second, third, fourth] {
                let offset = u32::try_from(offset).map_err(|_| QuadmapError::OffsetOverflow)?;
                out.write_all(&offset.to_le_bytes())?;
            }
            emit(&children[0], first, out)?;
            emit(&children[1], second, out)?;
            emit(&children[2], third, out)?;
            emit(&children[3], fourth, out)?;
        }
    }
    Ok(())
}
