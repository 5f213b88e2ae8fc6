//! On-disk format shared by the writer and reader paths: the 15-byte file
//! header, the file-kind tags, and the deterministic database file names.
//!
//! Every database file starts with the ASCII header `KKKK:V:NNNNNNN:`,
//! where `KKKK` is the four-character kind tag, `V` the format version
//! digit and `NNNNNNN` the right-justified item count (blank when zero,
//! clipped to 9,999,999). Files whose count is unknown at creation write
//! the blank form and patch the field once at close.

use crate::error::{QuadmapError, Result};
use crate::stream::EntityKind;
use std::hash::Hasher;
use std::io::Read;
use std::path::PathBuf;

/// Total header length in bytes.
pub const HEADER_LEN: usize = 15;
/// Byte offset of the count field within the header.
pub const COUNT_OFFSET: u64 = 7;
/// Largest value the count field can carry; bigger counts are clipped.
pub const COUNT_MAX: u64 = 9_999_999;
/// Current format version digit.
pub const FORMAT_VERSION: u8 = b'1';

pub const POLYLINES_DATA: &str = "polylines.dat";
pub const POLYLINES_OFFSETS: &str = "polylines.offsets";
pub const POLYLINE_SOURCE_IDS: &str = "source_ids.polylines.dat";
pub const GROUPINGS_DATA: &str = "groupings.dat";
pub const GROUPINGS_OFFSETS: &str = "groupings.offsets";
pub const GROUPING_SOURCE_IDS: &str = "source_ids.groupings.dat";
pub const GROUPINGS_STRINGS: &str = "groupings.strings";

/// The kind of content a database file holds, as recorded in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Polyline geometry records (`PLIN`).
    PolylineData,
    /// Grouping member records (`GRPS`).
    GroupingData,
    /// Record-offset delta stream (`OFFS`).
    Offsets,
    /// Source-ID delta stream (`SIDS`).
    SourceIds,
    /// Point tag-bucket quadtree (`PTAG`).
    PointTags,
    /// Polyline tag-bucket quadtree (`LTAG`).
    PolylineTags,
    /// Grouping tag-bucket quadtree (`GTAG`).
    GroupingTags,
    /// String table (`STRN`).
    Strings,
}

impl FileKind {
    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            FileKind::PolylineData => b"PLIN",
            FileKind::GroupingData => b"GRPS",
            FileKind::Offsets => b"OFFS",
            FileKind::SourceIds => b"SIDS",
            FileKind::PointTags => b"PTAG",
            FileKind::PolylineTags => b"LTAG",
            FileKind::GroupingTags => b"GTAG",
            FileKind::Strings => b"STRN",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"PLIN" => Some(FileKind::PolylineData),
            b"GRPS" => Some(FileKind::GroupingData),
            b"OFFS" => Some(FileKind::Offsets),
            b"SIDS" => Some(FileKind::SourceIds),
            b"PTAG" => Some(FileKind::PointTags),
            b"LTAG" => Some(FileKind::PolylineTags),
            b"GTAG" => Some(FileKind::GroupingTags),
            b"STRN" => Some(FileKind::Strings),
            _ => None,
        }
    }
}

/// Render the count field: blank when zero, right-justified otherwise.
pub fn encode_count(count: u64) -> [u8; 7] {
    let mut field = [b' '; 7];
    if count > 0 {
        let text = count.min(COUNT_MAX).to_string();
        field[7 - text.len()..].copy_from_slice(text.as_bytes());
    }
    field
}

/// Render a full header for `kind` with the given item count.
pub fn encode_header(kind: FileKind, count: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(kind.tag());
    header[4] = b':';
    header[5] = FORMAT_VERSION;
    header[6] = b':';
    header[7..14].copy_from_slice(&encode_count(count));
    header[14] = b':';
    header
}

/// Read and validate a header, returning the kind, version and count.
pub fn read_header<R: Read>(r: &mut R) -> Result<(FileKind, u8, u64)> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_corrupt(r, &mut header, "file header")?;
    if header[4] != b':' || header[6] != b':' || header[14] != b':' {
        return Err(QuadmapError::Corrupt("malformed file header".to_string()));
    }
    let kind = FileKind::from_tag(&header[..4])
        .ok_or_else(|| QuadmapError::Corrupt("unknown file kind tag".to_string()))?;
    let version = header[5];
    let count_text = std::str::from_utf8(&header[7..14])
        .map_err(|_| QuadmapError::Corrupt("malformed count field".to_string()))?
        .trim();
    let count = if count_text.is_empty() {
        0
    } else {
        count_text
            .parse::<u64>()
            .map_err(|_| QuadmapError::Corrupt("malformed count field".to_string()))?
    };
    Ok((kind, version, count))
}

/// Escape one path component so it is safe on any filesystem.
///
/// Every byte outside `[A-Za-z0-9_~-]` is percent-encoded, including the
/// separators the file-name grammar relies on (`.`, `=`, `:`), which keeps
/// parsing unambiguous for arbitrary tag keys and values.
pub fn escape_component(component: &str) -> String {
    let mut escaped = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'~' | b'-' => {
                escaped.push(byte as char);
            }
            _ => {
                // Lowercase hex keeps the escape itself case-stable, so
                // the hash suffix below fires only for real uppercase.
                escaped.push('%');
                escaped.push_str(&format!("{byte:02x}"));
            }
        }
    }
    escaped
}

/// Invert [`escape_component`]. Returns `None` for malformed input.
pub fn unescape_component(component: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(component.len());
    let mut iter = component.bytes();
    while let Some(byte) = iter.next() {
        if byte == b'%' {
            let hi = hex_digit(iter.next()?)?;
            let lo = hex_digit(iter.next()?)?;
            bytes.push(hi << 4 | lo);
        } else {
            bytes.push(byte);
        }
    }
    String::from_utf8(bytes).ok()
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

/// Six-hex-digit suffix distinguishing stems that differ only in case.
///
/// Case-insensitive filesystems would otherwise collapse
/// `point.tag.name=Cafe` and `point.tag.name=cafe` into one file.
pub fn hash_suffix(stem: &str) -> String {
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write(stem.as_bytes());
    format!("{:06x}", hasher.finish() & 0xff_ffff)
}

fn needs_hash_suffix(stem: &str) -> bool {
    stem.bytes().any(|b| b.is_ascii_uppercase())
}

/// Database-relative path of a tag-bucket file.
///
/// The directory is the tag key split on `:`; the file name is
/// `<kind>.tag.<key>[=<value>].<ext>` with each component escaped and the
/// case-collision hash suffix appended when required.
pub fn tag_file_path(kind: EntityKind, key: &str, value: Option<&str>, ext: &str) -> PathBuf {
    let mut stem = format!("{}.tag.{}", kind.file_prefix(), escape_component(key));
    if let Some(value) = value {
        stem.push('=');
        stem.push_str(&escape_component(value));
    }
    if needs_hash_suffix(&stem) {
        let suffix = hash_suffix(&stem);
        stem.push('.');
        stem.push_str(&suffix);
    }
    let mut path = PathBuf::new();
    for segment in key.split(':') {
        path.push(escape_component(segment));
    }
    path.push(format!("{stem}.{ext}"));
    path
}

/// A tag-bucket file name parsed back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTagFile {
    /// `<kind>.tag.<key>=<value>.qtr`
    Dedicated {
        kind: EntityKind,
        key: String,
        value: String,
    },
    /// `<kind>.tag.<key>.qtr`
    Remainder { kind: EntityKind, key: String },
    /// `<kind>.tag.<key>.strings`
    Strings { kind: EntityKind, key: String },
}

/// Parse a tag-bucket file name produced by [`tag_file_path`].
///
/// Returns `None` for names that do not follow the grammar; callers skip
/// such files.
pub fn parse_tag_file_name(name: &str) -> Option<ParsedTagFile> {
    let (stem, is_strings) = if let Some(stem) = name.strip_suffix(".qtr") {
        (stem, false)
    } else if let Some(stem) = name.strip_suffix(".strings") {
        (stem, true)
    } else {
        return None;
    };
    let stem = strip_hash_suffix(stem);
    let (kind, rest) = EntityKind::ALL
        .iter()
        .find_map(|&k| Some((k, stem.strip_prefix(k.file_prefix())?.strip_prefix(".tag.")?)))?;
    let (key, value) = match rest.split_once('=') {
        Some((key, value)) => (unescape_component(key)?, Some(unescape_component(value)?)),
        None => (unescape_component(rest)?, None),
    };
    Some(match (is_strings, value) {
        (true, None) => ParsedTagFile::Strings { kind, key },
        (true, Some(_)) => return None,
        (false, None) => ParsedTagFile::Remainder { kind, key },
        (false, Some(value)) => ParsedTagFile::Dedicated { kind, key, value },
    })
}

fn strip_hash_suffix(stem: &str) -> &str {
    if let Some((base, suffix)) = stem.rsplit_once('.')
        && suffix.len() == 6
        && suffix.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        && hash_suffix(base) == suffix
    {
        return base;
    }
    stem
}

pub(crate) fn read_exact_or_corrupt<R: Read>(
    r: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            QuadmapError::Corrupt(format!("truncated {what}"))
        } else {
            QuadmapError::Io(e)
        }
    })
}

pub(crate) fn read_u16_le<R: Read>(r: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact_or_corrupt(r, &mut buf, "record")?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_u32_le<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact_or_corrupt(r, &mut buf, "record")?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64_le<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact_or_corrupt(r, &mut buf, "record")?;
    Ok(u64::from_le_bytes(buf))
}
