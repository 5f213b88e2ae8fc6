//! De-duplicated, offset-addressed string tables.
//!
//! Large remainder buckets and grouping member labels repeat a small set
//! of strings many times. Instead of inlining them, each distinct string
//! is appended once to a table file and referenced by its absolute byte
//! offset, which stays valid for the lifetime of the table.

use crate::convert::registry::{FileId, FileRegistry};
use crate::error::{QuadmapError, Result};
use crate::format::{self, FileKind};
use crate::stream::{read_string, write_string};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::PathBuf;

/// Write side: interns strings into a lazily created table file.
///
/// The backing file is only created when the first string is interned, so
/// buckets that never intern anything produce no table at all.
/// Single-writer; offsets are handed out in first-seen order.
pub struct StringTableWriter {
    rel_path: PathBuf,
    file: Option<FileId>,
    offsets: FxHashMap<String, u64>,
}

impl StringTableWriter {
    /// `rel_path` is the database-relative location of the table file.
    pub fn new(rel_path: PathBuf) -> Self {
        Self {
            rel_path,
            file: None,
            offsets: FxHashMap::default(),
        }
    }

    /// Return the offset of `value`, appending it on first sight.
    pub fn intern(&mut self, registry: &mut FileRegistry, value: &str) -> Result<u64> {
        if let Some(&offset) = self.offsets.get(value) {
            return Ok(offset);
        }
        let id = match self.file {
            Some(id) => id,
            None => {
                let id = registry.create_deferred(&self.rel_path, FileKind::Strings)?;
                self.file = Some(id);
                id
            }
        };
        let writer = registry.writer(id);
        let offset = writer.position();
        write_string(writer, value)?;
        self.offsets.insert(value.to_string(), offset);
        Ok(offset)
    }

    /// Number of distinct strings interned so far.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Record the final string count in the table's header, if the table
    /// was ever created.
    pub fn finish(self, registry: &mut FileRegistry) {
        if let Some(id) = self.file {
            registry.set_count(id, self.offsets.len() as u64);
        }
    }
}

/// Read side: looks strings up by offset, caching every hit.
///
/// The cache is sound because tables are immutable once the database is
/// built. Each reader owns its own file handle and cache; sessions never
/// share state.
pub struct StringTableReader {
    path: PathBuf,
    file: Option<BufReader<File>>,
    cache: FxHashMap<u64, String>,
}

impl StringTableReader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            cache: FxHashMap::default(),
        }
    }

    /// Fetch the string stored at `offset`.
    pub fn get(&mut self, offset: u64) -> Result<String> {
        if let Some(cached) = self.cache.get(&offset) {
            return Ok(cached.clone());
        }
        if offset < format::HEADER_LEN as u64 {
            return Err(QuadmapError::Corrupt(
                "string offset inside file header".to_string(),
            ));
        }
        if self.file.is_none() {
            let mut reader = BufReader::new(File::open(&self.path)?);
            let (kind, _, _) = format::read_header(&mut reader)?;
            if kind != FileKind::Strings {
                return Err(QuadmapError::Corrupt(
                    "expected a string table file".to_string(),
                ));
            }
            self.file = Some(reader);
        }
        let reader = self
            .file
            .as_mut()
            .ok_or_else(|| QuadmapError::Corrupt("string table unavailable".to_string()))?;
        reader.seek(SeekFrom::Start(offset))?;
        let value = read_string(reader)?;
        self.cache.insert(offset, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_intern_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let mut registry = FileRegistry::new(dir.path()).unwrap();
        let mut table = StringTableWriter::new(PathBuf::from("values.strings"));

        let a = table.intern(&mut registry, "restaurant").unwrap();
        let b = table.intern(&mut registry, "bar").unwrap();
        let a_again = table.intern(&mut registry, "restaurant").unwrap();
        assert_eq!(a, a_again);
        assert_ne!(a, b);
        // First-seen order: offsets ascend.
        assert!(b > a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_lazy_creation() {
        let dir = TempDir::new().unwrap();
        let mut registry = FileRegistry::new(dir.path()).unwrap();
        let table = StringTableWriter::new(PathBuf::from("never.strings"));
        table.finish(&mut registry);
        registry.finish().unwrap();
        assert!(!dir.path().join("never.strings").exists());
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let mut registry = FileRegistry::new(dir.path()).unwrap();
        let mut table = StringTableWriter::new(PathBuf::from("values.strings"));
        let offsets: Vec<u64> = ["cafe", "bar", "pub", "cafe"]
            .iter()
            .map(|v| table.intern(&mut registry, v).unwrap())
            .collect();
        table.finish(&mut registry);
        registry.finish().unwrap();

        let mut reader = StringTableReader::new(dir.path().join("values.strings"));
        assert_eq!(reader.get(offsets[0]).unwrap(), "cafe");
        assert_eq!(reader.get(offsets[1]).unwrap(), "bar");
        assert_eq!(reader.get(offsets[2]).unwrap(), "pub");
        assert_eq!(offsets[0], offsets[3]);
        // Cached path returns the same answer.
        assert_eq!(reader.get(offsets[1]).unwrap(), "bar");
    }

    #[test]
    fn test_header_records_distinct_count() {
        let dir = TempDir::new().unwrap();
        let mut registry = FileRegistry::new(dir.path()).unwrap();
        let mut table = StringTableWriter::new(PathBuf::from("values.strings"));
        for value in ["a", "b", "a", "c", "b"] {
            table.intern(&mut registry, value).unwrap();
        }
        table.finish(&mut registry);
        registry.finish().unwrap();

        let mut reader = BufReader::new(File::open(dir.path().join("values.strings")).unwrap());
        let (kind, _, count) = format::read_header(&mut reader).unwrap();
        assert_eq!(kind, FileKind::Strings);
        assert_eq!(count, 3);
    }
}
