//! Output-file registry for one conversion run.
//!
//! Every file the converter produces is created exactly once, through
//! this registry, which owns all the writers for the lifetime of the run
//! and tears them down deterministically: at [`finish`](FileRegistry::finish)
//! each writer is flushed and files whose item count was unknown at
//! creation get their header count field patched in place.

use crate::error::{QuadmapError, Result};
use crate::format::{self, FileKind};
use rustc_hash::FxHashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Handle to one registered output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(usize);

/// A buffered writer that knows its absolute position.
pub struct CountingWriter {
    inner: BufWriter<File>,
    position: u64,
}

impl CountingWriter {
    /// Absolute write position, header included.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct RegisteredFile {
    writer: CountingWriter,
    /// `Some` while the header count still needs patching at close.
    deferred_count: Option<u64>,
}

/// Owns every output file of one conversion run.
pub struct FileRegistry {
    root: PathBuf,
    files: Vec<RegisteredFile>,
    by_path: FxHashMap<PathBuf, usize>,
}

impl FileRegistry {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            files: Vec::new(),
            by_path: FxHashMap::default(),
        })
    }

    /// Create a file whose item count is already known.
    pub fn create(&mut self, rel: &Path, kind: FileKind, count: u64) -> Result<FileId> {
        self.open(rel, kind, count, None)
    }

    /// Create a file with a blank count, patched at [`finish`](Self::finish).
    pub fn create_deferred(&mut self, rel: &Path, kind: FileKind) -> Result<FileId> {
        self.open(rel, kind, 0, Some(0))
    }

    fn open(
        &mut self,
        rel: &Path,
        kind: FileKind,
        count: u64,
        deferred: Option<u64>,
    ) -> Result<FileId> {
        let path = self.root.join(rel);
        if self.by_path.contains_key(&path) {
            // Two logical files escaped to the same name.
            return Err(QuadmapError::NameConflict(path));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        let mut writer = CountingWriter {
            inner: BufWriter::new(file),
            position: 0,
        };
        writer.write_all(&format::encode_header(kind, count))?;
        let id = FileId(self.files.len());
        self.by_path.insert(path, id.0);
        self.files.push(RegisteredFile {
            writer,
            deferred_count: deferred,
        });
        Ok(id)
    }

    pub fn writer(&mut self, id: FileId) -> &mut CountingWriter {
        &mut self.files[id.0].writer
    }

    /// Record the final item count of a deferred-count file.
    pub fn set_count(&mut self, id: FileId, count: u64) {
        debug_assert!(self.files[id.0].deferred_count.is_some());
        self.files[id.0].deferred_count = Some(count);
    }

    /// Flush, backpatch deferred header counts, and close every file.
    pub fn finish(self) -> Result<()> {
        for entry in self.files {
            let mut writer = entry.writer;
            writer.flush()?;
            if let Some(count) = entry.deferred_count {
                let file = writer.inner.get_mut();
                file.seek(SeekFrom::Start(format::COUNT_OFFSET))?;
                file.write_all(&format::encode_count(count))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_create_writes_header() {
        let dir = TempDir::new().unwrap();
        let mut registry = FileRegistry::new(dir.path()).unwrap();
        let id = registry
            .create(Path::new("polylines.dat"), FileKind::PolylineData, 42)
            .unwrap();
        assert_eq!(registry.writer(id).position(), 15);
        registry.finish().unwrap();

        let mut content = String::new();
        File::open(dir.path().join("polylines.dat"))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "PLIN:1:     42:");
    }

    #[test]
    fn test_deferred_count_is_backpatched() {
        let dir = TempDir::new().unwrap();
        let mut registry = FileRegistry::new(dir.path()).unwrap();
        let id = registry
            .create_deferred(Path::new("groupings.dat"), FileKind::GroupingData)
            .unwrap();
        registry.writer(id).write_all(b"payload").unwrap();
        registry.set_count(id, 7);
        registry.finish().unwrap();

        let mut content = String::new();
        File::open(dir.path().join("groupings.dat"))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "GRPS:1:      7:payload");
    }

    #[test]
    fn test_duplicate_path_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let mut registry = FileRegistry::new(dir.path()).unwrap();
        registry
            .create(Path::new("a/x.qtr"), FileKind::PointTags, 1)
            .unwrap();
        assert!(matches!(
            registry.create(Path::new("a/x.qtr"), FileKind::PointTags, 1),
            Err(QuadmapError::NameConflict(_))
        ));
        registry.finish().unwrap();
    }

    #[test]
    fn test_nested_directories_created() {
        let dir = TempDir::new().unwrap();
        let mut registry = FileRegistry::new(dir.path()).unwrap();
        registry
            .create(
                Path::new("addr/street/polyline.tag.addr%3astreet.qtr"),
                FileKind::PolylineTags,
                3,
            )
            .unwrap();
        registry.finish().unwrap();
        assert!(
            dir.path()
                .join("addr/street/polyline.tag.addr%3astreet.qtr")
                .exists()
        );
    }
}
