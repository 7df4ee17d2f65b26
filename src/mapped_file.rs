//! Memory-mapped archive files.
//!
//! Mapping an archive permits lazy loading: leaf voxel buffers are not
//! decoded until first accessed, streaming from the map at an offset
//! recorded at read time.  The map must therefore persist as long as any
//! unloaded leaf refers to it, which is ensured by handing out
//! `Arc<MappedFile>` clones: the reading stream holds one, and every
//! delayed leaf buffer holds another.

use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::stream::{set_mapped_file, InStream};

/// Callback invoked with the file's path just before the map is closed.
pub type Notifier = Box<dyn Fn(&Path) + Send + Sync>;

pub struct MappedFile {
    filename: PathBuf,
    map: Mmap,
    auto_delete: bool,
    notifier: Mutex<Option<Notifier>>,
}

impl MappedFile {
    /// Map `path` read-only.
    ///
    /// With `auto_delete` set the file is unlinked immediately on Unix
    /// (the mapping keeps the data reachable) and removed again,
    /// best-effort, when the last owner drops the map.
    pub fn open(path: impl AsRef<Path>, auto_delete: bool) -> Result<Arc<Self>> {
        let filename = path.as_ref().to_owned();
        let file = fs::File::open(&filename).map_err(|e| Error::Map {
            path: filename.clone(),
            source: e,
        })?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::Map {
            path: filename.clone(),
            source: e,
        })?;

        #[cfg(unix)]
        if auto_delete {
            let _ = fs::remove_file(&filename);
        }

        Ok(Arc::new(Self {
            filename,
            map,
            auto_delete,
            notifier: Mutex::new(None),
        }))
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// The mapped bytes.  Read-only and safe to slice from any thread.
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    /// A fresh input stream over the whole mapped range.  The stream (and
    /// anything that captures it) shares ownership of the map.
    pub fn buffer(self: &Arc<Self>) -> InStream<'static> {
        let mut strm = InStream::new(MappedRegion {
            file: Arc::clone(self),
            pos: 0,
        });
        set_mapped_file(&mut strm, Some(Arc::clone(self)));
        strm
    }

    pub fn set_notifier(&self, notifier: Notifier) {
        *self.notifier.lock() = Some(notifier);
    }

    pub fn clear_notifier(&self) {
        *self.notifier.lock() = None;
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        tracing::debug!(file = %self.filename.display(), "closing memory-mapped file");
        if let Some(notifier) = self.notifier.lock().take() {
            notifier(&self.filename);
        }
        if self.auto_delete {
            if let Err(e) = fs::remove_file(&self.filename) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        file = %self.filename.display(),
                        error = %e,
                        "failed to remove temporary file"
                    );
                }
            }
        }
    }
}

/// A cursor over a mapped file that co-owns the map.
pub struct MappedRegion {
    file: Arc<MappedFile>,
    pos: usize,
}

impl Read for MappedRegion {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = self.file.bytes();
        let remaining = bytes.len().saturating_sub(self.pos);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&bytes[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn write_temp(contents: &[u8]) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped.bin");
        fs::File::create(&path).unwrap().write_all(contents).unwrap();
        // Keep the directory alive for the duration of the test process.
        std::mem::forget(dir);
        path
    }

    #[test]
    fn read_through_buffer() {
        let path = write_temp(b"hello mapped world");
        let mapped = MappedFile::open(&path, false).unwrap();
        let mut strm = mapped.buffer();
        let mut out = String::new();
        strm.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello mapped world");
        assert!(crate::stream::get_mapped_file(&strm).is_some());
    }

    #[test]
    fn buffer_keeps_map_alive() {
        let path = write_temp(&[7u8; 64]);
        let mapped = MappedFile::open(&path, false).unwrap();
        let mut strm = mapped.buffer();
        drop(mapped);
        let mut buf = [0u8; 64];
        strm.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [7u8; 64]);
    }

    #[test]
    fn notifier_runs_on_drop() {
        static CALLED: AtomicBool = AtomicBool::new(false);
        let path = write_temp(b"x");
        let mapped = MappedFile::open(&path, false).unwrap();
        mapped.set_notifier(Box::new(|_| CALLED.store(true, Ordering::SeqCst)));
        drop(mapped);
        assert!(CALLED.load(Ordering::SeqCst));
    }

    #[cfg(unix)]
    #[test]
    fn auto_delete_unlinks_immediately() {
        let path = write_temp(b"temporary");
        let mapped = MappedFile::open(&path, true).unwrap();
        assert!(!path.exists());
        assert_eq!(mapped.bytes(), b"temporary");
    }
}
