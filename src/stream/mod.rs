//! Streams that carry archive state alongside their bytes.
//!
//! Readers and writers deep inside the archive need to know the file
//! format version, the compression in effect, the grid currently being
//! processed and more, without that state being global.  [`InStream`] and
//! [`OutStream`] wrap any byte stream together with a [`StreamState`] side
//! table; the free functions below are the only way archive code touches
//! that table, keeping the legacy typed slots and the bound
//! [`StreamMetadata`] in sync.

mod metadata;

pub use metadata::{AuxDataMap, AuxValue, StreamMetadata};

use std::any::Any;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::error::Result;
use crate::grid::NUM_GRID_CLASSES;
use crate::mapped_file::MappedFile;
use crate::version::VersionId;

// ── State ────────────────────────────────────────────────────────────────────

/// The per-stream side table.
///
/// The typed fields are the legacy slots that old code paths query
/// directly; `metadata` is the authoritative binding.  Setters in this
/// module update both.
#[derive(Default)]
pub struct StreamState {
    pub(crate) file_version: u32,
    pub(crate) library_version: VersionId,
    pub(crate) compression: u32,
    pub(crate) write_grid_stats: bool,
    pub(crate) grid_class: u32,
    pub(crate) half_float: bool,
    pub(crate) background: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) mapped_file: Option<Arc<MappedFile>>,
    pub(crate) metadata: Option<StreamMetadata>,
}

/// Anything that carries a [`StreamState`].
pub trait MetadataCarrier {
    fn state(&self) -> &StreamState;
    fn state_mut(&mut self) -> &mut StreamState;
}

// ── Streams ──────────────────────────────────────────────────────────────────

/// An input byte stream tagged with archive state.
///
/// Tracks the number of bytes consumed so far; for a stream produced by
/// [`MappedFile::buffer`] this equals the absolute offset into the map,
/// which is what delayed leaf buffers record.
pub struct InStream<'a> {
    inner: Box<dyn Read + 'a>,
    pos: u64,
    state: StreamState,
}

impl<'a> InStream<'a> {
    pub fn new(reader: impl Read + 'a) -> Self {
        Self {
            inner: Box::new(reader),
            pos: 0,
            state: StreamState::default(),
        }
    }

    /// Bytes consumed since the stream was created.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for InStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl MetadataCarrier for InStream<'_> {
    fn state(&self) -> &StreamState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut StreamState {
        &mut self.state
    }
}

trait WriteSeek: Write + Seek {}
impl<T: Write + Seek> WriteSeek for T {}

/// An output byte stream tagged with archive state.
///
/// The underlying writer must be seekable; whether the archive actually
/// seeks is governed by the caller's `seekable` flag.
pub struct OutStream<'a> {
    inner: Box<dyn WriteSeek + 'a>,
    state: StreamState,
}

impl<'a> OutStream<'a> {
    pub fn new(writer: impl Write + Seek + 'a) -> Self {
        Self {
            inner: Box::new(writer),
            state: StreamState::default(),
        }
    }
}

impl Write for OutStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for OutStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl MetadataCarrier for OutStream<'_> {
    fn state(&self) -> &StreamState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut StreamState {
        &mut self.state
    }
}

// ── Tagged state accessors ───────────────────────────────────────────────────

pub fn get_format_version(strm: &dyn MetadataCarrier) -> u32 {
    strm.state().file_version
}

pub fn get_library_version(strm: &dyn MetadataCarrier) -> VersionId {
    strm.state().library_version
}

/// Library and file version as one string, e.g. `"12.1/224"`.
pub fn get_version_string(strm: &dyn MetadataCarrier) -> String {
    format!(
        "{}/{}",
        get_library_version(strm),
        get_format_version(strm)
    )
}

pub fn set_version(strm: &mut dyn MetadataCarrier, library: VersionId, file: u32) {
    let state = strm.state_mut();
    state.file_version = file;
    state.library_version = library;
    if let Some(meta) = state.metadata.as_mut() {
        meta.set_file_version(file);
        meta.set_library_version(library);
    }
}

pub fn get_data_compression(strm: &dyn MetadataCarrier) -> u32 {
    strm.state().compression
}

pub fn set_data_compression(strm: &mut dyn MetadataCarrier, compression: u32) {
    let state = strm.state_mut();
    state.compression = compression;
    if let Some(meta) = state.metadata.as_mut() {
        meta.set_compression(compression);
    }
}

pub fn get_write_grid_stats(strm: &dyn MetadataCarrier) -> bool {
    strm.state().write_grid_stats
}

pub fn set_write_grid_stats(strm: &mut dyn MetadataCarrier, write_stats: bool) {
    let state = strm.state_mut();
    state.write_grid_stats = write_stats;
    if let Some(meta) = state.metadata.as_mut() {
        meta.set_write_grid_stats(write_stats);
    }
}

pub fn get_grid_class(strm: &dyn MetadataCarrier) -> u32 {
    let val = strm.state().grid_class;
    if val >= NUM_GRID_CLASSES {
        0
    } else {
        val
    }
}

pub fn set_grid_class(strm: &mut dyn MetadataCarrier, class: u32) {
    let state = strm.state_mut();
    state.grid_class = class;
    if let Some(meta) = state.metadata.as_mut() {
        meta.set_grid_class(class);
    }
}

pub fn get_half_float(strm: &dyn MetadataCarrier) -> bool {
    strm.state().half_float
}

pub fn set_half_float(strm: &mut dyn MetadataCarrier, half: bool) {
    let state = strm.state_mut();
    state.half_float = half;
    if let Some(meta) = state.metadata.as_mut() {
        meta.set_half_float(half);
    }
}

pub fn get_grid_background_value(strm: &dyn MetadataCarrier) -> Option<Arc<dyn Any + Send + Sync>> {
    strm.state().background.clone()
}

pub fn set_grid_background_value(
    strm: &mut dyn MetadataCarrier,
    background: Option<Arc<dyn Any + Send + Sync>>,
) {
    let state = strm.state_mut();
    state.background = background.clone();
    if let Some(meta) = state.metadata.as_mut() {
        meta.set_background(background);
    }
}

pub fn get_mapped_file(strm: &dyn MetadataCarrier) -> Option<Arc<MappedFile>> {
    strm.state().mapped_file.clone()
}

pub fn set_mapped_file(strm: &mut dyn MetadataCarrier, file: Option<Arc<MappedFile>>) {
    strm.state_mut().mapped_file = file;
}

pub fn get_stream_metadata(strm: &dyn MetadataCarrier) -> Option<&StreamMetadata> {
    strm.state().metadata.as_ref()
}

pub fn get_stream_metadata_mut(strm: &mut dyn MetadataCarrier) -> Option<&mut StreamMetadata> {
    strm.state_mut().metadata.as_mut()
}

/// Bind metadata to a stream.  With `transfer` set, the metadata's values
/// are also pushed into the legacy typed slots for code that only reads
/// those.
pub fn set_stream_metadata(strm: &mut dyn MetadataCarrier, meta: StreamMetadata, transfer: bool) {
    let state = strm.state_mut();
    if transfer {
        state.file_version = meta.file_version();
        state.library_version = meta.library_version();
        state.compression = meta.compression();
        state.background = meta.background();
        state.grid_class = meta.grid_class();
        state.half_float = meta.half_float();
        state.write_grid_stats = meta.write_grid_stats();
    }
    state.metadata = Some(meta);
}

pub fn clear_stream_metadata(strm: &mut dyn MetadataCarrier) -> Option<StreamMetadata> {
    strm.state_mut().metadata.take()
}

/// Run `f` with the stream's current metadata binding saved, reinstating
/// it afterwards whether `f` succeeded or failed.  Every per-grid read and
/// write goes through this so that the file-level binding survives.
pub fn with_file_metadata_restored<S, T, F>(strm: &mut S, f: F) -> Result<T>
where
    S: MetadataCarrier + ?Sized,
    F: FnOnce(&mut S) -> Result<T>,
{
    let saved = strm.state().metadata.clone();
    let result = f(strm);
    strm.state_mut().metadata = saved;
    result
}
