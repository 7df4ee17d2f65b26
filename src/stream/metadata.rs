//! Per-operation stream metadata.
//!
//! One [`StreamMetadata`] is bound to a stream for the duration of an
//! archive operation, and per-grid shallow copies shadow it while a single
//! grid is being read or written.  It is a plain value type; rebinding and
//! restoring are cheap copies.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::compression::{compression_to_string, COMPRESS_NONE};
use crate::grid::GridClass;
use crate::metadata::MetaMap;
use crate::version::{VersionId, FILE_VERSION};

use super::MetadataCarrier;

/// A scalar value in the auxiliary data map.
#[derive(Debug, Clone, PartialEq)]
pub enum AuxValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
}

impl fmt::Display for AuxValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuxValue::Bool(v) => write!(f, "{v}"),
            AuxValue::Int32(v) => write!(f, "{v}"),
            AuxValue::Int64(v) => write!(f, "{v}"),
            AuxValue::UInt32(v) => write!(f, "{v}"),
            AuxValue::UInt64(v) => write!(f, "{v}"),
            AuxValue::Float(v) => write!(f, "{v}"),
            AuxValue::Double(v) => write!(f, "{v}"),
            AuxValue::String(v) => write!(f, "{v}"),
        }
    }
}

/// String-keyed auxiliary storage scoped to one stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuxDataMap {
    entries: BTreeMap<String, AuxValue>,
}

impl AuxDataMap {
    pub fn insert(&mut self, key: impl Into<String>, value: AuxValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&AuxValue> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<AuxValue> {
        self.entries.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AuxValue)> {
        self.entries.iter()
    }
}

impl fmt::Display for AuxDataMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            writeln!(f, "{key}: {value}")?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct StreamMetadata {
    file_version: u32,
    library_version: VersionId,
    compression: u32,
    grid_class: u32,
    background: Option<Arc<dyn Any + Send + Sync>>,
    half_float: bool,
    write_grid_stats: bool,
    seekable: bool,
    counting_passes: bool,
    pass: u32,
    leaf: u64,
    grid_metadata: MetaMap,
    aux_data: AuxDataMap,
    delayed_load_meta: bool,
    test: u32,
}

impl Default for StreamMetadata {
    fn default() -> Self {
        Self {
            file_version: FILE_VERSION,
            library_version: VersionId::CURRENT,
            compression: COMPRESS_NONE,
            grid_class: GridClass::Unknown as u32,
            background: None,
            half_float: false,
            write_grid_stats: false,
            seekable: false,
            counting_passes: false,
            pass: 0,
            leaf: 0,
            grid_metadata: MetaMap::new(),
            aux_data: AuxDataMap::default(),
            delayed_load_meta: true,
            test: 0,
        }
    }
}

impl StreamMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb the values already tagged onto a stream.
    pub fn from_stream(strm: &dyn MetadataCarrier) -> Self {
        let state = strm.state();
        Self {
            file_version: state.file_version,
            library_version: state.library_version,
            compression: state.compression,
            grid_class: state.grid_class,
            half_float: state.half_float,
            write_grid_stats: state.write_grid_stats,
            ..Self::default()
        }
    }

    pub fn file_version(&self) -> u32 {
        self.file_version
    }
    pub fn library_version(&self) -> VersionId {
        self.library_version
    }
    pub fn compression(&self) -> u32 {
        self.compression
    }
    pub fn grid_class(&self) -> u32 {
        self.grid_class
    }
    pub fn background(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.background.clone()
    }
    pub fn half_float(&self) -> bool {
        self.half_float
    }
    pub fn write_grid_stats(&self) -> bool {
        self.write_grid_stats
    }
    pub fn seekable(&self) -> bool {
        self.seekable
    }
    pub fn counting_passes(&self) -> bool {
        self.counting_passes
    }
    pub fn pass(&self) -> u32 {
        self.pass
    }
    pub fn leaf(&self) -> u64 {
        self.leaf
    }
    pub fn delayed_load_meta(&self) -> bool {
        self.delayed_load_meta
    }
    pub fn grid_metadata(&self) -> &MetaMap {
        &self.grid_metadata
    }
    pub fn grid_metadata_mut(&mut self) -> &mut MetaMap {
        &mut self.grid_metadata
    }
    pub fn aux_data(&self) -> &AuxDataMap {
        &self.aux_data
    }
    pub fn aux_data_mut(&mut self) -> &mut AuxDataMap {
        &mut self.aux_data
    }

    /// Test-only hook: a nonzero value keeps delayed-load metadata on the
    /// grid when it is read back.  Not for normal callers.
    pub fn test(&self) -> u32 {
        self.test
    }

    pub fn set_file_version(&mut self, v: u32) {
        self.file_version = v;
    }
    pub fn set_library_version(&mut self, v: VersionId) {
        self.library_version = v;
    }
    pub fn set_compression(&mut self, c: u32) {
        self.compression = c;
    }
    pub fn set_grid_class(&mut self, c: u32) {
        self.grid_class = c;
    }
    pub fn set_background(&mut self, b: Option<Arc<dyn Any + Send + Sync>>) {
        self.background = b;
    }
    pub fn set_half_float(&mut self, b: bool) {
        self.half_float = b;
    }
    pub fn set_write_grid_stats(&mut self, b: bool) {
        self.write_grid_stats = b;
    }
    pub fn set_seekable(&mut self, b: bool) {
        self.seekable = b;
    }
    pub fn set_counting_passes(&mut self, b: bool) {
        self.counting_passes = b;
    }
    pub fn set_pass(&mut self, p: u32) {
        self.pass = p;
    }
    pub fn set_leaf(&mut self, l: u64) {
        self.leaf = l;
    }
    pub fn set_test(&mut self, t: u32) {
        self.test = t;
    }
}

impl fmt::Display for StreamMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "version: {}/{}",
            self.library_version, self.file_version
        )?;
        writeln!(f, "class: {}", GridClass::from_u32(self.grid_class).as_str())?;
        writeln!(f, "compression: {}", compression_to_string(self.compression))?;
        writeln!(f, "half_float: {}", self.half_float)?;
        writeln!(f, "seekable: {}", self.seekable)?;
        writeln!(f, "delayed_load_meta: {}", self.delayed_load_meta)?;
        writeln!(f, "pass: {}", self.pass)?;
        writeln!(f, "counting_passes: {}", self.counting_passes)?;
        writeln!(f, "write_grid_stats_metadata: {}", self.write_grid_stats)?;
        if !self.aux_data.is_empty() {
            write!(f, "{}", self.aux_data)?;
        }
        if self.grid_metadata.meta_count() != 0 {
            writeln!(f, "grid_metadata:")?;
            write!(f, "{}", self.grid_metadata.str_indented("    "))?;
        }
        Ok(())
    }
}

impl fmt::Debug for StreamMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamMetadata {{ {self} }}")
    }
}
