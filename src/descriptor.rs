//! Per-grid on-disk records.
//!
//! A descriptor names a grid, its type tag and, for instances, the grid
//! whose tree it shares.  Three byte offsets follow the header so that a
//! seekable reader can jump straight to a grid's metadata, its voxel
//! buffers, or the next grid.  Names are disambiguated with a numeric
//! suffix behind an ASCII "record separator" character, which cannot
//! appear in user-facing names.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Seek, SeekFrom};

use crate::error::Result;
use crate::grid::{create_grid, AnyGrid};
use crate::metadata::{read_name, write_name};
use crate::stream::{get_format_version, InStream, OutStream};
use crate::version::FILE_VERSION_GRID_INSTANCING;

/// Separates a grid name from its disambiguating suffix.
pub const SEPARATOR: char = '\x1e';

/// Appended to a grid's type tag when its floats are stored in 16 bits.
pub const HALF_FLOAT_TYPENAME_SUFFIX: &str = "_HalfFloat";

#[derive(Debug, Clone, Default)]
pub struct GridDescriptor {
    unique_name: String,
    grid_type: String,
    instance_parent_name: String,
    save_float_as_half: bool,
    grid_pos: u64,
    block_pos: u64,
    end_pos: u64,
}

impl GridDescriptor {
    pub fn new(unique_name: String, grid_type: String, save_float_as_half: bool) -> Self {
        Self {
            unique_name,
            grid_type,
            save_float_as_half,
            ..Self::default()
        }
    }

    /// The name as written to the file, suffix included.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// The user-facing name, with any disambiguating suffix removed.
    pub fn grid_name(&self) -> String {
        Self::strip_suffix(&self.unique_name)
    }

    pub fn grid_type(&self) -> &str {
        &self.grid_type
    }

    pub fn save_float_as_half(&self) -> bool {
        self.save_float_as_half
    }

    pub fn is_instance(&self) -> bool {
        !self.instance_parent_name.is_empty()
    }

    pub fn instance_parent_name(&self) -> &str {
        &self.instance_parent_name
    }

    pub fn set_instance_parent_name(&mut self, name: &str) {
        self.instance_parent_name = name.to_owned();
    }

    pub fn grid_pos(&self) -> u64 {
        self.grid_pos
    }

    pub fn block_pos(&self) -> u64 {
        self.block_pos
    }

    pub fn end_pos(&self) -> u64 {
        self.end_pos
    }

    pub fn set_grid_pos(&mut self, pos: u64) {
        self.grid_pos = pos;
    }

    pub fn set_block_pos(&mut self, pos: u64) {
        self.block_pos = pos;
    }

    pub fn set_end_pos(&mut self, pos: u64) {
        self.end_pos = pos;
    }

    // ── Name helpers ─────────────────────────────────────────────────────────

    pub fn add_suffix(name: &str, n: u32) -> String {
        format!("{name}{SEPARATOR}{n}")
    }

    pub fn strip_suffix(name: &str) -> String {
        match name.find(SEPARATOR) {
            Some(idx) => name[..idx].to_owned(),
            None => name.to_owned(),
        }
    }

    /// Render a unique name for display, `"name[N]"` for suffixed names.
    pub fn name_as_string(name: &str) -> String {
        match name.find(SEPARATOR) {
            Some(idx) => format!("{}[{}]", &name[..idx], &name[idx + 1..]),
            None => name.to_owned(),
        }
    }

    // ── Serialization ────────────────────────────────────────────────────────

    pub fn write_header(&self, os: &mut OutStream<'_>) -> Result<()> {
        write_name(os, &self.unique_name)?;

        let mut grid_type = self.grid_type.clone();
        if self.save_float_as_half {
            grid_type.push_str(HALF_FLOAT_TYPENAME_SUFFIX);
        }
        if self.is_instance() {
            grid_type.push(SEPARATOR);
        }
        write_name(os, &grid_type)?;

        if self.is_instance() {
            write_name(os, &self.instance_parent_name)?;
        }
        Ok(())
    }

    /// Write the three grid offsets at the current position.
    pub fn write_stream_pos(&self, os: &mut OutStream<'_>) -> Result<()> {
        os.write_i64::<LittleEndian>(self.grid_pos as i64)?;
        os.write_i64::<LittleEndian>(self.block_pos as i64)?;
        os.write_i64::<LittleEndian>(self.end_pos as i64)?;
        Ok(())
    }

    pub fn seek_to_end(&self, os: &mut OutStream<'_>) -> Result<()> {
        os.seek(SeekFrom::Start(self.end_pos))?;
        Ok(())
    }

    /// Read a descriptor and instantiate its grid from the type registry.
    pub fn read(is: &mut InStream<'_>) -> Result<(Self, Box<dyn AnyGrid>)> {
        let unique_name = read_name(is)?;

        let mut grid_type = read_name(is)?;
        let is_instance = if grid_type.ends_with(SEPARATOR) {
            grid_type.pop();
            true
        } else {
            false
        };
        let save_float_as_half = if let Some(stripped) =
            grid_type.strip_suffix(HALF_FLOAT_TYPENAME_SUFFIX)
        {
            grid_type = stripped.to_owned();
            true
        } else {
            false
        };

        let instance_parent_name =
            if is_instance && get_format_version(is) >= FILE_VERSION_GRID_INSTANCING {
                read_name(is)?
            } else {
                String::new()
            };

        let mut gd = Self {
            unique_name,
            grid_type,
            instance_parent_name,
            save_float_as_half,
            ..Self::default()
        };

        gd.grid_pos = is.read_i64::<LittleEndian>()? as u64;
        gd.block_pos = is.read_i64::<LittleEndian>()? as u64;
        gd.end_pos = is.read_i64::<LittleEndian>()? as u64;

        let mut grid = create_grid(&gd.grid_type)?;
        grid.set_save_float_as_half(gd.save_float_as_half);
        Ok((gd, grid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{set_version, StreamMetadata};
    use crate::version::{VersionId, FILE_VERSION};
    use std::io::Cursor;

    #[test]
    fn suffix_helpers() {
        let suffixed = GridDescriptor::add_suffix("density", 2);
        assert_eq!(suffixed, format!("density{SEPARATOR}2"));
        assert_eq!(GridDescriptor::strip_suffix(&suffixed), "density");
        assert_eq!(GridDescriptor::strip_suffix("plain"), "plain");
        assert_eq!(GridDescriptor::name_as_string(&suffixed), "density[2]");
        assert_eq!(GridDescriptor::name_as_string("plain"), "plain");
    }

    fn round_trip(gd: &GridDescriptor) -> (GridDescriptor, Box<dyn AnyGrid>) {
        crate::grid::register_standard_types();
        let mut buf = Cursor::new(Vec::new());
        let mut os = OutStream::new(&mut buf);
        gd.write_header(&mut os).unwrap();
        gd.write_stream_pos(&mut os).unwrap();
        drop(os);

        let bytes = buf.into_inner();
        let mut is = InStream::new(bytes.as_slice());
        crate::stream::set_stream_metadata(&mut is, StreamMetadata::new(), false);
        set_version(&mut is, VersionId::CURRENT, FILE_VERSION);
        GridDescriptor::read(&mut is).unwrap()
    }

    #[test]
    fn header_round_trip() {
        let mut gd = GridDescriptor::new(
            "density".into(),
            "Tree_float_5_4_3".into(),
            true,
        );
        gd.set_grid_pos(100);
        gd.set_block_pos(200);
        gd.set_end_pos(300);

        let (out, grid) = round_trip(&gd);
        assert_eq!(out.unique_name(), "density");
        assert_eq!(out.grid_type(), "Tree_float_5_4_3");
        assert!(out.save_float_as_half());
        assert!(!out.is_instance());
        assert_eq!(out.grid_pos(), 100);
        assert_eq!(out.block_pos(), 200);
        assert_eq!(out.end_pos(), 300);
        assert!(grid.save_float_as_half());
    }

    #[test]
    fn instance_header_round_trip() {
        let mut gd = GridDescriptor::new(
            GridDescriptor::add_suffix("density", 1),
            "Tree_vec3s_5_4_3".into(),
            false,
        );
        gd.set_instance_parent_name(&GridDescriptor::add_suffix("density", 0));

        let (out, _) = round_trip(&gd);
        assert!(out.is_instance());
        assert_eq!(out.grid_name(), "density");
        assert_eq!(
            out.instance_parent_name(),
            GridDescriptor::add_suffix("density", 0)
        );
    }

    #[test]
    fn unknown_grid_type_is_rejected() {
        let gd = GridDescriptor::new("g".into(), "Tree_unheard_of".into(), false);
        crate::grid::register_standard_types();
        let mut buf = Cursor::new(Vec::new());
        let mut os = OutStream::new(&mut buf);
        gd.write_header(&mut os).unwrap();
        gd.write_stream_pos(&mut os).unwrap();
        drop(os);

        let bytes = buf.into_inner();
        let mut is = InStream::new(bytes.as_slice());
        set_version(&mut is, VersionId::CURRENT, FILE_VERSION);
        assert!(matches!(
            GridDescriptor::read(&mut is),
            Err(crate::error::Error::UnregisteredGridType(_))
        ));
    }
}
