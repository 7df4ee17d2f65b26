//! File format and library version numbers.
//!
//! The file format version is written to every archive header and gates a
//! number of layout changes accumulated over the format's history.  The
//! named constants below mark the versions at which each change landed;
//! readers branch on them to stay compatible with older files.

use std::fmt;

/// Magic number at the start of every archive, `" BDV"` read little-endian.
pub const MAGIC: i64 = 0x56444220;

/// The file format version written by this library.
pub const FILE_VERSION: u32 = 224;

pub const LIBRARY_MAJOR_VERSION: u32 = 12;
pub const LIBRARY_MINOR_VERSION: u32 = 1;

// Format history.  Files older than ROOTNODE_MAP store a three-part
// version number instead of a single monotonic one.
pub const FILE_VERSION_ROOTNODE_MAP: u32 = 213;
pub const FILE_VERSION_INTERNALNODE_COMPRESSION: u32 = 214;
pub const FILE_VERSION_SIMPLIFIED_GRID_TYPENAME: u32 = 215;
pub const FILE_VERSION_GRID_INSTANCING: u32 = 216;
pub const FILE_VERSION_BOOL_LEAF_OPTIMIZATION: u32 = 217;
pub const FILE_VERSION_BOOST_UUID: u32 = 218;
pub const FILE_VERSION_NO_GRIDMAP: u32 = 219;
pub const FILE_VERSION_NEW_TRANSFORM: u32 = 219;
pub const FILE_VERSION_SELECTIVE_COMPRESSION: u32 = 220;
pub const FILE_VERSION_FLOAT_FRUSTUM_BBOX: u32 = 221;
pub const FILE_VERSION_NODE_MASK_COMPRESSION: u32 = 222;
pub const FILE_VERSION_BLOSC_COMPRESSION: u32 = 223;
pub const FILE_VERSION_POINT_INDEX_GRID: u32 = 223;
pub const FILE_VERSION_MULTIPASS_IO: u32 = 224;

/// A library version as stored in the archive header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionId {
    pub major: u32,
    pub minor: u32,
}

impl VersionId {
    pub const CURRENT: VersionId = VersionId {
        major: LIBRARY_MAJOR_VERSION,
        minor: LIBRARY_MINOR_VERSION,
    };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
