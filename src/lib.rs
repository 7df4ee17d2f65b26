pub mod archive;
pub mod compression;
pub mod coord;
pub mod delayed;
pub mod descriptor;
pub mod error;
pub mod grid;
pub mod mapped_file;
pub mod mask;
pub mod metadata;
pub mod stream;
pub mod transform;
pub mod tree;
pub mod value;
pub mod version;

pub use archive::{Archive, Clip};
pub use coord::{BBoxd, Coord, CoordBBox};
pub use descriptor::GridDescriptor;
pub use error::{Error, Result};
pub use grid::{
    AnyGrid, DoubleGrid, FloatGrid, Grid, GridClass, Int32Grid, Int64Grid, VecType, Vec3DGrid,
    Vec3IGrid, Vec3SGrid,
};
pub use mapped_file::MappedFile;
pub use metadata::{MetaMap, MetaValue};
pub use stream::{InStream, OutStream, StreamMetadata};
pub use transform::Transform;

/// Register the built-in grid types.  Call once before reading archives.
pub fn initialize() {
    grid::register_standard_types();
}
