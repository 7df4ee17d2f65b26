//! Grid transforms: index space to world space.
//!
//! Only uniform-scale-plus-translation maps are supported.  The map is
//! serialized as a name tag followed by its parameters, so other map kinds
//! can be added without changing the framing.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::coord::{BBoxd, Coord, CoordBBox};
use crate::error::{Error, Result};
use crate::metadata::{read_name, write_name};

const MAP_TYPE: &str = "UniformScaleTranslateMap";

#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    voxel_size: f64,
    translation: [f64; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            voxel_size: 1.0,
            translation: [0.0; 3],
        }
    }
}

impl Transform {
    pub fn linear(voxel_size: f64) -> Self {
        Self {
            voxel_size,
            translation: [0.0; 3],
        }
    }

    pub fn with_translation(voxel_size: f64, translation: [f64; 3]) -> Self {
        Self {
            voxel_size,
            translation,
        }
    }

    pub fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    pub fn index_to_world(&self, c: Coord) -> [f64; 3] {
        [
            c.x as f64 * self.voxel_size + self.translation[0],
            c.y as f64 * self.voxel_size + self.translation[1],
            c.z as f64 * self.voxel_size + self.translation[2],
        ]
    }

    pub fn world_to_index(&self, p: [f64; 3]) -> [f64; 3] {
        [
            (p[0] - self.translation[0]) / self.voxel_size,
            (p[1] - self.translation[1]) / self.voxel_size,
            (p[2] - self.translation[2]) / self.voxel_size,
        ]
    }

    /// Convert a world-space box to the index-space box of voxels whose
    /// centers it contains.
    pub fn world_to_index_node_centered(&self, b: &BBoxd) -> CoordBBox {
        let lo = self.world_to_index(b.min);
        let hi = self.world_to_index(b.max);
        CoordBBox::new(
            Coord::new(
                lo[0].round() as i32,
                lo[1].round() as i32,
                lo[2].round() as i32,
            ),
            Coord::new(
                hi[0].round() as i32,
                hi[1].round() as i32,
                hi[2].round() as i32,
            ),
        )
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        write_name(w, MAP_TYPE)?;
        w.write_f64::<LittleEndian>(self.voxel_size)?;
        for t in &self.translation {
            w.write_f64::<LittleEndian>(*t)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let map_type = read_name(r)?;
        if map_type != MAP_TYPE {
            return Err(Error::InvalidData(format!(
                "unsupported map type \"{map_type}\""
            )));
        }
        let voxel_size = r.read_f64::<LittleEndian>()?;
        let mut translation = [0f64; 3];
        for t in &mut translation {
            *t = r.read_f64::<LittleEndian>()?;
        }
        Ok(Self {
            voxel_size,
            translation,
        })
    }
}
