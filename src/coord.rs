//! Integer voxel coordinates and bounding boxes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// A signed integer coordinate in voxel index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Coord {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn as_vec3i(&self) -> [i32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn offset_by(&self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    pub fn write_le<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        w.write_i32::<LittleEndian>(self.x)?;
        w.write_i32::<LittleEndian>(self.y)?;
        w.write_i32::<LittleEndian>(self.z)?;
        Ok(())
    }

    pub fn read_le<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        let x = r.read_i32::<LittleEndian>()?;
        let y = r.read_i32::<LittleEndian>()?;
        let z = r.read_i32::<LittleEndian>()?;
        Ok(Self::new(x, y, z))
    }
}

/// An axis-aligned box of voxel coordinates, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordBBox {
    pub min: Coord,
    pub max: Coord,
}

impl CoordBBox {
    pub fn new(min: Coord, max: Coord) -> Self {
        Self { min, max }
    }

    /// An inverted box that expands to contain the first coordinate added.
    pub fn empty() -> Self {
        Self {
            min: Coord::new(i32::MAX, i32::MAX, i32::MAX),
            max: Coord::new(i32::MIN, i32::MIN, i32::MIN),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn expand(&mut self, c: Coord) {
        self.min.x = self.min.x.min(c.x);
        self.min.y = self.min.y.min(c.y);
        self.min.z = self.min.z.min(c.z);
        self.max.x = self.max.x.max(c.x);
        self.max.y = self.max.y.max(c.y);
        self.max.z = self.max.z.max(c.z);
    }

    pub fn contains(&self, c: Coord) -> bool {
        c.x >= self.min.x
            && c.x <= self.max.x
            && c.y >= self.min.y
            && c.y <= self.max.y
            && c.z >= self.min.z
            && c.z <= self.max.z
    }

    /// True if the two boxes share any coordinate.
    pub fn intersects(&self, other: &CoordBBox) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }
}

/// An axis-aligned box in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBoxd {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BBoxd {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_expand_and_contains() {
        let mut b = CoordBBox::empty();
        assert!(b.is_empty());
        b.expand(Coord::new(1, 2, 3));
        b.expand(Coord::new(-4, 0, 9));
        assert_eq!(b.min, Coord::new(-4, 0, 3));
        assert_eq!(b.max, Coord::new(1, 2, 9));
        assert!(b.contains(Coord::new(0, 1, 5)));
        assert!(!b.contains(Coord::new(2, 1, 5)));
    }

    #[test]
    fn coord_ordering_is_lexicographic() {
        assert!(Coord::new(0, 0, 1) < Coord::new(0, 1, 0));
        assert!(Coord::new(0, 1, 0) < Coord::new(1, 0, 0));
    }
}
