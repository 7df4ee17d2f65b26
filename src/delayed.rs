//! Per-leaf metadata that lets a reader skip directly to any leaf buffer.
//!
//! When a grid is written, one mask-compression descriptor byte is recorded
//! per leaf, and, when zip or blosc compression is in effect, the exact
//! byte size of each compressed leaf buffer as it appears on disk.  A
//! reader streaming from a memory-mapped file uses the sizes to advance
//! past buffers it does not want to decompress yet.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// On-disk metadata type name for the delayed-load record.
pub const TYPE_NAME: &str = "__delayedload";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelayedLoadMetadata {
    mask: Vec<u8>,
    compressed_size: Vec<u64>,
}

impl DelayedLoadMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty(&self) -> bool {
        self.mask.is_empty() && self.compressed_size.is_empty()
    }

    pub fn clear(&mut self) {
        self.mask.clear();
        self.compressed_size.clear();
    }

    pub fn resize_mask(&mut self, leaf_count: usize) {
        self.mask.resize(leaf_count, 0);
    }

    pub fn resize_compressed_size(&mut self, leaf_count: usize) {
        self.compressed_size.resize(leaf_count, 0);
    }

    pub fn set_mask(&mut self, leaf: usize, value: u8) {
        self.mask[leaf] = value;
    }

    pub fn mask(&self, leaf: usize) -> Option<u8> {
        self.mask.get(leaf).copied()
    }

    pub fn set_compressed_size(&mut self, leaf: usize, size: u64) {
        self.compressed_size[leaf] = size;
    }

    /// The on-disk byte size of the given leaf's buffer, including the
    /// eight-byte length prefix, if sizes were recorded.
    pub fn compressed_size(&self, leaf: usize) -> Option<u64> {
        self.compressed_size.get(leaf).copied()
    }

    pub fn leaf_count(&self) -> usize {
        self.mask.len()
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.mask.len() as u32)?;
        w.write_all(&self.mask)?;
        if self.compressed_size.is_empty() {
            w.write_u8(0)?;
        } else {
            w.write_u8(1)?;
            for &size in &self.compressed_size {
                w.write_u64::<LittleEndian>(size)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        let count = r.read_u32::<LittleEndian>()? as usize;
        let mut mask = vec![0u8; count];
        r.read_exact(&mut mask)?;
        let mut compressed_size = Vec::new();
        if r.read_u8()? != 0 {
            compressed_size.reserve(count);
            for _ in 0..count {
                compressed_size.push(r.read_u64::<LittleEndian>()?);
            }
        }
        Ok(Self { mask, compressed_size })
    }

    /// Serialized byte size, used for the metadata framing.
    pub fn byte_size(&self) -> usize {
        4 + self.mask.len() + 1 + 8 * self.compressed_size.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_sizes() {
        let mut meta = DelayedLoadMetadata::new();
        meta.resize_mask(3);
        meta.resize_compressed_size(3);
        meta.set_mask(0, 3);
        meta.set_mask(2, 6);
        meta.set_compressed_size(1, 4096);

        let mut buf = Vec::new();
        meta.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), meta.byte_size());

        let out = DelayedLoadMetadata::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(out, meta);
        assert_eq!(out.compressed_size(1), Some(4096));
    }

    #[test]
    fn round_trip_mask_only() {
        let mut meta = DelayedLoadMetadata::new();
        meta.resize_mask(2);
        let mut buf = Vec::new();
        meta.write_to(&mut buf).unwrap();
        let out = DelayedLoadMetadata::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(out.compressed_size(0), None);
        assert_eq!(out.leaf_count(), 2);
    }
}
