//! A sparse voxel tree: a flat set of 8 x 8 x 8 leaf nodes over a uniform
//! background value.
//!
//! Topology (leaf origins and value masks) and voxel buffers are
//! serialized in two separate passes so that a reader can reconstruct the
//! tree's shape without touching any voxel data.  When the input stream is
//! backed by a memory-mapped file, buffers are not decoded at all: each
//! leaf records its byte offset into the map and decodes on first access,
//! from any thread, even after the archive that produced it is gone.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::compression::{
    read_compressed_values, skip_compressed_values, write_compressed_values, MaskCompress,
    COMPRESS_BLOSC, COMPRESS_ZIP, MASK_AND_ONE_INACTIVE_VAL, MASK_AND_TWO_INACTIVE_VALS,
    MASK_AND_NO_INACTIVE_VALS, NO_MASK_AND_ALL_VALS, NO_MASK_OR_ALL_VALS,
};
use crate::coord::{Coord, CoordBBox};
use crate::delayed::DelayedLoadMetadata;
use crate::error::{Error, Result};
use crate::mapped_file::MappedFile;
use crate::mask::NodeMask;
use crate::metadata::MetaValue;
use crate::stream::{
    get_data_compression, get_mapped_file, get_stream_metadata, get_stream_metadata_mut,
    set_grid_background_value, InStream, OutStream,
};
use crate::value::ValueType;

pub const LEAF_DIM: i32 = 8;
pub const LEAF_SIZE: usize = 512;

// ── Leaf buffers ─────────────────────────────────────────────────────────────

/// Where a leaf's compressed buffer lives in a mapped file, captured at
/// read time so decoding can happen later.
#[derive(Clone)]
struct DelayedBuffer<T> {
    file: Arc<MappedFile>,
    /// Absolute byte offset of the buffer record in the map.
    offset: u64,
    compression: u32,
    half: bool,
    background: T,
}

impl<T: ValueType> DelayedBuffer<T> {
    fn load(&self, value_mask: &NodeMask) -> Result<Vec<T>> {
        let bytes = self.file.bytes();
        let start = self.offset as usize;
        if start > bytes.len() {
            return Err(Error::InvalidData(format!(
                "leaf buffer offset {start} beyond mapped range"
            )));
        }
        let mut r = &bytes[start..];
        read_buffer_body(
            &mut r,
            value_mask,
            self.background,
            self.half,
            self.compression,
        )
    }
}

#[derive(Clone)]
enum LeafBuffer<T> {
    Loaded(Vec<T>),
    Delayed(DelayedBuffer<T>),
}

// ── Leaf nodes ───────────────────────────────────────────────────────────────

pub struct LeafNode<T: ValueType> {
    origin: Coord,
    value_mask: NodeMask,
    buffer: RwLock<LeafBuffer<T>>,
}

impl<T: ValueType> LeafNode<T> {
    pub fn new(origin: Coord, background: T) -> Self {
        Self {
            origin,
            value_mask: NodeMask::new(),
            buffer: RwLock::new(LeafBuffer::Loaded(vec![background; LEAF_SIZE])),
        }
    }

    pub fn origin(&self) -> Coord {
        self.origin
    }

    pub fn value_mask(&self) -> &NodeMask {
        &self.value_mask
    }

    pub fn bbox(&self) -> CoordBBox {
        CoordBBox::new(
            self.origin,
            self.origin.offset_by(LEAF_DIM - 1, LEAF_DIM - 1, LEAF_DIM - 1),
        )
    }

    /// Whether the voxel buffer is decoded and resident.
    pub fn is_loaded(&self) -> bool {
        matches!(&*self.buffer.read(), LeafBuffer::Loaded(_))
    }

    /// Decode the buffer now if it is delayed.
    pub fn load(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let mut guard = self.buffer.write();
        if let LeafBuffer::Delayed(delayed) = &*guard {
            let values = delayed.load(&self.value_mask)?;
            *guard = LeafBuffer::Loaded(values);
        }
        Ok(())
    }

    pub fn with_values<R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        self.load()?;
        match &*self.buffer.read() {
            LeafBuffer::Loaded(values) => Ok(f(values)),
            LeafBuffer::Delayed(_) => {
                Err(Error::InvalidData("leaf buffer failed to load".into()))
            }
        }
    }

    pub fn value(&self, offset: usize) -> Result<T> {
        self.with_values(|values| values[offset])
    }

    fn set_value(&mut self, offset: usize, value: T) -> Result<()> {
        self.load()?;
        if let LeafBuffer::Loaded(values) = &mut *self.buffer.write() {
            values[offset] = value;
        }
        self.value_mask.set_on(offset);
        Ok(())
    }

    fn write_buffer(
        &self,
        w: &mut dyn Write,
        background: T,
        half: bool,
        flags: u32,
    ) -> Result<()> {
        self.with_values(|values| -> Result<()> {
            let mc = MaskCompress::analyze(&self.value_mask, values, background, flags);
            w.write_u8(mc.metadata)?;
            match mc.metadata {
                MASK_AND_ONE_INACTIVE_VAL => {
                    mc.inactive[0].write_to(w, half)?;
                }
                MASK_AND_TWO_INACTIVE_VALS => {
                    mc.inactive[0].write_to(w, half)?;
                    mc.inactive[1].write_to(w, half)?;
                    mc.selection.as_ref().unwrap().write_to(w)?;
                }
                _ => {}
            }
            let selected = MaskCompress::select(mc.metadata, &self.value_mask, values);
            write_compressed_values(w, &selected, half, flags)
        })?
    }

    fn read_buffer(
        &self,
        r: &mut dyn Read,
        background: T,
        half: bool,
        flags: u32,
    ) -> Result<()> {
        let values = read_buffer_body(r, &self.value_mask, background, half, flags)?;
        *self.buffer.write() = LeafBuffer::Loaded(values);
        Ok(())
    }
}

impl<T: ValueType> Clone for LeafNode<T> {
    fn clone(&self) -> Self {
        Self {
            origin: self.origin,
            value_mask: self.value_mask,
            buffer: RwLock::new(self.buffer.read().clone()),
        }
    }
}

impl<T: ValueType> PartialEq for LeafNode<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.origin != other.origin || self.value_mask != other.value_mask {
            return false;
        }
        let a = self.with_values(|v| v.to_vec());
        let b = other.with_values(|v| v.to_vec());
        matches!((a, b), (Ok(a), Ok(b)) if a == b)
    }
}

impl<T: ValueType> std::fmt::Debug for LeafNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafNode")
            .field("origin", &self.origin)
            .field("active", &self.value_mask.count_on())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Decode one leaf buffer record into a dense value array.
fn read_buffer_body<T: ValueType>(
    r: &mut (impl Read + ?Sized),
    value_mask: &NodeMask,
    background: T,
    half: bool,
    flags: u32,
) -> Result<Vec<T>> {
    let metadata = r.read_u8()?;
    let mut inactive = [background; 2];
    let mut selection = None;
    match metadata {
        NO_MASK_OR_ALL_VALS | NO_MASK_AND_ALL_VALS | MASK_AND_NO_INACTIVE_VALS => {}
        MASK_AND_ONE_INACTIVE_VAL => {
            inactive[0] = T::read_from(r, half)?;
        }
        MASK_AND_TWO_INACTIVE_VALS => {
            inactive[0] = T::read_from(r, half)?;
            inactive[1] = T::read_from(r, half)?;
            selection = Some(NodeMask::read_from(r)?);
        }
        other => {
            return Err(Error::InvalidData(format!(
                "unsupported mask compression metadata {other}"
            )));
        }
    }

    if MaskCompress::<T>::stores_active_only(metadata) {
        let active: Vec<T> =
            read_compressed_values(r, value_mask.count_on(), half, flags)?;
        let mut values = vec![background; LEAF_SIZE];
        if metadata == MASK_AND_ONE_INACTIVE_VAL {
            for i in value_mask.iter_off() {
                values[i] = inactive[0];
            }
        } else if metadata == MASK_AND_TWO_INACTIVE_VALS {
            let selection = selection.unwrap();
            for i in value_mask.iter_off() {
                values[i] = if selection.is_on(i) {
                    inactive[1]
                } else {
                    inactive[0]
                };
            }
        }
        for (slot, v) in value_mask.iter_on().zip(active) {
            values[slot] = v;
        }
        Ok(values)
    } else {
        read_compressed_values(r, LEAF_SIZE, half, flags)
    }
}

/// Advance past one leaf buffer record without decoding its payload.
///
/// When the record's on-disk size is known in advance (from delayed-load
/// metadata) the payload is skipped blindly; otherwise the length prefix
/// is parsed.
fn skip_buffer_body<T: ValueType>(
    r: &mut InStream<'_>,
    value_mask: &NodeMask,
    half: bool,
    flags: u32,
    known_size: Option<u64>,
) -> Result<()> {
    let metadata = r.read_u8()?;
    match metadata {
        MASK_AND_ONE_INACTIVE_VAL => {
            T::read_from(r, half)?;
        }
        MASK_AND_TWO_INACTIVE_VALS => {
            T::read_from(r, half)?;
            T::read_from(r, half)?;
            NodeMask::read_from(r)?;
        }
        _ => {}
    }
    if let Some(size) = known_size {
        io::copy(&mut r.by_ref().take(size), &mut io::sink())?;
    } else {
        let count = if MaskCompress::<T>::stores_active_only(metadata) {
            value_mask.count_on()
        } else {
            LEAF_SIZE
        };
        skip_compressed_values::<_, T>(r, count, half, flags)?;
    }
    Ok(())
}

// ── Trees ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Tree<T: ValueType> {
    background: T,
    leaves: BTreeMap<Coord, LeafNode<T>>,
}

impl<T: ValueType> Tree<T> {
    pub fn new(background: T) -> Self {
        Self {
            background,
            leaves: BTreeMap::new(),
        }
    }

    pub fn background(&self) -> T {
        self.background
    }

    fn leaf_origin(c: Coord) -> Coord {
        Coord::new(c.x & !(LEAF_DIM - 1), c.y & !(LEAF_DIM - 1), c.z & !(LEAF_DIM - 1))
    }

    fn leaf_offset(c: Coord) -> usize {
        (((c.x & 7) as usize) << 6) | (((c.y & 7) as usize) << 3) | ((c.z & 7) as usize)
    }

    /// Set a voxel's value and mark it active.
    pub fn set_value(&mut self, c: Coord, value: T) -> Result<()> {
        let origin = Self::leaf_origin(c);
        let background = self.background;
        let leaf = self
            .leaves
            .entry(origin)
            .or_insert_with(|| LeafNode::new(origin, background));
        leaf.set_value(Self::leaf_offset(c), value)
    }

    pub fn value(&self, c: Coord) -> Result<T> {
        match self.leaves.get(&Self::leaf_origin(c)) {
            Some(leaf) => leaf.value(Self::leaf_offset(c)),
            None => Ok(self.background),
        }
    }

    pub fn is_value_on(&self, c: Coord) -> bool {
        self.leaves
            .get(&Self::leaf_origin(c))
            .map(|leaf| leaf.value_mask().is_on(Self::leaf_offset(c)))
            .unwrap_or(false)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &LeafNode<T>> {
        self.leaves.values()
    }

    pub fn active_voxel_count(&self) -> u64 {
        self.leaves
            .values()
            .map(|l| l.value_mask().count_on() as u64)
            .sum()
    }

    pub fn eval_active_bbox(&self) -> CoordBBox {
        let mut bbox = CoordBBox::empty();
        for leaf in self.leaves.values() {
            for bit in leaf.value_mask().iter_on() {
                let c = leaf.origin().offset_by(
                    (bit >> 6) as i32,
                    ((bit >> 3) & 7) as i32,
                    (bit & 7) as i32,
                );
                bbox.expand(c);
            }
        }
        bbox
    }

    pub fn mem_usage(&self) -> u64 {
        let per_leaf =
            std::mem::size_of::<LeafNode<T>>() + LEAF_SIZE * std::mem::size_of::<T>();
        (std::mem::size_of::<Self>() + self.leaves.len() * per_leaf) as u64
    }

    /// Deactivate and reset every voxel outside `bbox`, dropping leaves
    /// that end up fully inactive.
    pub fn clip(&mut self, bbox: &CoordBBox) -> Result<()> {
        let origins: Vec<Coord> = self.leaves.keys().copied().collect();
        for origin in origins {
            let leaf = &self.leaves[&origin];
            if !bbox.intersects(&leaf.bbox()) {
                self.leaves.remove(&origin);
                continue;
            }
            let background = self.background;
            let leaf = self.leaves.get_mut(&origin).unwrap();
            let on: Vec<usize> = leaf.value_mask().iter_on().collect();
            for bit in on {
                let c = origin.offset_by(
                    (bit >> 6) as i32,
                    ((bit >> 3) & 7) as i32,
                    (bit & 7) as i32,
                );
                if !bbox.contains(c) {
                    leaf.set_value(bit, background)?;
                    leaf.value_mask.set_off(bit);
                }
            }
            if leaf.value_mask().is_off() {
                self.leaves.remove(&origin);
            }
        }
        Ok(())
    }

    // ── Serialization ────────────────────────────────────────────────────────

    pub fn write_topology(&self, os: &mut OutStream<'_>) -> Result<()> {
        self.background.write_to(os, false)?;
        os.write_u32::<LittleEndian>(self.leaves.len() as u32)?;
        for leaf in self.leaves.values() {
            leaf.origin().write_le(os)?;
            leaf.value_mask().write_to(os)?;
        }
        Ok(())
    }

    pub fn read_topology(&mut self, is: &mut InStream<'_>) -> Result<()> {
        self.background = T::read_from(is, false)?;
        set_grid_background_value(is, Some(Arc::new(self.background)));
        let count = is.read_u32::<LittleEndian>()?;
        self.leaves.clear();
        for _ in 0..count {
            let origin = Coord::read_le(is)?;
            let value_mask = NodeMask::read_from(is)?;
            let mut leaf = LeafNode::new(origin, self.background);
            leaf.value_mask = value_mask;
            self.leaves.insert(origin, leaf);
        }
        Ok(())
    }

    pub fn write_buffers(&self, os: &mut OutStream<'_>, half: bool) -> Result<()> {
        let flags = get_data_compression(os);
        for leaf in self.leaves.values() {
            leaf.write_buffer(os, self.background, half, flags)?;
        }
        Ok(())
    }

    pub fn read_buffers(
        &mut self,
        is: &mut InStream<'_>,
        half: bool,
        clip: Option<&CoordBBox>,
    ) -> Result<()> {
        let flags = get_data_compression(is);
        let mapped = get_mapped_file(is);
        let delay = mapped.is_some() && crate::archive::Archive::is_delayed_loading_enabled();

        // Sizes recorded at write time let delayed reads skip whole
        // buffers without parsing their length prefixes.
        let sizes: Option<DelayedLoadMetadata> = get_stream_metadata(is)
            .and_then(|m| m.grid_metadata().get(crate::grid::META_FILE_DELAYED_LOAD))
            .and_then(|v| match v {
                MetaValue::DelayedLoad(d) => Some(d.clone()),
                _ => None,
            });
        let compressed = flags & (COMPRESS_ZIP | COMPRESS_BLOSC) != 0;

        let mut leaf_index = get_stream_metadata(is).map(|m| m.leaf()).unwrap_or(0);
        let mut clipped: Vec<Coord> = Vec::new();

        for (&origin, leaf) in self.leaves.iter() {
            // Recorded sizes cover the length prefix and the payload.
            let known_size = if compressed {
                sizes
                    .as_ref()
                    .and_then(|s| s.compressed_size(leaf_index as usize))
                    .filter(|&s| s >= 8)
            } else {
                None
            };

            if let Some(clip_box) = clip {
                if !clip_box.intersects(&leaf.bbox()) {
                    skip_buffer_body::<T>(is, &leaf.value_mask, half, flags, known_size)?;
                    clipped.push(origin);
                    leaf_index += 1;
                    continue;
                }
            }

            if delay {
                let offset = is.position();
                skip_buffer_body::<T>(is, &leaf.value_mask, half, flags, known_size)?;
                *leaf.buffer.write() = LeafBuffer::Delayed(DelayedBuffer {
                    file: Arc::clone(mapped.as_ref().unwrap()),
                    offset,
                    compression: flags,
                    half,
                    background: self.background,
                });
            } else {
                leaf.read_buffer(is, self.background, half, flags)?;
            }
            leaf_index += 1;
        }

        if let Some(meta) = get_stream_metadata_mut(is) {
            meta.set_leaf(leaf_index);
        }
        for origin in clipped {
            self.leaves.remove(&origin);
        }
        Ok(())
    }
}

impl<T: ValueType> PartialEq for Tree<T> {
    fn eq(&self, other: &Self) -> bool {
        self.background == other.background && self.leaves == other.leaves
    }
}

impl<T: ValueType> std::fmt::Debug for Tree<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("background", &self.background)
            .field("leaves", &self.leaves.len())
            .finish()
    }
}
