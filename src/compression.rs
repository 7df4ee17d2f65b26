//! Voxel buffer compression.
//!
//! Two independent layers combine here.  Active-mask compression drops
//! inactive voxel values that can be reconstructed from the value mask and
//! at most two representative values; the surviving values are then
//! optionally run through a byte-stream codec (zip or blosc).  Codec output
//! is written with a signed 64-bit length prefix; a negative length marks
//! an incompressible buffer stored raw.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::mask::NodeMask;
use crate::value::{deserialize_values, serialize_values, ValueType};

pub const COMPRESS_NONE: u32 = 0;
pub const COMPRESS_ZIP: u32 = 0x1;
pub const COMPRESS_ACTIVE_MASK: u32 = 0x2;
pub const COMPRESS_BLOSC: u32 = 0x4;

// Mask-compression descriptor bytes, one per leaf buffer.
pub const NO_MASK_OR_ALL_VALS: u8 = 0;
pub const NO_MASK_AND_MINUS_BG: u8 = 1;
pub const NO_MASK_AND_ONE_INACTIVE_VAL: u8 = 2;
pub const MASK_AND_NO_INACTIVE_VALS: u8 = 3;
pub const MASK_AND_ONE_INACTIVE_VAL: u8 = 4;
pub const MASK_AND_TWO_INACTIVE_VALS: u8 = 5;
pub const NO_MASK_AND_ALL_VALS: u8 = 6;

/// Human-readable rendering of a compression flag set.
pub fn compression_to_string(flags: u32) -> String {
    if flags == COMPRESS_NONE {
        return "none".to_owned();
    }
    let mut descr = String::new();
    if flags & COMPRESS_ZIP != 0 {
        descr.push_str("zip + ");
    }
    if flags & COMPRESS_BLOSC != 0 {
        descr.push_str("blosc + ");
    }
    if flags & COMPRESS_ACTIVE_MASK != 0 {
        descr.push_str("active values + ");
    }
    descr.truncate(descr.len().saturating_sub(3));
    descr
}

// ── Codecs ───────────────────────────────────────────────────────────────────

#[cfg(feature = "zip")]
fn zip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

#[cfg(not(feature = "zip"))]
fn zip_compress(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::Compression("zip support is not compiled in".into()))
}

#[cfg(feature = "zip")]
fn zip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(not(feature = "zip"))]
fn zip_decompress(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::Compression("zip support is not compiled in".into()))
}

#[cfg(feature = "blosc")]
fn blosc_compress(data: &[u8]) -> Result<Vec<u8>> {
    let ctx = blosc::Context::new();
    Ok(ctx.compress(data).into())
}

#[cfg(not(feature = "blosc"))]
fn blosc_compress(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::Compression("blosc support is not compiled in".into()))
}

#[cfg(feature = "blosc")]
fn blosc_decompress(data: &[u8]) -> Result<Vec<u8>> {
    unsafe { blosc::decompress_bytes(data) }
        .map_err(|_| Error::Compression("blosc decompression failed".into()))
}

#[cfg(not(feature = "blosc"))]
fn blosc_decompress(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::Compression("blosc support is not compiled in".into()))
}

fn codec_compress(data: &[u8], flags: u32) -> Result<Vec<u8>> {
    if flags & COMPRESS_BLOSC != 0 {
        blosc_compress(data)
    } else {
        zip_compress(data)
    }
}

fn codec_decompress(data: &[u8], flags: u32) -> Result<Vec<u8>> {
    if flags & COMPRESS_BLOSC != 0 {
        blosc_decompress(data)
    } else {
        zip_decompress(data)
    }
}

// ── Mask compression ─────────────────────────────────────────────────────────

/// Analysis of one leaf buffer's inactive values, deciding how many of its
/// values actually need to be stored.
#[derive(Debug, Clone)]
pub struct MaskCompress<T> {
    pub metadata: u8,
    /// Representative inactive values; `[0]` is meaningful for the
    /// one-value and two-value cases, `[1]` only for the two-value case.
    pub inactive: [T; 2],
    /// For the two-value case, set bits mark inactive voxels holding
    /// `inactive[1]` rather than `inactive[0]`.
    pub selection: Option<NodeMask>,
}

impl<T: ValueType> MaskCompress<T> {
    pub fn analyze(value_mask: &NodeMask, values: &[T], background: T, flags: u32) -> Self {
        let none = Self {
            metadata: NO_MASK_OR_ALL_VALS,
            inactive: [T::default(); 2],
            selection: None,
        };

        if flags & COMPRESS_ACTIVE_MASK == 0 || value_mask.is_full() {
            return none;
        }

        // Collect up to three distinct inactive values.
        let mut distinct: Vec<T> = Vec::with_capacity(3);
        for i in value_mask.iter_off() {
            let v = values[i];
            if !distinct.contains(&v) {
                distinct.push(v);
                if distinct.len() > 2 {
                    break;
                }
            }
        }

        match distinct.len() {
            0 => none,
            1 if distinct[0] == background => Self {
                metadata: MASK_AND_NO_INACTIVE_VALS,
                inactive: [background; 2],
                selection: None,
            },
            1 => Self {
                metadata: MASK_AND_ONE_INACTIVE_VAL,
                inactive: [distinct[0], T::default()],
                selection: None,
            },
            2 => {
                let mut selection = NodeMask::new();
                for i in value_mask.iter_off() {
                    if values[i] == distinct[1] {
                        selection.set_on(i);
                    }
                }
                Self {
                    metadata: MASK_AND_TWO_INACTIVE_VALS,
                    inactive: [distinct[0], distinct[1]],
                    selection: Some(selection),
                }
            }
            // Too many distinct inactive values to mask-compress.
            _ => Self {
                metadata: NO_MASK_AND_ALL_VALS,
                inactive: [T::default(); 2],
                selection: None,
            },
        }
    }

    /// Whether only active values are stored for this metadata byte.
    pub fn stores_active_only(metadata: u8) -> bool {
        matches!(
            metadata,
            MASK_AND_NO_INACTIVE_VALS | MASK_AND_ONE_INACTIVE_VAL | MASK_AND_TWO_INACTIVE_VALS
        )
    }

    /// The values that survive mask compression, in bit order.
    pub fn select(metadata: u8, value_mask: &NodeMask, values: &[T]) -> Vec<T> {
        if Self::stores_active_only(metadata) {
            value_mask.iter_on().map(|i| values[i]).collect()
        } else {
            values.to_vec()
        }
    }
}

// ── Codec framing ────────────────────────────────────────────────────────────

/// Write a run of values through the codec selected by `flags`.
///
/// With zip or blosc enabled the payload carries a signed 64-bit length
/// prefix; a buffer that does not shrink under compression is stored raw
/// with a negated length.  Without a codec the values are written bare.
pub fn write_compressed_values<W, T>(w: &mut W, values: &[T], half: bool, flags: u32) -> Result<()>
where
    W: Write + ?Sized,
    T: ValueType,
{
    let raw = serialize_values(values, half);
    if flags & (COMPRESS_ZIP | COMPRESS_BLOSC) != 0 {
        let compressed = codec_compress(&raw, flags)?;
        if compressed.len() < raw.len() {
            w.write_i64::<LittleEndian>(compressed.len() as i64)?;
            w.write_all(&compressed)?;
        } else {
            w.write_i64::<LittleEndian>(-(raw.len() as i64))?;
            w.write_all(&raw)?;
        }
    } else {
        w.write_all(&raw)?;
    }
    Ok(())
}

/// Read back exactly `count` values written by [`write_compressed_values`].
pub fn read_compressed_values<R, T>(r: &mut R, count: usize, half: bool, flags: u32) -> Result<Vec<T>>
where
    R: Read + ?Sized,
    T: ValueType,
{
    if flags & (COMPRESS_ZIP | COMPRESS_BLOSC) != 0 {
        let len = r.read_i64::<LittleEndian>()?;
        if len < 0 {
            let mut raw = vec![0u8; (-len) as usize];
            r.read_exact(&mut raw)?;
            deserialize_values(&raw, count, half)
        } else {
            let mut compressed = vec![0u8; len as usize];
            r.read_exact(&mut compressed)?;
            let raw = codec_decompress(&compressed, flags)?;
            deserialize_values(&raw, count, half)
        }
    } else {
        let mut raw = vec![0u8; count * T::stored_size(half)];
        r.read_exact(&mut raw)?;
        deserialize_values(&raw, count, half)
    }
}

/// The payload byte count [`write_compressed_values`] would produce,
/// excluding the length prefix.
pub fn compressed_values_size<T: ValueType>(values: &[T], half: bool, flags: u32) -> Result<u64> {
    let raw = serialize_values(values, half);
    if flags & (COMPRESS_ZIP | COMPRESS_BLOSC) != 0 {
        let compressed = codec_compress(&raw, flags)?;
        Ok(compressed.len().min(raw.len()) as u64)
    } else {
        Ok(raw.len() as u64)
    }
}

/// Skip over a compressed-values payload without decoding it, returning
/// the number of bytes consumed including the length prefix.
pub fn skip_compressed_values<R, T>(r: &mut R, count: usize, half: bool, flags: u32) -> Result<u64>
where
    R: Read + ?Sized,
    T: ValueType,
{
    let payload = if flags & (COMPRESS_ZIP | COMPRESS_BLOSC) != 0 {
        let len = r.read_i64::<LittleEndian>()?;
        len.unsigned_abs()
    } else {
        (count * T::stored_size(half)) as u64
    };
    std::io::copy(&mut r.take(payload), &mut std::io::sink())?;
    let prefix = if flags & (COMPRESS_ZIP | COMPRESS_BLOSC) != 0 {
        8
    } else {
        0
    };
    Ok(prefix + payload)
}
