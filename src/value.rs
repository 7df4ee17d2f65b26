//! Voxel value types and their on-disk encodings.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use half::f16;
use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// A value storable in a grid's voxels.
///
/// The half flag selects 16-bit storage and is honored only by the
/// float-valued types; everything else ignores it.
pub trait ValueType:
    Copy + Default + PartialEq + Send + Sync + std::fmt::Debug + 'static
{
    /// Value type tag as it appears inside grid type names.
    const TYPE_NAME: &'static str;

    /// On-disk grid type tag.
    const TREE_TYPE_NAME: &'static str;

    /// Whether per-leaf delayed-load metadata may be recorded for grids of
    /// this value type.
    const DELAYED_LOAD_SUPPORTED: bool = false;

    fn stored_size(half: bool) -> usize;

    fn write_to<W: Write + ?Sized>(&self, w: &mut W, half: bool) -> io::Result<()>;

    fn read_from<R: Read + ?Sized>(r: &mut R, half: bool) -> io::Result<Self>;
}

impl ValueType for i32 {
    const TYPE_NAME: &'static str = "int32";
    const TREE_TYPE_NAME: &'static str = "Tree_int32_5_4_3";
    const DELAYED_LOAD_SUPPORTED: bool = true;

    fn stored_size(_half: bool) -> usize {
        4
    }

    fn write_to<W: Write + ?Sized>(&self, w: &mut W, _half: bool) -> io::Result<()> {
        w.write_i32::<LittleEndian>(*self)
    }

    fn read_from<R: Read + ?Sized>(r: &mut R, _half: bool) -> io::Result<Self> {
        r.read_i32::<LittleEndian>()
    }
}

impl ValueType for i64 {
    const TYPE_NAME: &'static str = "int64";
    const TREE_TYPE_NAME: &'static str = "Tree_int64_5_4_3";
    const DELAYED_LOAD_SUPPORTED: bool = true;

    fn stored_size(_half: bool) -> usize {
        8
    }

    fn write_to<W: Write + ?Sized>(&self, w: &mut W, _half: bool) -> io::Result<()> {
        w.write_i64::<LittleEndian>(*self)
    }

    fn read_from<R: Read + ?Sized>(r: &mut R, _half: bool) -> io::Result<Self> {
        r.read_i64::<LittleEndian>()
    }
}

impl ValueType for f32 {
    const TYPE_NAME: &'static str = "float";
    const TREE_TYPE_NAME: &'static str = "Tree_float_5_4_3";
    const DELAYED_LOAD_SUPPORTED: bool = true;

    fn stored_size(half: bool) -> usize {
        if half {
            2
        } else {
            4
        }
    }

    fn write_to<W: Write + ?Sized>(&self, w: &mut W, half: bool) -> io::Result<()> {
        if half {
            w.write_u16::<LittleEndian>(f16::from_f32(*self).to_bits())
        } else {
            w.write_f32::<LittleEndian>(*self)
        }
    }

    fn read_from<R: Read + ?Sized>(r: &mut R, half: bool) -> io::Result<Self> {
        if half {
            Ok(f16::from_bits(r.read_u16::<LittleEndian>()?).to_f32())
        } else {
            r.read_f32::<LittleEndian>()
        }
    }
}

impl ValueType for f64 {
    const TYPE_NAME: &'static str = "double";
    const TREE_TYPE_NAME: &'static str = "Tree_double_5_4_3";
    const DELAYED_LOAD_SUPPORTED: bool = true;

    fn stored_size(_half: bool) -> usize {
        8
    }

    fn write_to<W: Write + ?Sized>(&self, w: &mut W, _half: bool) -> io::Result<()> {
        w.write_f64::<LittleEndian>(*self)
    }

    fn read_from<R: Read + ?Sized>(r: &mut R, _half: bool) -> io::Result<Self> {
        r.read_f64::<LittleEndian>()
    }
}

impl ValueType for [i32; 3] {
    const TYPE_NAME: &'static str = "vec3i";
    const TREE_TYPE_NAME: &'static str = "Tree_vec3i_5_4_3";
    const DELAYED_LOAD_SUPPORTED: bool = true;

    fn stored_size(_half: bool) -> usize {
        12
    }

    fn write_to<W: Write + ?Sized>(&self, w: &mut W, _half: bool) -> io::Result<()> {
        for c in self {
            w.write_i32::<LittleEndian>(*c)?;
        }
        Ok(())
    }

    fn read_from<R: Read + ?Sized>(r: &mut R, _half: bool) -> io::Result<Self> {
        let mut v = [0i32; 3];
        for c in &mut v {
            *c = r.read_i32::<LittleEndian>()?;
        }
        Ok(v)
    }
}

impl ValueType for [f32; 3] {
    const TYPE_NAME: &'static str = "vec3s";
    const TREE_TYPE_NAME: &'static str = "Tree_vec3s_5_4_3";
    const DELAYED_LOAD_SUPPORTED: bool = true;

    fn stored_size(half: bool) -> usize {
        if half {
            6
        } else {
            12
        }
    }

    fn write_to<W: Write + ?Sized>(&self, w: &mut W, half: bool) -> io::Result<()> {
        for c in self {
            c.write_to(w, half)?;
        }
        Ok(())
    }

    fn read_from<R: Read + ?Sized>(r: &mut R, half: bool) -> io::Result<Self> {
        let mut v = [0f32; 3];
        for c in &mut v {
            *c = f32::read_from(r, half)?;
        }
        Ok(v)
    }
}

impl ValueType for [f64; 3] {
    const TYPE_NAME: &'static str = "vec3d";
    const TREE_TYPE_NAME: &'static str = "Tree_vec3d_5_4_3";
    const DELAYED_LOAD_SUPPORTED: bool = true;

    fn stored_size(_half: bool) -> usize {
        24
    }

    fn write_to<W: Write + ?Sized>(&self, w: &mut W, _half: bool) -> io::Result<()> {
        for c in self {
            w.write_f64::<LittleEndian>(*c)?;
        }
        Ok(())
    }

    fn read_from<R: Read + ?Sized>(r: &mut R, _half: bool) -> io::Result<Self> {
        let mut v = [0f64; 3];
        for c in &mut v {
            *c = r.read_f64::<LittleEndian>()?;
        }
        Ok(v)
    }
}

/// Serialize a run of values into a byte buffer.
pub fn serialize_values<T: ValueType>(values: &[T], half: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::stored_size(half));
    for v in values {
        // Writing into a Vec cannot fail.
        v.write_to(&mut out, half).expect("vec write");
    }
    out
}

/// Decode exactly `count` values from a byte buffer.
pub fn deserialize_values<T: ValueType>(bytes: &[u8], count: usize, half: bool) -> Result<Vec<T>> {
    let expected = count * T::stored_size(half);
    if bytes.len() != expected {
        return Err(Error::InvalidData(format!(
            "expected {expected} bytes of voxel data, got {}",
            bytes.len()
        )));
    }
    let mut r = bytes;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(T::read_from(&mut r, half)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_full_and_half_round_trip() {
        let vals = [0.0f32, 1.5, -2.25, 1000.0];
        let full = serialize_values(&vals, false);
        assert_eq!(full.len(), 16);
        let out: Vec<f32> = deserialize_values(&full, 4, false).unwrap();
        assert_eq!(out, vals);

        let half = serialize_values(&vals, true);
        assert_eq!(half.len(), 8);
        let out: Vec<f32> = deserialize_values(&half, 4, true).unwrap();
        // These values are exactly representable in 16 bits.
        assert_eq!(out, vals);
    }

    #[test]
    fn vec3_stored_sizes() {
        assert_eq!(<[f32; 3]>::stored_size(true), 6);
        assert_eq!(<[f32; 3]>::stored_size(false), 12);
        assert_eq!(<[f64; 3]>::stored_size(true), 24);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let bytes = [0u8; 7];
        assert!(deserialize_values::<i32>(&bytes, 2, false).is_err());
    }
}
