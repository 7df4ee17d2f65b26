//! Typed, string-keyed metadata maps and their archive serialization.
//!
//! A metadata map is written as a count followed by name/type/value tuples.
//! Values of unrecognized types are preserved verbatim as raw bytes so that
//! maps written by a newer library round-trip through an older one.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};

use crate::delayed::{self, DelayedLoadMetadata};
use crate::error::Result;

// ── Name I/O ─────────────────────────────────────────────────────────────────

pub fn write_name<W: Write + ?Sized>(w: &mut W, name: &str) -> io::Result<()> {
    w.write_u32::<LittleEndian>(name.len() as u32)?;
    w.write_all(name.as_bytes())?;
    Ok(())
}

pub fn read_name<R: Read + ?Sized>(r: &mut R) -> io::Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

// ── Values ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Vec3i([i32; 3]),
    Vec3s([f32; 3]),
    Vec3d([f64; 3]),
    DelayedLoad(DelayedLoadMetadata),
    /// A value of a type this library does not know, kept as raw bytes.
    Unknown { type_name: String, bytes: Vec<u8> },
}

impl MetaValue {
    pub fn type_name(&self) -> &str {
        match self {
            MetaValue::Bool(_) => "bool",
            MetaValue::Int32(_) => "int32",
            MetaValue::Int64(_) => "int64",
            MetaValue::Float(_) => "float",
            MetaValue::Double(_) => "double",
            MetaValue::String(_) => "string",
            MetaValue::Vec3i(_) => "vec3i",
            MetaValue::Vec3s(_) => "vec3s",
            MetaValue::Vec3d(_) => "vec3d",
            MetaValue::DelayedLoad(_) => delayed::TYPE_NAME,
            MetaValue::Unknown { type_name, .. } => type_name,
        }
    }

    fn byte_size(&self) -> usize {
        match self {
            MetaValue::Bool(_) => 1,
            MetaValue::Int32(_) | MetaValue::Float(_) => 4,
            MetaValue::Int64(_) | MetaValue::Double(_) => 8,
            MetaValue::String(s) => s.len(),
            MetaValue::Vec3i(_) | MetaValue::Vec3s(_) => 12,
            MetaValue::Vec3d(_) => 24,
            MetaValue::DelayedLoad(d) => d.byte_size(),
            MetaValue::Unknown { bytes, .. } => bytes.len(),
        }
    }

    fn write_value<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        match self {
            MetaValue::Bool(v) => w.write_u8(*v as u8),
            MetaValue::Int32(v) => w.write_i32::<LittleEndian>(*v),
            MetaValue::Int64(v) => w.write_i64::<LittleEndian>(*v),
            MetaValue::Float(v) => w.write_f32::<LittleEndian>(*v),
            MetaValue::Double(v) => w.write_f64::<LittleEndian>(*v),
            MetaValue::String(s) => w.write_all(s.as_bytes()),
            MetaValue::Vec3i(v) => {
                for c in v {
                    w.write_i32::<LittleEndian>(*c)?;
                }
                Ok(())
            }
            MetaValue::Vec3s(v) => {
                for c in v {
                    w.write_f32::<LittleEndian>(*c)?;
                }
                Ok(())
            }
            MetaValue::Vec3d(v) => {
                for c in v {
                    w.write_f64::<LittleEndian>(*c)?;
                }
                Ok(())
            }
            MetaValue::DelayedLoad(d) => d.write_to(w),
            MetaValue::Unknown { bytes, .. } => w.write_all(bytes),
        }
    }

    fn read_value<R: Read + ?Sized>(r: &mut R, type_name: &str, size: usize) -> io::Result<Self> {
        Ok(match type_name {
            "bool" => MetaValue::Bool(r.read_u8()? != 0),
            "int32" => MetaValue::Int32(r.read_i32::<LittleEndian>()?),
            "int64" => MetaValue::Int64(r.read_i64::<LittleEndian>()?),
            "float" => MetaValue::Float(r.read_f32::<LittleEndian>()?),
            "double" => MetaValue::Double(r.read_f64::<LittleEndian>()?),
            "string" => {
                let mut buf = vec![0u8; size];
                r.read_exact(&mut buf)?;
                MetaValue::String(String::from_utf8_lossy(&buf).into_owned())
            }
            "vec3i" => {
                let mut v = [0i32; 3];
                for c in &mut v {
                    *c = r.read_i32::<LittleEndian>()?;
                }
                MetaValue::Vec3i(v)
            }
            "vec3s" => {
                let mut v = [0f32; 3];
                for c in &mut v {
                    *c = r.read_f32::<LittleEndian>()?;
                }
                MetaValue::Vec3s(v)
            }
            "vec3d" => {
                let mut v = [0f64; 3];
                for c in &mut v {
                    *c = r.read_f64::<LittleEndian>()?;
                }
                MetaValue::Vec3d(v)
            }
            _ if type_name == delayed::TYPE_NAME => {
                MetaValue::DelayedLoad(DelayedLoadMetadata::read_from(r)?)
            }
            _ => {
                let mut bytes = vec![0u8; size];
                r.read_exact(&mut bytes)?;
                MetaValue::Unknown {
                    type_name: type_name.to_owned(),
                    bytes,
                }
            }
        })
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            MetaValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int32(v) => Some(*v as i64),
            MetaValue::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(v) => write!(f, "{v}"),
            MetaValue::Int32(v) => write!(f, "{v}"),
            MetaValue::Int64(v) => write!(f, "{v}"),
            MetaValue::Float(v) => write!(f, "{v}"),
            MetaValue::Double(v) => write!(f, "{v}"),
            MetaValue::String(s) => write!(f, "{s}"),
            MetaValue::Vec3i(v) => write!(f, "[{}, {}, {}]", v[0], v[1], v[2]),
            MetaValue::Vec3s(v) => write!(f, "[{}, {}, {}]", v[0], v[1], v[2]),
            MetaValue::Vec3d(v) => write!(f, "[{}, {}, {}]", v[0], v[1], v[2]),
            MetaValue::DelayedLoad(d) => write!(f, "delayed load ({} leaves)", d.leaf_count()),
            MetaValue::Unknown { type_name, bytes } => {
                write!(f, "{}({} bytes)", type_name, bytes.len())
            }
        }
    }
}

// ── Map ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaMap {
    entries: BTreeMap<String, MetaValue>,
}

impl MetaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_meta(&mut self, name: impl Into<String>, value: MetaValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn remove_meta(&mut self, name: &str) -> Option<MetaValue> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&MetaValue> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut MetaValue> {
        self.entries.get_mut(name)
    }

    pub fn meta_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.entries.iter()
    }

    pub fn write_meta<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for (name, value) in &self.entries {
            write_name(w, name)?;
            write_name(w, value.type_name())?;
            w.write_u32::<LittleEndian>(value.byte_size() as u32)?;
            value.write_value(w)?;
        }
        Ok(())
    }

    pub fn read_meta<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let count = r.read_u32::<LittleEndian>()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let name = read_name(r)?;
            let type_name = read_name(r)?;
            let size = r.read_u32::<LittleEndian>()? as usize;
            let value = MetaValue::read_value(r, &type_name, size)?;
            entries.insert(name, value);
        }
        Ok(Self { entries })
    }

    /// Human-readable rendering, one `name: value` line per entry.
    pub fn str_indented(&self, indent: &str) -> String {
        let mut out = String::new();
        for (name, value) in &self.entries {
            out.push_str(indent);
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for MetaMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.str_indented(""))
    }
}
