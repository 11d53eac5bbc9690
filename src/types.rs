//! Primitive type descriptors and the value model cells decode into.
//!
//! Every primitive has either a fixed byte width or a dynamic wire form of
//! `u32 length || payload`. All multi-byte integers are big-endian, the same
//! convention the replica file format uses, so encoded cell bytes can be
//! shipped and recovered verbatim.

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::errdata;
use crate::error::{Error, Result};

/// Reserved key carrying the schema id in a decoded cell map.
pub const SCHEMA_KEY: &str = "*schema*";
/// Reserved key carrying the cell hash in a decoded cell map.
pub const HASH_KEY: &str = "*hash*";

/// A decoded field value. Cells decode into [`Value::Map`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Text(String),
    Bytes(Vec<u8>),
    /// Opaque serialized payload. Stored as a self-describing bincode blob.
    Obj(Box<Value>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Byte(_) => "byte",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Char(_) => "char",
            Value::Text(_) => "text",
            Value::Bytes(_) => "blob",
            Value::Obj(_) => "obj",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// The map form or a mismatch error, used by the codec at sub-schema and
    /// inline boundaries.
    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Ok(map),
            other => Err(Error::TypeMismatch(format!(
                "expected map, got {}",
                other.type_name()
            ))),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Primitive type descriptors.
///
/// `Text`, `Blob` and `Obj` are dynamic; everything else has a fixed width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimType {
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Char,
    Text,
    Blob,
    Obj,
}

impl PrimType {
    /// Fixed byte width, or None for dynamic types.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            PrimType::Bool | PrimType::Byte => Some(1),
            PrimType::Short => Some(2),
            PrimType::Int | PrimType::Float | PrimType::Char => Some(4),
            PrimType::Long | PrimType::Double => Some(8),
            PrimType::Text | PrimType::Blob | PrimType::Obj => None,
        }
    }

    pub fn is_dynamic(self) -> bool {
        self.fixed_len().is_none()
    }

    /// Resolves a schema type keyword. `string` is an alias of `text`.
    pub fn from_keyword(kw: &str) -> Option<PrimType> {
        Some(match kw {
            "bool" => PrimType::Bool,
            "byte" => PrimType::Byte,
            "short" => PrimType::Short,
            "int" => PrimType::Int,
            "long" => PrimType::Long,
            "float" => PrimType::Float,
            "double" => PrimType::Double,
            "char" => PrimType::Char,
            "text" | "string" => PrimType::Text,
            "blob" => PrimType::Blob,
            "obj" => PrimType::Obj,
            _ => return None,
        })
    }

    pub fn keyword(self) -> &'static str {
        match self {
            PrimType::Bool => "bool",
            PrimType::Byte => "byte",
            PrimType::Short => "short",
            PrimType::Int => "int",
            PrimType::Long => "long",
            PrimType::Float => "float",
            PrimType::Double => "double",
            PrimType::Char => "char",
            PrimType::Text => "text",
            PrimType::Blob => "blob",
            PrimType::Obj => "obj",
        }
    }
}

fn mismatch(prim: PrimType, value: &Value) -> Error {
    Error::TypeMismatch(format!(
        "field is {}, value is {}",
        prim.keyword(),
        value.type_name()
    ))
}

/// Appends the wire form of a primitive value.
pub fn write_value(prim: PrimType, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match (prim, value) {
        (PrimType::Bool, Value::Bool(v)) => out.push(*v as u8),
        (PrimType::Byte, Value::Byte(v)) => out.push(*v),
        (PrimType::Short, Value::Short(v)) => out.write_i16::<BigEndian>(*v).unwrap(),
        (PrimType::Int, Value::Int(v)) => out.write_i32::<BigEndian>(*v).unwrap(),
        (PrimType::Long, Value::Long(v)) => out.write_i64::<BigEndian>(*v).unwrap(),
        (PrimType::Float, Value::Float(v)) => out.write_f32::<BigEndian>(*v).unwrap(),
        (PrimType::Double, Value::Double(v)) => out.write_f64::<BigEndian>(*v).unwrap(),
        (PrimType::Char, Value::Char(v)) => out.write_u32::<BigEndian>(*v as u32).unwrap(),
        (PrimType::Text, Value::Text(v)) => {
            out.write_u32::<BigEndian>(v.len() as u32).unwrap();
            out.extend_from_slice(v.as_bytes());
        }
        (PrimType::Blob, Value::Bytes(v)) => {
            out.write_u32::<BigEndian>(v.len() as u32).unwrap();
            out.extend_from_slice(v);
        }
        (PrimType::Obj, Value::Obj(v)) => {
            let payload = bincode::serialize(v.as_ref())?;
            out.write_u32::<BigEndian>(payload.len() as u32).unwrap();
            out.extend_from_slice(&payload);
        }
        (prim, value) => return Err(mismatch(prim, value)),
    }
    Ok(())
}

/// Reads `n` bytes at the cursor, advancing it.
pub(crate) fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(n)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| errdata!("read of {n} bytes at {pos} overruns buffer of {}", buf.len()))?;
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

pub(crate) fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    Ok(BigEndian::read_u32(take(buf, pos, 4)?))
}

/// Decodes the wire form of a primitive value at the cursor.
pub fn read_value(prim: PrimType, buf: &[u8], pos: &mut usize) -> Result<Value> {
    Ok(match prim {
        PrimType::Bool => Value::Bool(take(buf, pos, 1)?[0] != 0),
        PrimType::Byte => Value::Byte(take(buf, pos, 1)?[0]),
        PrimType::Short => Value::Short(BigEndian::read_i16(take(buf, pos, 2)?)),
        PrimType::Int => Value::Int(BigEndian::read_i32(take(buf, pos, 4)?)),
        PrimType::Long => Value::Long(BigEndian::read_i64(take(buf, pos, 8)?)),
        PrimType::Float => Value::Float(BigEndian::read_f32(take(buf, pos, 4)?)),
        PrimType::Double => Value::Double(BigEndian::read_f64(take(buf, pos, 8)?)),
        PrimType::Char => {
            let code = read_u32(buf, pos)?;
            Value::Char(char::from_u32(code).ok_or_else(|| errdata!("invalid char {code:#x}"))?)
        }
        PrimType::Text => {
            let len = read_u32(buf, pos)? as usize;
            let bytes = take(buf, pos, len)?;
            Value::Text(
                String::from_utf8(bytes.to_vec()).map_err(|e| errdata!("invalid utf-8: {e}"))?,
            )
        }
        PrimType::Blob => {
            let len = read_u32(buf, pos)? as usize;
            Value::Bytes(take(buf, pos, len)?.to_vec())
        }
        PrimType::Obj => {
            let len = read_u32(buf, pos)? as usize;
            Value::Obj(Box::new(bincode::deserialize(take(buf, pos, len)?)?))
        }
    })
}

/// Advances the cursor past a primitive value without materializing it.
pub fn skip_value(prim: PrimType, buf: &[u8], pos: &mut usize) -> Result<()> {
    match prim.fixed_len() {
        Some(len) => {
            take(buf, pos, len)?;
        }
        None => {
            let len = read_u32(buf, pos)? as usize;
            take(buf, pos, len)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(prim: PrimType, value: Value) {
        let mut buf = Vec::new();
        write_value(prim, &value, &mut buf).unwrap();
        let mut pos = 0;
        assert_eq!(read_value(prim, &buf, &mut pos).unwrap(), value);
        assert_eq!(pos, buf.len());

        let mut pos = 0;
        skip_value(prim, &buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_fixed_round_trips() {
        round_trip(PrimType::Bool, Value::Bool(true));
        round_trip(PrimType::Byte, Value::Byte(0xfe));
        round_trip(PrimType::Short, Value::Short(i16::MIN));
        round_trip(PrimType::Int, Value::Int(-1234567));
        round_trip(PrimType::Long, Value::Long(i64::MAX));
        round_trip(PrimType::Float, Value::Float(3.5));
        round_trip(PrimType::Double, Value::Double(-0.125));
        round_trip(PrimType::Char, Value::Char('中'));
    }

    #[test]
    fn test_dynamic_round_trips() {
        round_trip(PrimType::Text, Value::Text("hello world".to_string()));
        round_trip(PrimType::Text, Value::Text(String::new()));
        round_trip(PrimType::Blob, Value::Bytes(vec![0, 1, 2, 255]));
        round_trip(
            PrimType::Obj,
            Value::Obj(Box::new(Value::List(vec![
                Value::Long(1),
                Value::Text("x".into()),
            ]))),
        );
    }

    #[test]
    fn test_type_mismatch() {
        let mut buf = Vec::new();
        let err = write_value(PrimType::Long, &Value::Text("no".into()), &mut buf).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn test_truncated_read() {
        let mut buf = Vec::new();
        write_value(PrimType::Text, &Value::Text("hello".into()), &mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        let mut pos = 0;
        assert!(read_value(PrimType::Text, &buf, &mut pos).is_err());
    }

    #[test]
    fn test_keyword_aliases() {
        assert_eq!(PrimType::from_keyword("string"), Some(PrimType::Text));
        assert_eq!(PrimType::from_keyword("text"), Some(PrimType::Text));
        assert_eq!(PrimType::from_keyword("nope"), None);
    }
}
