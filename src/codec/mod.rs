//! The schema-directed cell codec.
//!
//! Encoding and decoding interpret a schema's compiled walk plan against a
//! byte region. The write side produces the body bytes for a value map; the
//! read side mirrors it, with variants that skip rather than materialize
//! (length calculation) or materialize only part of a cell (`get_in`,
//! `select_keys`).

pub mod reader;
pub mod writer;

pub use reader::{body_length, decode_body, get_in, select_keys};
pub use writer::encode_body;

/// One step of a partial-read path: a map field by name or an array element
/// by position.
#[derive(Clone, Debug, PartialEq)]
pub enum PathSeg {
    Field(String),
    Index(usize),
}

impl From<&str> for PathSeg {
    fn from(name: &str) -> Self {
        PathSeg::Field(name.to_string())
    }
}

impl From<usize> for PathSeg {
    fn from(index: usize) -> Self {
        PathSeg::Index(index)
    }
}
