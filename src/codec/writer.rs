//! The write walk: value map to body bytes.

use std::collections::BTreeMap;

use byteorder::{BigEndian, WriteBytesExt};

use crate::errdata;
use crate::error::{Error, Result};
use crate::schema::table::SchemaTable;
use crate::schema::{CompiledSchema, WalkOp};
use crate::types::{self, Value};

/// Encodes a value map into cell body bytes per the schema's walk plan.
///
/// Every schema field must be present in the map; extra keys are rejected so
/// a write cannot silently drop data.
pub fn encode_body(
    table: &SchemaTable,
    schema: &CompiledSchema,
    value: &Value,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let ops = &schema.plan.ops;
    write_fields(table, ops, 0, ops.len(), value.as_map()?, &mut out)?;
    Ok(out)
}

fn write_fields(
    table: &SchemaTable,
    ops: &[WalkOp],
    mut pc: usize,
    end: usize,
    map: &BTreeMap<String, Value>,
    out: &mut Vec<u8>,
) -> Result<()> {
    let start = pc;
    let mut seen = 0;
    while pc < end {
        let name = ops[pc]
            .name()
            .ok_or_else(|| errdata!("unnamed op at field position {pc}"))?;
        let value = map
            .get(name)
            .ok_or_else(|| Error::TypeMismatch(format!("missing field {name}")))?;
        seen += 1;
        pc = write_field(table, ops, pc, value, out)?;
    }
    if seen != map.len() {
        let extra: Vec<_> = map
            .keys()
            .filter(|k| !field_names(ops, start, end).any(|n| n == k.as_str()))
            .cloned()
            .collect();
        return Err(Error::TypeMismatch(format!(
            "keys not in schema: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

fn field_names(ops: &[WalkOp], start: usize, end: usize) -> impl Iterator<Item = &str> {
    let mut pc = start;
    std::iter::from_fn(move || {
        if pc >= end {
            return None;
        }
        let op = ops.get(pc)?;
        pc = op.next_pc(pc);
        op.name()
    })
}

fn write_field(
    table: &SchemaTable,
    ops: &[WalkOp],
    pc: usize,
    value: &Value,
    out: &mut Vec<u8>,
) -> Result<usize> {
    match &ops[pc] {
        WalkOp::Prim { prim, .. } => {
            types::write_value(*prim, value, out)?;
            Ok(pc + 1)
        }
        WalkOp::ArrayBegin { end, .. } => {
            let items = match value {
                Value::List(items) => items,
                other => {
                    return Err(Error::TypeMismatch(format!(
                        "expected list, got {}",
                        other.type_name()
                    )))
                }
            };
            out.write_u32::<BigEndian>(items.len() as u32).unwrap();
            for item in items {
                write_field(table, ops, pc + 1, item, out)?;
            }
            Ok(*end)
        }
        WalkOp::SubSchema { id, .. } => {
            let sub = table.get(*id)?;
            let sub_ops = &sub.plan.ops;
            write_fields(table, sub_ops, 0, sub_ops.len(), value.as_map()?, out)?;
            Ok(pc + 1)
        }
        WalkOp::InlineBegin { end, .. } => {
            write_fields(table, ops, pc + 1, end - 1, value.as_map()?, out)?;
            Ok(*end)
        }
        WalkOp::ArrayEnd | WalkOp::InlineEnd => Err(errdata!("walk plan corrupted at {pc}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, Schema, TypeExpr};
    use crate::types::PrimType;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn test_encode_scalars() {
        let table = SchemaTable::new();
        let id = table
            .add(Schema::new(
                "kv",
                vec![
                    Field::prim("k", PrimType::Long),
                    Field::prim("v", PrimType::Text),
                ],
            ))
            .unwrap();
        let schema = table.get(id).unwrap();
        let body = encode_body(
            &table,
            &schema,
            &map(vec![("k", Value::Long(7)), ("v", Value::Text("hi".into()))]),
        )
        .unwrap();
        // i64 + u32 length prefix + 2 utf-8 bytes
        assert_eq!(body.len(), 8 + 4 + 2);
        assert_eq!(&body[0..8], &7i64.to_be_bytes());
    }

    #[test]
    fn test_missing_field_rejected() {
        let table = SchemaTable::new();
        let id = table
            .add(Schema::new("one", vec![Field::prim("a", PrimType::Int)]))
            .unwrap();
        let schema = table.get(id).unwrap();
        let err = encode_body(&table, &schema, &map(vec![])).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn test_extra_field_rejected() {
        let table = SchemaTable::new();
        let id = table
            .add(Schema::new("one", vec![Field::prim("a", PrimType::Int)]))
            .unwrap();
        let schema = table.get(id).unwrap();
        let err = encode_body(
            &table,
            &schema,
            &map(vec![("a", Value::Int(1)), ("b", Value::Int(2))]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn test_array_count_prefix() {
        let table = SchemaTable::new();
        let id = table
            .add(Schema::new(
                "arr",
                vec![Field::new(
                    "xs",
                    TypeExpr::array(TypeExpr::Prim(PrimType::Long)),
                )],
            ))
            .unwrap();
        let schema = table.get(id).unwrap();
        let body = encode_body(
            &table,
            &schema,
            &map(vec![(
                "xs",
                Value::List(vec![Value::Long(1), Value::Long(2), Value::Long(3)]),
            )]),
        )
        .unwrap();
        assert_eq!(body.len(), 4 + 3 * 8);
        assert_eq!(&body[0..4], &3u32.to_be_bytes());
    }
}
