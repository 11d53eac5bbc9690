//! The read walk and its skipping variants.

use std::collections::BTreeMap;

use crate::codec::PathSeg;
use crate::errdata;
use crate::error::Result;
use crate::schema::table::SchemaTable;
use crate::schema::{CompiledSchema, WalkOp};
use crate::types::{self, Value};

/// Decodes a cell body into a value map. The reserved `*schema*` and
/// `*hash*` keys come from the header and are attached by the cell
/// operations, not here.
pub fn decode_body(table: &SchemaTable, schema: &CompiledSchema, buf: &[u8]) -> Result<Value> {
    let mut pos = 0;
    let ops = &schema.plan.ops;
    let map = read_fields(table, ops, 0, ops.len(), buf, &mut pos)?;
    Ok(Value::Map(map))
}

/// Walks the body without materializing values, returning its byte length.
/// Used for delete accounting and replace size comparison.
pub fn body_length(table: &SchemaTable, schema: &CompiledSchema, buf: &[u8]) -> Result<usize> {
    let mut pos = 0;
    let ops = &schema.plan.ops;
    let mut pc = 0;
    while pc < ops.len() {
        pc = skip_field(table, ops, pc, buf, &mut pos)?;
    }
    Ok(pos)
}

/// Decodes the value at `path`, skipping siblings by their computed byte
/// length. Returns None when the path names a missing field, an
/// out-of-bounds element, or descends into a scalar.
pub fn get_in(
    table: &SchemaTable,
    schema: &CompiledSchema,
    buf: &[u8],
    path: &[PathSeg],
) -> Result<Option<Value>> {
    if path.is_empty() {
        return Ok(None);
    }
    let mut pos = 0;
    let ops = &schema.plan.ops;
    get_in_fields(table, ops, 0, ops.len(), buf, &mut pos, path)
}

/// Single pass producing a map limited to the named top-level fields.
pub fn select_keys(
    table: &SchemaTable,
    schema: &CompiledSchema,
    buf: &[u8],
    keys: &[&str],
) -> Result<Value> {
    let mut pos = 0;
    let mut map = BTreeMap::new();
    let ops = &schema.plan.ops;
    let mut pc = 0;
    while pc < ops.len() {
        let name = ops[pc]
            .name()
            .ok_or_else(|| errdata!("unnamed op at field position {pc}"))?;
        if keys.contains(&name) {
            let name = name.to_string();
            let (value, next) = read_field(table, ops, pc, buf, &mut pos)?;
            map.insert(name, value);
            pc = next;
        } else {
            pc = skip_field(table, ops, pc, buf, &mut pos)?;
        }
    }
    Ok(Value::Map(map))
}

fn read_fields(
    table: &SchemaTable,
    ops: &[WalkOp],
    mut pc: usize,
    end: usize,
    buf: &[u8],
    pos: &mut usize,
) -> Result<BTreeMap<String, Value>> {
    let mut map = BTreeMap::new();
    while pc < end {
        let name = ops[pc]
            .name()
            .ok_or_else(|| errdata!("unnamed op at field position {pc}"))?
            .to_string();
        let (value, next) = read_field(table, ops, pc, buf, pos)?;
        map.insert(name, value);
        pc = next;
    }
    Ok(map)
}

fn read_field(
    table: &SchemaTable,
    ops: &[WalkOp],
    pc: usize,
    buf: &[u8],
    pos: &mut usize,
) -> Result<(Value, usize)> {
    match &ops[pc] {
        WalkOp::Prim { prim, .. } => Ok((types::read_value(*prim, buf, pos)?, pc + 1)),
        WalkOp::ArrayBegin { end, .. } => {
            let count = types::read_u32(buf, pos)?;
            let mut items = Vec::new();
            for _ in 0..count {
                let (item, _) = read_field(table, ops, pc + 1, buf, pos)?;
                items.push(item);
            }
            Ok((Value::List(items), *end))
        }
        WalkOp::SubSchema { id, .. } => {
            let sub = table.get(*id)?;
            let sub_ops = &sub.plan.ops;
            let map = read_fields(table, sub_ops, 0, sub_ops.len(), buf, pos)?;
            Ok((Value::Map(map), pc + 1))
        }
        WalkOp::InlineBegin { end, .. } => {
            let map = read_fields(table, ops, pc + 1, end - 1, buf, pos)?;
            Ok((Value::Map(map), *end))
        }
        WalkOp::ArrayEnd | WalkOp::InlineEnd => Err(errdata!("walk plan corrupted at {pc}")),
    }
}

fn skip_field(
    table: &SchemaTable,
    ops: &[WalkOp],
    pc: usize,
    buf: &[u8],
    pos: &mut usize,
) -> Result<usize> {
    match &ops[pc] {
        WalkOp::Prim { prim, .. } => {
            types::skip_value(*prim, buf, pos)?;
            Ok(pc + 1)
        }
        WalkOp::ArrayBegin { end, .. } => {
            let count = types::read_u32(buf, pos)?;
            for _ in 0..count {
                skip_field(table, ops, pc + 1, buf, pos)?;
            }
            Ok(*end)
        }
        WalkOp::SubSchema { id, .. } => {
            let sub = table.get(*id)?;
            let sub_ops = &sub.plan.ops;
            let mut sub_pc = 0;
            while sub_pc < sub_ops.len() {
                sub_pc = skip_field(table, sub_ops, sub_pc, buf, pos)?;
            }
            Ok(pc + 1)
        }
        WalkOp::InlineBegin { end, .. } => {
            let mut inner = pc + 1;
            while inner < end - 1 {
                inner = skip_field(table, ops, inner, buf, pos)?;
            }
            Ok(*end)
        }
        WalkOp::ArrayEnd | WalkOp::InlineEnd => Err(errdata!("walk plan corrupted at {pc}")),
    }
}

fn get_in_fields(
    table: &SchemaTable,
    ops: &[WalkOp],
    mut pc: usize,
    end: usize,
    buf: &[u8],
    pos: &mut usize,
    path: &[PathSeg],
) -> Result<Option<Value>> {
    let PathSeg::Field(target) = &path[0] else {
        return Ok(None);
    };
    while pc < end {
        if ops[pc].name() == Some(target.as_str()) {
            return get_in_field(table, ops, pc, buf, pos, &path[1..]);
        }
        pc = skip_field(table, ops, pc, buf, pos)?;
    }
    Ok(None)
}

fn get_in_field(
    table: &SchemaTable,
    ops: &[WalkOp],
    pc: usize,
    buf: &[u8],
    pos: &mut usize,
    rest: &[PathSeg],
) -> Result<Option<Value>> {
    if rest.is_empty() {
        return read_field(table, ops, pc, buf, pos).map(|(value, _)| Some(value));
    }
    match &ops[pc] {
        WalkOp::Prim { .. } => Ok(None),
        WalkOp::InlineBegin { end, .. } => {
            get_in_fields(table, ops, pc + 1, end - 1, buf, pos, rest)
        }
        WalkOp::SubSchema { id, .. } => {
            let sub = table.get(*id)?;
            let sub_ops = &sub.plan.ops;
            get_in_fields(table, sub_ops, 0, sub_ops.len(), buf, pos, rest)
        }
        WalkOp::ArrayBegin { .. } => {
            let PathSeg::Index(index) = rest[0] else {
                return Ok(None);
            };
            let count = types::read_u32(buf, pos)? as usize;
            if index >= count {
                return Ok(None);
            }
            for _ in 0..index {
                skip_field(table, ops, pc + 1, buf, pos)?;
            }
            get_in_field(table, ops, pc + 1, buf, pos, &rest[1..])
        }
        WalkOp::ArrayEnd | WalkOp::InlineEnd => Err(errdata!("walk plan corrupted at {pc}")),
    }
}
