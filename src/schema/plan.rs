//! Walk plans: flat opcode programs compiled from a schema's field tree.
//!
//! The codec interprets these instead of recursing over [`TypeExpr`] values.
//! Composite opcodes carry the index one past their matching end marker, so
//! an interpreter can skip a whole field without scanning for the delimiter.

use crate::error::{Error, Result};
use crate::schema::{Field, TypeExpr};
use crate::types::PrimType;

/// One step of a schema walk. `name` is None for array element positions.
#[derive(Clone, Debug, PartialEq)]
pub enum WalkOp {
    /// A primitive leaf.
    Prim { name: Option<String>, prim: PrimType },
    /// An array. Ops `pc + 1 .. end - 1` describe one element.
    ArrayBegin { name: Option<String>, end: usize },
    ArrayEnd,
    /// A named sub-schema, resolved to its id at compile time.
    SubSchema { name: Option<String>, id: u32 },
    /// An inline field list. Ops `pc + 1 .. end - 1` are its fields.
    InlineBegin { name: Option<String>, end: usize },
    InlineEnd,
}

impl WalkOp {
    /// The field name this op binds, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            WalkOp::Prim { name, .. }
            | WalkOp::ArrayBegin { name, .. }
            | WalkOp::SubSchema { name, .. }
            | WalkOp::InlineBegin { name, .. } => name.as_deref(),
            WalkOp::ArrayEnd | WalkOp::InlineEnd => None,
        }
    }

    /// The index one past this op's last instruction.
    pub fn next_pc(&self, pc: usize) -> usize {
        match self {
            WalkOp::ArrayBegin { end, .. } | WalkOp::InlineBegin { end, .. } => *end,
            _ => pc + 1,
        }
    }
}

/// A compiled schema walk.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct WalkPlan {
    pub ops: Vec<WalkOp>,
}

/// Resolves named sub-schema references during compilation.
pub trait SchemaResolver {
    fn resolve(&self, name: &str) -> Result<Option<u32>>;
}

/// Compiles a field list into a flat walk plan.
pub fn compile(fields: &[Field], resolver: &dyn SchemaResolver) -> Result<WalkPlan> {
    let mut ops = Vec::new();
    for field in fields {
        emit(&mut ops, Some(field.name.clone()), &field.expr, resolver)?;
    }
    Ok(WalkPlan { ops })
}

fn emit(
    ops: &mut Vec<WalkOp>,
    name: Option<String>,
    expr: &TypeExpr,
    resolver: &dyn SchemaResolver,
) -> Result<()> {
    match expr {
        TypeExpr::Prim(prim) => ops.push(WalkOp::Prim { name, prim: *prim }),
        TypeExpr::Named(schema_name) => {
            let id = resolver
                .resolve(schema_name)?
                .ok_or_else(|| Error::SchemaNotFound(schema_name.clone()))?;
            ops.push(WalkOp::SubSchema { name, id });
        }
        TypeExpr::Inline(fields) => {
            let begin = ops.len();
            ops.push(WalkOp::InlineBegin { name, end: 0 });
            for field in fields {
                emit(ops, Some(field.name.clone()), &field.expr, resolver)?;
            }
            ops.push(WalkOp::InlineEnd);
            let end = ops.len();
            if let WalkOp::InlineBegin { end: slot, .. } = &mut ops[begin] {
                *slot = end;
            }
        }
        TypeExpr::Array(inner) => {
            let begin = ops.len();
            ops.push(WalkOp::ArrayBegin { name, end: 0 });
            emit(ops, None, inner, resolver)?;
            ops.push(WalkOp::ArrayEnd);
            let end = ops.len();
            if let WalkOp::ArrayBegin { end: slot, .. } = &mut ops[begin] {
                *slot = end;
            }
        }
    }
    Ok(())
}
