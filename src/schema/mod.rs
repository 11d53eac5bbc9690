//! Schemas: ordered field lists that drive the cell codec.
//!
//! A field's type expression is a primitive keyword, a reference to another
//! schema by name, an inline field list, or an array of any of those. Adding
//! a schema to the table compiles it into a flat walk plan so the codec never
//! re-interprets the field tree on the hot path.

pub mod plan;
pub mod table;

use serde::{Deserialize, Serialize};

pub use plan::{WalkOp, WalkPlan};
pub use table::SchemaTable;

use crate::types::PrimType;

/// A field type expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TypeExpr {
    /// A primitive type keyword.
    Prim(PrimType),
    /// Another schema, referenced by name. Resolved when the schema is added.
    Named(String),
    /// An inline sub-schema.
    Inline(Vec<Field>),
    /// An ordered sequence of the inner type.
    Array(Box<TypeExpr>),
}

impl TypeExpr {
    /// Resolves a schema keyword, including the `<prim>-array` shorthand.
    pub fn from_keyword(kw: &str) -> Option<TypeExpr> {
        if let Some(prim) = PrimType::from_keyword(kw) {
            return Some(TypeExpr::Prim(prim));
        }
        let inner = kw.strip_suffix("-array")?;
        PrimType::from_keyword(inner).map(|prim| TypeExpr::Array(Box::new(TypeExpr::Prim(prim))))
    }

    pub fn array(inner: TypeExpr) -> TypeExpr {
        TypeExpr::Array(Box::new(inner))
    }
}

/// A named field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub expr: TypeExpr,
}

impl Field {
    pub fn new(name: &str, expr: TypeExpr) -> Field {
        Field {
            name: name.to_string(),
            expr,
        }
    }

    pub fn prim(name: &str, prim: PrimType) -> Field {
        Field::new(name, TypeExpr::Prim(prim))
    }
}

/// An ordered field list with an id and a name.
///
/// The id is what cell headers reference; ids are assigned by the
/// [`SchemaTable`] and are monotonic per node. Cluster-level agreement on id
/// assignment belongs to the schema registry, not this crate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub id: u32,
    pub name: String,
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(name: &str, fields: Vec<Field>) -> Schema {
        Schema {
            id: 0,
            name: name.to_string(),
            fields,
        }
    }

    pub fn new_with_id(id: u32, name: &str, fields: Vec<Field>) -> Schema {
        let mut schema = Schema::new(name, fields);
        schema.id = id;
        schema
    }
}

/// A schema together with its compiled walk plan.
#[derive(Debug)]
pub struct CompiledSchema {
    pub schema: Schema,
    pub plan: WalkPlan,
}
