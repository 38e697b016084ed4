//! The unified schema: the single source of truth for which subgraph owns
//! which field, and which key fields identify each entity.
//!
//! A `UnifiedSchema` is an immutable snapshot. The composer publishes new
//! versions atomically through a watch channel; a request clones the `Arc`
//! once and reads one consistent version for its whole lifetime.

use std::collections::BTreeMap;
use std::fmt;

use crate::query::OperationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Scalar,
    Enum,
    InputObject,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::Object => "object",
            TypeKind::Interface => "interface",
            TypeKind::Union => "union",
            TypeKind::Scalar => "scalar",
            TypeKind::Enum => "enum",
            TypeKind::InputObject => "input object",
        };
        f.write_str(name)
    }
}

/// One field of a composed type, with the subgraphs able to resolve it in
/// subgraph declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    /// Rendered type reference, e.g. `[Device!]!`.
    pub ty: String,
    /// Innermost named type, used to descend into nested selections.
    pub base_type: String,
    pub owners: Vec<String>,
    pub shareable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub kind: TypeKind,
    pub fields: Vec<FieldDef>,
    /// Key field set when the type is an entity.
    pub keys: Option<Vec<String>>,
}

impl TypeDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphInfo {
    pub url: String,
    /// Position in the configured subgraph list; tie-breaks shareable
    /// field ownership.
    pub index: usize,
}

/// An immutable, versioned snapshot of the composed graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedSchema {
    /// Hex sha256 over the (name, SDL) pairs that composed this snapshot.
    /// Identical inputs always produce the identical version.
    pub version: String,
    pub types: BTreeMap<String, TypeDef>,
    pub subgraphs: BTreeMap<String, SubgraphInfo>,
}

impl UnifiedSchema {
    pub fn type_def(&self, type_name: &str) -> Option<&TypeDef> {
        self.types.get(type_name)
    }

    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDef> {
        self.types.get(type_name)?.field(field_name)
    }

    pub fn entity_keys(&self, type_name: &str) -> Option<&[String]> {
        self.types.get(type_name)?.keys.as_deref()
    }

    pub fn subgraph_url(&self, subgraph: &str) -> Option<&str> {
        self.subgraphs.get(subgraph).map(|s| s.url.as_str())
    }

    pub fn declaration_index(&self, subgraph: &str) -> usize {
        self.subgraphs
            .get(subgraph)
            .map(|s| s.index)
            .unwrap_or(usize::MAX)
    }

    pub fn root_type(kind: OperationKind) -> &'static str {
        match kind {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
        }
    }
}
