//! Schema composition: merges per-subgraph schema documents into one
//! unified schema.
//!
//! For every type declared by two or more subgraphs the composer verifies
//! that the declarations agree: identical kind, identical entity key sets,
//! and disjoint field sets except for fields marked `@shareable` (key
//! fields are implicitly shareable). `@external` fields reference another
//! subgraph's declaration and claim no ownership. All conflicts found are
//! collected and returned together; a failed composition publishes nothing.
//!
//! Composition is idempotent: identical inputs produce a structurally equal
//! schema with the same version hash.

use std::collections::BTreeMap;

use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, Directive, Field, TypeDefinition, TypeExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{CompositionError, Conflict};
use crate::query::{base_type_name, render_type};
use crate::registry::SubgraphDescriptor;
use crate::schema::{FieldDef, SubgraphInfo, TypeDef, TypeKind, UnifiedSchema};

struct FieldAcc {
    name: String,
    ty: String,
    base_type: String,
    owners: Vec<String>,
    shareable: bool,
}

struct TypeAcc {
    kind: TypeKind,
    kind_from: String,
    keys: Option<(String, Vec<String>)>,
    fields: Vec<FieldAcc>,
}

impl TypeAcc {
    fn field_mut(&mut self, name: &str) -> Option<&mut FieldAcc> {
        self.fields.iter_mut().find(|f| f.name == name)
    }
}

/// Composes the descriptor table into a new [`UnifiedSchema`], or returns
/// every conflict found. Descriptors without a schema document (subgraphs
/// that never answered introspection) are skipped.
pub fn compose(
    descriptors: &BTreeMap<String, SubgraphDescriptor>,
) -> Result<UnifiedSchema, CompositionError> {
    let mut ordered: Vec<&SubgraphDescriptor> =
        descriptors.values().filter(|d| d.has_schema()).collect();
    ordered.sort_by_key(|d| d.index);

    let mut types: BTreeMap<String, TypeAcc> = BTreeMap::new();
    let mut type_order: Vec<String> = Vec::new();
    let mut conflicts: Vec<Conflict> = Vec::new();

    for descriptor in &ordered {
        let document = match parse_schema::<String>(&descriptor.sdl) {
            Ok(doc) => doc,
            Err(e) => {
                conflicts.push(Conflict::InvalidSdl {
                    subgraph: descriptor.name.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        for definition in &document.definitions {
            match definition {
                Definition::TypeDefinition(typedef) => merge_type_definition(
                    &descriptor.name,
                    typedef,
                    &mut types,
                    &mut type_order,
                    &mut conflicts,
                ),
                Definition::TypeExtension(TypeExtension::Object(ext)) => merge_object_like(
                    &descriptor.name,
                    &ext.name,
                    TypeKind::Object,
                    &ext.fields,
                    &ext.directives,
                    &mut types,
                    &mut type_order,
                    &mut conflicts,
                ),
                _ => {}
            }
        }
    }

    if !conflicts.is_empty() {
        return Err(CompositionError { conflicts });
    }

    let mut unified_types = BTreeMap::new();
    for name in &type_order {
        let acc = &types[name];
        unified_types.insert(
            name.clone(),
            TypeDef {
                kind: acc.kind,
                fields: acc
                    .fields
                    .iter()
                    .map(|f| FieldDef {
                        name: f.name.clone(),
                        ty: f.ty.clone(),
                        base_type: f.base_type.clone(),
                        owners: f.owners.clone(),
                        shareable: f.shareable,
                    })
                    .collect(),
                keys: acc.keys.as_ref().map(|(_, keys)| keys.clone()),
            },
        );
    }

    let subgraphs = ordered
        .iter()
        .map(|d| {
            (
                d.name.clone(),
                SubgraphInfo {
                    url: d.url.clone(),
                    index: d.index,
                },
            )
        })
        .collect();

    let version = version_hash(&ordered);
    debug!(version = %version, types = unified_types.len(), "schema composed");

    Ok(UnifiedSchema {
        version,
        types: unified_types,
        subgraphs,
    })
}

fn merge_type_definition(
    subgraph: &str,
    typedef: &TypeDefinition<'_, String>,
    types: &mut BTreeMap<String, TypeAcc>,
    type_order: &mut Vec<String>,
    conflicts: &mut Vec<Conflict>,
) {
    match typedef {
        TypeDefinition::Object(obj) => merge_object_like(
            subgraph,
            &obj.name,
            TypeKind::Object,
            &obj.fields,
            &obj.directives,
            types,
            type_order,
            conflicts,
        ),
        TypeDefinition::Interface(iface) => merge_object_like(
            subgraph,
            &iface.name,
            TypeKind::Interface,
            &iface.fields,
            &iface.directives,
            types,
            type_order,
            conflicts,
        ),
        TypeDefinition::Union(union_type) => {
            merge_fieldless(subgraph, &union_type.name, TypeKind::Union, types, type_order, conflicts)
        }
        TypeDefinition::Scalar(scalar) => {
            merge_fieldless(subgraph, &scalar.name, TypeKind::Scalar, types, type_order, conflicts)
        }
        TypeDefinition::Enum(enum_type) => {
            merge_fieldless(subgraph, &enum_type.name, TypeKind::Enum, types, type_order, conflicts)
        }
        TypeDefinition::InputObject(input) => merge_fieldless(
            subgraph,
            &input.name,
            TypeKind::InputObject,
            types,
            type_order,
            conflicts,
        ),
    }
}

/// Federation machinery types (`_Service`, `_Entity`, `_Any`, ...) are the
/// wire protocol, not part of the composed graph.
fn is_builtin(name: &str) -> bool {
    name.starts_with('_')
}

fn accumulator<'a>(
    subgraph: &str,
    name: &str,
    kind: TypeKind,
    types: &'a mut BTreeMap<String, TypeAcc>,
    type_order: &mut Vec<String>,
    conflicts: &mut Vec<Conflict>,
) -> &'a mut TypeAcc {
    let acc = types.entry(name.to_string()).or_insert_with(|| {
        type_order.push(name.to_string());
        TypeAcc {
            kind,
            kind_from: subgraph.to_string(),
            keys: None,
            fields: Vec::new(),
        }
    });
    if acc.kind != kind {
        conflicts.push(Conflict::KindMismatch {
            type_name: name.to_string(),
            left: acc.kind_from.clone(),
            left_kind: acc.kind.to_string(),
            right: subgraph.to_string(),
            right_kind: kind.to_string(),
        });
    }
    acc
}

fn merge_fieldless(
    subgraph: &str,
    name: &str,
    kind: TypeKind,
    types: &mut BTreeMap<String, TypeAcc>,
    type_order: &mut Vec<String>,
    conflicts: &mut Vec<Conflict>,
) {
    if is_builtin(name) {
        return;
    }
    accumulator(subgraph, name, kind, types, type_order, conflicts);
}

#[allow(clippy::too_many_arguments)]
fn merge_object_like(
    subgraph: &str,
    name: &str,
    kind: TypeKind,
    fields: &[Field<'_, String>],
    directives: &[Directive<'_, String>],
    types: &mut BTreeMap<String, TypeAcc>,
    type_order: &mut Vec<String>,
    conflicts: &mut Vec<Conflict>,
) {
    if is_builtin(name) {
        return;
    }

    let declared_keys = key_fields(directives);
    let type_shareable = has_directive(directives, "shareable");

    let acc = accumulator(subgraph, name, kind, types, type_order, conflicts);

    if let Some(keys) = &declared_keys {
        match &acc.keys {
            None => acc.keys = Some((subgraph.to_string(), keys.clone())),
            Some((from, existing)) if existing != keys => {
                conflicts.push(Conflict::KeyMismatch {
                    type_name: name.to_string(),
                    left: from.clone(),
                    left_key: existing.join(" "),
                    right: subgraph.to_string(),
                    right_key: keys.join(" "),
                });
            }
            Some(_) => {}
        }
    }

    for field in fields {
        // An @external field references another subgraph's declaration and
        // claims no ownership here.
        if has_directive(&field.directives, "external") {
            continue;
        }

        let is_key = declared_keys
            .as_ref()
            .map(|keys| keys.contains(&field.name))
            .unwrap_or(false);
        let shareable =
            type_shareable || is_key || has_directive(&field.directives, "shareable");
        let ty = render_type(&field.field_type);
        let base_type = base_type_name(&field.field_type);

        match acc.field_mut(&field.name) {
            None => acc.fields.push(FieldAcc {
                name: field.name.clone(),
                ty,
                base_type,
                owners: vec![subgraph.to_string()],
                shareable,
            }),
            Some(existing) => {
                if existing.owners.contains(&subgraph.to_string()) {
                    continue;
                }
                if existing.ty != ty {
                    conflicts.push(Conflict::FieldTypeMismatch {
                        type_name: name.to_string(),
                        field: field.name.clone(),
                        left: existing.owners[0].clone(),
                        left_type: existing.ty.clone(),
                        right: subgraph.to_string(),
                        right_type: ty,
                    });
                    continue;
                }
                if existing.shareable && shareable {
                    existing.owners.push(subgraph.to_string());
                } else {
                    conflicts.push(Conflict::DuplicateField {
                        type_name: name.to_string(),
                        field: field.name.clone(),
                        left: existing.owners[0].clone(),
                        right: subgraph.to_string(),
                    });
                }
            }
        }
    }
}

fn has_directive(directives: &[Directive<'_, String>], name: &str) -> bool {
    directives.iter().any(|d| d.name == name)
}

/// Parses `@key(fields: "id otherId")` into the key field list. The first
/// `@key` on a type is its primary key; subgraphs must declare the same set.
fn key_fields(directives: &[Directive<'_, String>]) -> Option<Vec<String>> {
    let key = directives.iter().find(|d| d.name == "key")?;
    let fields = key.arguments.iter().find_map(|(name, value)| {
        if name == "fields" {
            match value {
                graphql_parser::schema::Value::String(s) => Some(s.clone()),
                _ => None,
            }
        } else {
            None
        }
    })?;
    let mut names: Vec<String> = fields.split_whitespace().map(str::to_string).collect();
    names.sort();
    Some(names)
}

/// Content hash over the (name, SDL) pairs, in declaration order.
fn version_hash(descriptors: &[&SubgraphDescriptor]) -> String {
    let mut hasher = Sha256::new();
    for descriptor in descriptors {
        hasher.update(descriptor.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(descriptor.sdl.as_bytes());
        hasher.update([0xffu8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
