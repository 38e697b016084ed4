//! Query planning: turns one client operation into a DAG of per-subgraph
//! sub-operations.
//!
//! Contiguous selections owned by the same subgraph are grouped into one
//! sub-operation; a field owned by a different subgraph than its enclosing
//! object becomes a dependent node that fetches the entity through the
//! federation `_entities(representations:)` operation, keyed by the entity's
//! key fields. The planner injects those key fields into the parent
//! sub-operation when the client did not request them; injected fields are
//! stripped again during merging.
//!
//! Planning is pure: it never mutates the unified schema, and planning the
//! same document against the same schema twice yields an equal plan.

use std::collections::VecDeque;

use crate::error::PlanError;
use crate::query::{OperationKind, QueryDocument, SelectionNode, render_selection_set};
use crate::schema::{TypeKind, UnifiedSchema};

/// A dependent entity fetch: resolve `type_name` instances found at the
/// parent node's output by their key fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFetch {
    pub type_name: String,
    pub key_fields: Vec<String>,
    pub parent: usize,
}

/// One unit of work targeting one subgraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    pub id: usize,
    pub subgraph: String,
    /// Rendered sub-operation document.
    pub operation: String,
    pub kind: OperationKind,
    /// Client variable names this sub-operation forwards.
    pub variables: Vec<String>,
    /// Direct prerequisites. Always smaller ids, so the plan is acyclic by
    /// construction.
    pub depends_on: Vec<usize>,
    /// Response keys from the root to where this node's data attaches.
    pub merge_path: Vec<String>,
    /// The selections this node resolves at its merge path.
    pub selections: Vec<SelectionNode>,
    pub entity: Option<EntityFetch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub nodes: Vec<PlanNode>,
}

struct PendingEntity {
    parent: usize,
    path: Vec<String>,
    type_name: String,
    owner: String,
    selections: Vec<SelectionNode>,
}

/// Builds the execution plan for one parsed operation.
pub fn plan(doc: &QueryDocument, schema: &UnifiedSchema) -> Result<ExecutionPlan, PlanError> {
    let root_type = UnifiedSchema::root_type(doc.kind);
    let groups = group_root_selections(doc, schema, root_type)?;

    let mut nodes: Vec<PlanNode> = Vec::new();
    let mut queue: VecDeque<PendingEntity> = VecDeque::new();
    let mut previous_root: Option<usize> = None;

    for (subgraph, selections) in groups {
        let id = nodes.len();
        let mut pending = Vec::new();
        let processed = split_set(&selections, root_type, &subgraph, &[], schema, &mut pending)?;

        // Mutation root nodes run serially, in client order.
        let depends_on = match (doc.kind, previous_root) {
            (OperationKind::Mutation, Some(prev)) => vec![prev],
            _ => Vec::new(),
        };
        previous_root = Some(id);

        let variables = doc.variables_used(&processed);
        let operation = render_root_operation(doc, &variables, &processed);
        nodes.push(PlanNode {
            id,
            subgraph,
            operation,
            kind: doc.kind,
            variables,
            depends_on,
            merge_path: Vec::new(),
            selections: processed,
            entity: None,
        });

        for p in pending {
            queue.push_back(PendingEntity { parent: id, ..p });
        }
    }

    while let Some(entity) = queue.pop_front() {
        let id = nodes.len();
        let mut pending = Vec::new();
        let processed = split_set(
            &entity.selections,
            &entity.type_name,
            &entity.owner,
            &entity.path,
            schema,
            &mut pending,
        )?;

        let key_fields = schema
            .entity_keys(&entity.type_name)
            .ok_or_else(|| PlanError::UnreachableField {
                type_name: entity.type_name.clone(),
                field: processed
                    .first()
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
            })?
            .to_vec();

        let variables = doc.variables_used(&processed);
        let operation = render_entity_operation(doc, &variables, &entity.type_name, &processed);
        nodes.push(PlanNode {
            id,
            subgraph: entity.owner.clone(),
            operation,
            kind: OperationKind::Query,
            variables,
            depends_on: vec![entity.parent],
            merge_path: entity.path.clone(),
            selections: processed,
            entity: Some(EntityFetch {
                type_name: entity.type_name,
                key_fields,
                parent: entity.parent,
            }),
        });

        for p in pending {
            queue.push_back(PendingEntity { parent: id, ..p });
        }
    }

    Ok(ExecutionPlan { nodes })
}

/// Groups root selections by owning subgraph. A selection joins the
/// previous group when that group's subgraph can resolve it (keeping runs
/// contiguous); for queries a non-adjacent group with the same owner is
/// reused to minimize round trips; otherwise the owner with the smallest
/// declaration index starts a new group.
fn group_root_selections(
    doc: &QueryDocument,
    schema: &UnifiedSchema,
    root_type: &str,
) -> Result<Vec<(String, Vec<SelectionNode>)>, PlanError> {
    let mut groups: Vec<(String, Vec<SelectionNode>)> = Vec::new();

    for sel in &doc.selections {
        let field = schema
            .field(root_type, &sel.name)
            .ok_or_else(|| PlanError::UnknownField {
                type_name: root_type.to_string(),
                field: sel.name.clone(),
            })?;
        let owners = &field.owners;

        let target = match groups.last() {
            Some((subgraph, _)) if owners.contains(subgraph) => Some(groups.len() - 1),
            _ if doc.kind == OperationKind::Query => groups
                .iter()
                .enumerate()
                .filter(|(_, (subgraph, _))| owners.contains(subgraph))
                .max_by_key(|(_, (_, sels))| sels.len())
                .map(|(i, _)| i),
            _ => None,
        };

        match target {
            Some(i) => groups[i].1.push(sel.clone()),
            None => {
                let owner = owners
                    .iter()
                    .min_by_key(|o| schema.declaration_index(o))
                    .ok_or_else(|| PlanError::UnreachableField {
                        type_name: root_type.to_string(),
                        field: sel.name.clone(),
                    })?;
                groups.push((owner.clone(), vec![sel.clone()]));
            }
        }
    }

    Ok(groups)
}

/// Splits one selection set against `subgraph`: selections the subgraph can
/// resolve are kept (recursively), foreign selections are grouped per owner
/// into pending entity fetches rooted at `path`, and the enclosing entity's
/// key fields are injected so the fetches can be joined.
fn split_set(
    selections: &[SelectionNode],
    enclosing_type: &str,
    subgraph: &str,
    path: &[String],
    schema: &UnifiedSchema,
    pending: &mut Vec<PendingEntity>,
) -> Result<Vec<SelectionNode>, PlanError> {
    let mut local = Vec::new();
    let mut foreign: Vec<(String, Vec<SelectionNode>)> = Vec::new();

    for sel in selections {
        if sel.name == "__typename" {
            local.push(sel.clone());
            continue;
        }

        let field = match schema.field(enclosing_type, &sel.name) {
            Some(field) => field,
            None => return Err(unresolvable(schema, enclosing_type, &sel.name)),
        };

        if field.owners.iter().any(|o| o == subgraph) {
            let mut child_path = path.to_vec();
            child_path.push(sel.response_key().to_string());
            let children = if sel.children.is_empty() {
                Vec::new()
            } else {
                split_set(
                    &sel.children,
                    &field.base_type,
                    subgraph,
                    &child_path,
                    schema,
                    pending,
                )?
            };
            local.push(SelectionNode {
                children,
                ..sel.clone()
            });
        } else {
            // Owned elsewhere: joins the enclosing entity via its keys.
            let owner = choose_foreign_owner(&field.owners, &foreign, schema);
            match foreign.iter_mut().find(|(o, _)| *o == owner) {
                Some((_, sels)) => sels.push(sel.clone()),
                None => foreign.push((owner, vec![sel.clone()])),
            }
        }
    }

    if !foreign.is_empty() {
        let keys = schema.entity_keys(enclosing_type).ok_or_else(|| {
            PlanError::UnreachableField {
                type_name: enclosing_type.to_string(),
                field: foreign[0].1[0].name.clone(),
            }
        })?;
        for key in keys {
            let requested = local
                .iter()
                .any(|s| s.alias.is_none() && s.name == *key);
            if !requested {
                local.push(SelectionNode::injected_key(key));
            }
        }
        for (owner, selections) in foreign {
            pending.push(PendingEntity {
                parent: 0, // rewritten by the caller
                path: path.to_vec(),
                type_name: enclosing_type.to_string(),
                owner,
                selections,
            });
        }
    }

    Ok(local)
}

/// A field lookup miss on a union or interface is a selection on one of its
/// concrete members (spliced from a fragment), which the ownership model
/// cannot resolve; everywhere else it is a plain unknown field.
fn unresolvable(schema: &UnifiedSchema, type_name: &str, field: &str) -> PlanError {
    match schema.type_def(type_name).map(|t| t.kind) {
        Some(TypeKind::Union) | Some(TypeKind::Interface) => PlanError::AbstractSelection {
            type_name: type_name.to_string(),
            field: field.to_string(),
        },
        _ => PlanError::UnknownField {
            type_name: type_name.to_string(),
            field: field.to_string(),
        },
    }
}

/// Shareable tie-break for foreign fields: stay with an owner that already
/// has the largest pending group, fall back to declaration order.
fn choose_foreign_owner(
    owners: &[String],
    foreign: &[(String, Vec<SelectionNode>)],
    schema: &UnifiedSchema,
) -> String {
    foreign
        .iter()
        .filter(|(o, _)| owners.contains(o))
        .max_by_key(|(_, sels)| sels.len())
        .map(|(o, _)| o.clone())
        .unwrap_or_else(|| {
            owners
                .iter()
                .min_by_key(|o| schema.declaration_index(o))
                .cloned()
                .unwrap_or_default()
        })
}

fn render_variable_defs(doc: &QueryDocument, used: &[String], extra: &str) -> String {
    let mut defs: Vec<String> = Vec::new();
    if !extra.is_empty() {
        defs.push(extra.to_string());
    }
    for def in &doc.variable_defs {
        if used.contains(&def.name) {
            defs.push(format!("${}: {}", def.name, def.ty));
        }
    }
    if defs.is_empty() {
        String::new()
    } else {
        format!("({})", defs.join(", "))
    }
}

fn render_root_operation(
    doc: &QueryDocument,
    variables: &[String],
    selections: &[SelectionNode],
) -> String {
    let keyword = match doc.kind {
        OperationKind::Query => "query",
        OperationKind::Mutation => "mutation",
    };
    format!(
        "{keyword}{} {}",
        render_variable_defs(doc, variables, ""),
        render_selection_set(selections)
    )
}

fn render_entity_operation(
    doc: &QueryDocument,
    variables: &[String],
    type_name: &str,
    selections: &[SelectionNode],
) -> String {
    format!(
        "query{} {{ _entities(representations: $representations) {{ ... on {type_name} {} }} }}",
        render_variable_defs(doc, variables, "$representations: [_Any!]!"),
        render_selection_set(selections)
    )
}
