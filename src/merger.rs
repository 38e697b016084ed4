//! Response merging: assembles the partial results into one response tree
//! shaped exactly like the client's original selection set.
//!
//! Node results are folded into a working tree in plan order (parents
//! before dependents), entity results joining back by representation index.
//! The working tree is then projected through the client's selection tree,
//! which restores client field order and drops the key fields the planner
//! injected. Merging never fails: an errored or missing contributor leaves
//! null at its path plus an appended error record naming the subgraph.

use serde_json::{Map, Value, json};

use crate::executor::PartialResult;
use crate::planner::{ExecutionPlan, PlanNode};
use crate::query::{QueryDocument, SelectionNode};
use crate::{GatewayResponse, GraphQLError, PathSegment};

/// Merges every node's partial result into the final gateway response.
pub fn merge(
    results: &[PartialResult],
    doc: &QueryDocument,
    plan: &ExecutionPlan,
) -> GatewayResponse {
    let mut working = Value::Object(Map::new());
    let mut errors = Vec::new();

    for node in &plan.nodes {
        let result = &results[node.id];
        match &result.outcome {
            Ok(data) => {
                apply_node_data(&mut working, node, data);
                for upstream in &result.upstream_errors {
                    errors.push(remap_upstream_error(upstream, node));
                }
            }
            Err(error) => {
                record_failure(&mut working, node, &error.to_string(), &mut errors);
            }
        }
    }

    GatewayResponse {
        data: Some(project(&working, &doc.selections)),
        errors,
    }
}

fn apply_node_data(working: &mut Value, node: &PlanNode, data: &Value) {
    match &node.entity {
        None => {
            if data.is_object() {
                deep_merge(working, data);
            }
        }
        Some(entity) => {
            let entities = match data.get("_entities").and_then(Value::as_array) {
                Some(entities) => entities,
                None => return,
            };
            // Pair targets with entities in representation order, skipping
            // exactly the values the executor could not represent.
            let mut entities = entities.iter();
            for target in collect_at_path_mut(working, &node.merge_path) {
                let representable = target
                    .as_object()
                    .map(|o| entity.key_fields.iter().all(|k| o.contains_key(k)))
                    .unwrap_or(false);
                if !representable {
                    continue;
                }
                let resolved = match entities.next() {
                    Some(resolved) => resolved,
                    None => break,
                };
                if resolved.is_object() {
                    deep_merge(target, resolved);
                }
            }
        }
    }
}

/// Writes null at each of the failed node's response paths and appends one
/// error record per selection, tagged with the subgraph at fault.
fn record_failure(
    working: &mut Value,
    node: &PlanNode,
    message: &str,
    errors: &mut Vec<GraphQLError>,
) {
    for sel in &node.selections {
        if sel.injected {
            continue;
        }
        let key = sel.response_key().to_string();
        for target in collect_at_path_mut(working, &node.merge_path) {
            if let Value::Object(object) = target {
                object.insert(key.clone(), Value::Null);
            }
        }

        let mut path: Vec<PathSegment> = node
            .merge_path
            .iter()
            .map(|p| PathSegment::Field(p.clone()))
            .collect();
        path.push(PathSegment::Field(key));
        errors.push(GraphQLError {
            message: message.to_string(),
            path: Some(path),
            extensions: Some(json!({ "subgraph": node.subgraph })),
        });
    }
}

/// Carries a subgraph's own GraphQL error through to the client, rebased
/// onto the node's merge path and tagged with the subgraph name.
fn remap_upstream_error(upstream: &Value, node: &PlanNode) -> GraphQLError {
    let message = upstream
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("subgraph error")
        .to_string();

    let upstream_path: Vec<PathSegment> = upstream
        .get("path")
        .and_then(Value::as_array)
        .map(|segments| {
            segments
                .iter()
                .filter_map(|seg| match seg {
                    Value::String(s) => Some(PathSegment::Field(s.clone())),
                    Value::Number(n) => n.as_u64().map(|i| PathSegment::Index(i as usize)),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let path = if node.entity.is_some() {
        // Entity errors arrive as ["_entities", <index>, ...]; rebase the
        // tail onto the node's merge path.
        let tail: Vec<PathSegment> = upstream_path
            .iter()
            .skip_while(|seg| matches!(seg, PathSegment::Field(f) if f == "_entities"))
            .skip_while(|seg| matches!(seg, PathSegment::Index(_)))
            .cloned()
            .collect();
        let mut path: Vec<PathSegment> = node
            .merge_path
            .iter()
            .map(|p| PathSegment::Field(p.clone()))
            .collect();
        path.extend(tail);
        Some(path)
    } else if upstream_path.is_empty() {
        None
    } else {
        Some(upstream_path)
    };

    let mut extensions = match upstream.get("extensions") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    extensions.insert("subgraph".to_string(), Value::String(node.subgraph.clone()));

    GraphQLError {
        message,
        path,
        extensions: Some(Value::Object(extensions)),
    }
}

/// Deep merge of `src` into `dst`: objects merge per key, arrays zip by
/// index, scalars fill only where `dst` has nothing yet. Shareable fields
/// resolved by several subgraphs carry equal values, so first-write-wins is
/// sufficient.
fn deep_merge(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, src_value) in src_map {
                match dst_map.get_mut(key) {
                    Some(dst_value) => deep_merge(dst_value, src_value),
                    None => {
                        dst_map.insert(key.clone(), src_value.clone());
                    }
                }
            }
        }
        (Value::Array(dst_items), Value::Array(src_items)) => {
            for (dst_item, src_item) in dst_items.iter_mut().zip(src_items) {
                deep_merge(dst_item, src_item);
            }
        }
        (dst_slot @ Value::Null, src_value) => {
            *dst_slot = src_value.clone();
        }
        _ => {}
    }
}

/// All values reachable at `path`, flattening lists along the way. A list
/// at the leaf yields its elements.
pub(crate) fn collect_at_path<'a>(value: &'a Value, path: &[String]) -> Vec<&'a Value> {
    if let Value::Array(items) = value {
        return items
            .iter()
            .flat_map(|item| collect_at_path(item, path))
            .collect();
    }
    match path.split_first() {
        None => vec![value],
        Some((head, rest)) => match value {
            Value::Object(map) => match map.get(head) {
                Some(child) => collect_at_path(child, rest),
                None => Vec::new(),
            },
            _ => Vec::new(),
        },
    }
}

pub(crate) fn collect_at_path_mut<'a>(
    value: &'a mut Value,
    path: &[String],
) -> Vec<&'a mut Value> {
    if let Value::Array(items) = value {
        return items
            .iter_mut()
            .flat_map(|item| collect_at_path_mut(item, path))
            .collect();
    }
    match path.split_first() {
        None => vec![value],
        Some((head, rest)) => match value {
            Value::Object(map) => match map.get_mut(head) {
                Some(child) => collect_at_path_mut(child, rest),
                None => Vec::new(),
            },
            _ => Vec::new(),
        },
    }
}

/// Projects the working tree through the client's selection tree: output
/// fields follow client selection order, planner-injected keys disappear,
/// and anything no contributor produced becomes null.
fn project(value: &Value, selections: &[SelectionNode]) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| project(item, selections))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for sel in selections {
                if sel.injected {
                    continue;
                }
                let key = sel.response_key();
                let projected = match map.get(key) {
                    Some(child) if !sel.children.is_empty() => project(child, &sel.children),
                    Some(child) => child.clone(),
                    None => Value::Null,
                };
                out.insert(key.to_string(), projected);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}
