//! Client query parsing.
//!
//! The gateway parses the submitted query text once into an owned selection
//! tree. Named fragments and inline fragments are expanded during parsing so
//! the planner only ever sees plain nested field selections. The tree is
//! immutable afterwards; the planner builds per-subgraph sub-operations by
//! rendering slices of it back to GraphQL text.

use std::collections::{BTreeMap, BTreeSet};

use graphql_parser::query::{
    Definition, OperationDefinition, Selection, SelectionSet, Type, Value, parse_query,
};

use crate::error::PlanError;

const MAX_FRAGMENT_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

/// One argument of a field selection, kept as rendered GraphQL text plus the
/// client variable names it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: String,
    pub value: String,
    pub variables: Vec<String>,
}

/// One field in the client's selection tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionNode {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<Argument>,
    pub children: Vec<SelectionNode>,
    /// True for key fields the planner added that the client did not ask
    /// for. Injected fields never appear in the final response.
    pub injected: bool,
}

impl SelectionNode {
    pub fn injected_key(name: &str) -> Self {
        SelectionNode {
            alias: None,
            name: name.to_string(),
            arguments: Vec::new(),
            children: Vec::new(),
            injected: true,
        }
    }

    /// The key this field occupies in the response object.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    fn collect_variables(&self, into: &mut BTreeSet<String>) {
        for arg in &self.arguments {
            into.extend(arg.variables.iter().cloned());
        }
        for child in &self.children {
            child.collect_variables(into);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDef {
    pub name: String,
    pub ty: String,
}

/// A parsed client operation: kind, variable definitions and the expanded
/// selection tree. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDocument {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variable_defs: Vec<VariableDef>,
    pub selections: Vec<SelectionNode>,
}

impl QueryDocument {
    /// Parses the query text and selects the operation to execute. An
    /// `operation_name` is required when the document defines more than one
    /// operation.
    pub fn parse(text: &str, operation_name: Option<&str>) -> Result<Self, PlanError> {
        let document =
            parse_query::<String>(text).map_err(|e| PlanError::Parse(e.to_string()))?;

        let mut fragments: BTreeMap<String, &SelectionSet<'_, String>> = BTreeMap::new();
        let mut operations = Vec::new();
        for definition in &document.definitions {
            match definition {
                Definition::Operation(op) => operations.push(op),
                Definition::Fragment(frag) => {
                    fragments.insert(frag.name.clone(), &frag.selection_set);
                }
            }
        }

        let operation = select_operation(&operations, operation_name)?;

        let (kind, name, variable_definitions, selection_set) = match operation {
            OperationDefinition::SelectionSet(set) => (OperationKind::Query, None, &[][..], set),
            OperationDefinition::Query(q) => (
                OperationKind::Query,
                q.name.clone(),
                q.variable_definitions.as_slice(),
                &q.selection_set,
            ),
            OperationDefinition::Mutation(m) => (
                OperationKind::Mutation,
                m.name.clone(),
                m.variable_definitions.as_slice(),
                &m.selection_set,
            ),
            OperationDefinition::Subscription(_) => {
                return Err(PlanError::SubscriptionUnsupported);
            }
        };

        let variable_defs = variable_definitions
            .iter()
            .map(|def| VariableDef {
                name: def.name.clone(),
                ty: render_type(&def.var_type),
            })
            .collect();

        let mut stack = Vec::new();
        let selections = expand_selection_set(selection_set, &fragments, &mut stack)?;

        Ok(QueryDocument {
            kind,
            name,
            variable_defs,
            selections,
        })
    }

    /// Variable names referenced anywhere in the given selections, in the
    /// order the client declared them.
    pub fn variables_used(&self, selections: &[SelectionNode]) -> Vec<String> {
        let mut used = BTreeSet::new();
        for sel in selections {
            sel.collect_variables(&mut used);
        }
        self.variable_defs
            .iter()
            .filter(|def| used.contains(&def.name))
            .map(|def| def.name.clone())
            .collect()
    }
}

fn select_operation<'a, 'doc>(
    operations: &[&'a OperationDefinition<'doc, String>],
    operation_name: Option<&str>,
) -> Result<&'a OperationDefinition<'doc, String>, PlanError> {
    match operation_name {
        Some(wanted) => operations
            .iter()
            .find(|op| definition_name(op) == Some(wanted))
            .copied()
            .ok_or_else(|| PlanError::UnknownOperation(wanted.to_string())),
        None => match operations {
            [] => Err(PlanError::NoOperation),
            [single] => Ok(single),
            _ => Err(PlanError::AmbiguousOperation),
        },
    }
}

fn definition_name<'a>(op: &'a OperationDefinition<'_, String>) -> Option<&'a str> {
    match op {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

fn expand_selection_set<'doc>(
    set: &SelectionSet<'doc, String>,
    fragments: &BTreeMap<String, &SelectionSet<'doc, String>>,
    stack: &mut Vec<String>,
) -> Result<Vec<SelectionNode>, PlanError> {
    if stack.len() > MAX_FRAGMENT_DEPTH {
        return Err(PlanError::FragmentCycle(
            stack.last().cloned().unwrap_or_default(),
        ));
    }

    let mut out = Vec::new();
    for item in &set.items {
        match item {
            Selection::Field(field) => {
                let arguments = field
                    .arguments
                    .iter()
                    .map(|(name, value)| {
                        let mut variables = Vec::new();
                        collect_value_variables(value, &mut variables);
                        Argument {
                            name: name.clone(),
                            value: render_value(value),
                            variables,
                        }
                    })
                    .collect();
                out.push(SelectionNode {
                    alias: field.alias.clone(),
                    name: field.name.clone(),
                    arguments,
                    children: expand_selection_set(&field.selection_set, fragments, stack)?,
                    injected: false,
                });
            }
            Selection::FragmentSpread(spread) => {
                if stack.contains(&spread.fragment_name) {
                    return Err(PlanError::FragmentCycle(spread.fragment_name.clone()));
                }
                let fragment = fragments
                    .get(&spread.fragment_name)
                    .ok_or_else(|| PlanError::UnknownFragment(spread.fragment_name.clone()))?;
                stack.push(spread.fragment_name.clone());
                out.extend(expand_selection_set(fragment, fragments, stack)?);
                stack.pop();
            }
            Selection::InlineFragment(inline) => {
                // Type conditions are not tracked; the selections are spliced
                // into the enclosing set and validated against the unified
                // schema during planning.
                out.extend(expand_selection_set(&inline.selection_set, fragments, stack)?);
            }
        }
    }
    Ok(out)
}

fn collect_value_variables(value: &Value<'_, String>, into: &mut Vec<String>) {
    match value {
        Value::Variable(name) => {
            if !into.contains(name) {
                into.push(name.clone());
            }
        }
        Value::List(items) => {
            for item in items {
                collect_value_variables(item, into);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_value_variables(item, into);
            }
        }
        _ => {}
    }
}

/// Renders an argument value back to GraphQL literal syntax.
pub(crate) fn render_value(value: &Value<'_, String>) -> String {
    match value {
        Value::Variable(name) => format!("${name}"),
        Value::Int(n) => n.as_i64().map(|i| i.to_string()).unwrap_or_else(|| "0".to_string()),
        Value::Float(f) => f.to_string(),
        // GraphQL string escaping matches the JSON rules.
        Value::String(s) => serde_json::Value::String(s.clone()).to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Enum(name) => name.clone(),
        Value::List(items) => {
            let inner: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{k}: {}", render_value(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

/// Renders a GraphQL type reference such as `[Device!]!`.
pub(crate) fn render_type(ty: &Type<'_, String>) -> String {
    match ty {
        Type::NamedType(name) => name.clone(),
        Type::ListType(inner) => format!("[{}]", render_type(inner)),
        Type::NonNullType(inner) => format!("{}!", render_type(inner)),
    }
}

/// The innermost named type of a type reference.
pub(crate) fn base_type_name(ty: &Type<'_, String>) -> String {
    match ty {
        Type::NamedType(name) => name.clone(),
        Type::ListType(inner) | Type::NonNullType(inner) => base_type_name(inner),
    }
}

/// Renders a selection set back to GraphQL text, e.g.
/// `{ device(id: $id) { status id } }`.
pub(crate) fn render_selection_set(selections: &[SelectionNode]) -> String {
    let mut out = String::from("{ ");
    for sel in selections {
        render_selection(sel, &mut out);
        out.push(' ');
    }
    out.push('}');
    out
}

fn render_selection(sel: &SelectionNode, out: &mut String) {
    if let Some(alias) = &sel.alias {
        out.push_str(alias);
        out.push_str(": ");
    }
    out.push_str(&sel.name);
    if !sel.arguments.is_empty() {
        out.push('(');
        for (i, arg) in sel.arguments.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&arg.name);
            out.push_str(": ");
            out.push_str(&arg.value);
        }
        out.push(')');
    }
    if !sel.children.is_empty() {
        out.push(' ');
        out.push_str(&render_selection_set(&sel.children));
    }
}
