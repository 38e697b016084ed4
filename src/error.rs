use thiserror::Error;

/// Failure to obtain a subgraph's schema document during introspection.
///
/// Fetch errors are isolated per subgraph: the registry keeps fetching the
/// remaining subgraphs and only surfaces an error here when the configured
/// refresh policy demands it.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("subgraph `{subgraph}` introspection failed after {attempts} attempt(s): {reason}")]
    Unreachable {
        subgraph: String,
        attempts: u32,
        reason: String,
    },

    #[error("subgraph `{subgraph}` returned an introspection response without SDL")]
    MissingSdl { subgraph: String },

    /// A subgraph that previously served a schema is gone and the refresh
    /// policy is fail-closed.
    #[error("previously healthy subgraph `{subgraph}` is unreachable: {reason}")]
    Disappeared { subgraph: String, reason: String },

    #[error("failed to read schema file for subgraph `{subgraph}`: {reason}")]
    SchemaFile { subgraph: String, reason: String },
}

/// A single irreconcilable disagreement between subgraph schemas.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Conflict {
    #[error("type `{type_name}` is declared as {left_kind} in `{left}` but as {right_kind} in `{right}`")]
    KindMismatch {
        type_name: String,
        left: String,
        left_kind: String,
        right: String,
        right_kind: String,
    },

    #[error("entity `{type_name}` declares key `{left_key}` in `{left}` but `{right_key}` in `{right}`")]
    KeyMismatch {
        type_name: String,
        left: String,
        left_key: String,
        right: String,
        right_key: String,
    },

    #[error("field `{type_name}.{field}` is claimed by both `{left}` and `{right}` and is not shareable")]
    DuplicateField {
        type_name: String,
        field: String,
        left: String,
        right: String,
    },

    #[error("field `{type_name}.{field}` has type `{left_type}` in `{left}` but `{right_type}` in `{right}`")]
    FieldTypeMismatch {
        type_name: String,
        field: String,
        left: String,
        left_type: String,
        right: String,
        right_type: String,
    },

    #[error("subgraph `{subgraph}` published invalid SDL: {reason}")]
    InvalidSdl { subgraph: String, reason: String },
}

/// Composition failed. Carries every conflict found, not just the first, so
/// operators can fix a broken deployment in one pass. No partial schema is
/// ever published from a failed composition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("schema composition failed with {} conflict(s)", conflicts.len())]
pub struct CompositionError {
    pub conflicts: Vec<Conflict>,
}

/// The client's query cannot be satisfied against the current unified
/// schema. Planning failure is all-or-nothing: the whole request fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("failed to parse query: {0}")]
    Parse(String),

    #[error("operation `{0}` not found in document")]
    UnknownOperation(String),

    #[error("operation name required when the document defines multiple operations")]
    AmbiguousOperation,

    #[error("query document contains no executable operation")]
    NoOperation,

    #[error("fragment `{0}` is not defined")]
    UnknownFragment(String),

    #[error("fragment cycle detected through `{0}`")]
    FragmentCycle(String),

    #[error("subscriptions are not supported")]
    SubscriptionUnsupported,

    #[error("unknown field `{field}` on type `{type_name}`")]
    UnknownField { type_name: String, field: String },

    #[error(
        "field `{field}` on type `{type_name}` cannot be reached: no subgraph can resolve it with the available entity keys"
    )]
    UnreachableField { type_name: String, field: String },

    #[error(
        "field `{field}` is not declared on abstract type `{type_name}`; selections on its concrete members are not supported"
    )]
    AbstractSelection { type_name: String, field: String },
}

/// A failure scoped to a single plan node. Never aborts the whole plan:
/// the merger turns it into a null subtree plus an error record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("subgraph `{subgraph}` request failed: {reason}")]
    Transport { subgraph: String, reason: String },

    #[error("subgraph `{subgraph}` timed out after {elapsed_ms}ms")]
    Timeout { subgraph: String, elapsed_ms: u64 },

    #[error("connection pool for subgraph `{subgraph}` is exhausted")]
    PoolExhausted { subgraph: String },

    #[error("not executed: prerequisite fetch from subgraph `{failed_subgraph}` failed")]
    SkippedDependency { failed_subgraph: String },

    /// The scheduler finished without ever reaching this node.
    #[error("sub-operation for subgraph `{subgraph}` was never dispatched")]
    NotDispatched { subgraph: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Outcome of a registry fetch plus recomposition cycle.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Composition(#[from] CompositionError),
}
