//! Plan execution: dispatches sub-operations to their subgraphs with
//! maximal parallelism under the plan's dependency edges.
//!
//! Every node with no unmet prerequisite is in flight concurrently; a
//! dependent node is released the moment its direct prerequisites finish.
//! Outbound concurrency is bounded per subgraph by a semaphore pool so one
//! slow subgraph cannot absorb the gateway's capacity; pool exhaustion is
//! charged to that subgraph as a timeout. A failed node records an error
//! result and its dependents are skipped without being dispatched; sibling
//! nodes proceed unaffected.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::SubgraphSettings;
use crate::error::ExecutionError;
use crate::merger::collect_at_path;
use crate::planner::{ExecutionPlan, PlanNode};
use crate::query::OperationKind;
use crate::schema::UnifiedSchema;
use crate::transport::{SubgraphRequest, SubgraphTransport};

/// Per-request inputs: variable bindings and the opaque auth headers to
/// forward to every subgraph.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub variables: Map<String, Value>,
    pub headers: HashMap<String, String>,
}

/// The outcome of one plan node.
#[derive(Debug, Clone)]
pub struct PartialResult {
    pub node_id: usize,
    pub outcome: Result<Value, ExecutionError>,
    /// GraphQL errors the subgraph itself reported alongside its data.
    pub upstream_errors: Vec<Value>,
    pub latency: Duration,
}

impl PartialResult {
    fn failed(node_id: usize, error: ExecutionError, latency: Duration) -> Self {
        PartialResult {
            node_id,
            outcome: Err(error),
            upstream_errors: Vec::new(),
            latency,
        }
    }
}

pub struct Executor {
    transport: Arc<dyn SubgraphTransport>,
    defaults: SubgraphSettings,
    overrides: BTreeMap<String, SubgraphSettings>,
    pools: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Executor {
    pub fn new(
        transport: Arc<dyn SubgraphTransport>,
        defaults: SubgraphSettings,
        overrides: BTreeMap<String, SubgraphSettings>,
    ) -> Self {
        Executor {
            transport,
            defaults,
            overrides,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn settings_for(&self, subgraph: &str) -> SubgraphSettings {
        self.overrides
            .get(subgraph)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Pools outlive requests: the bound applies across every concurrent
    /// client request touching the subgraph.
    fn pool_for(&self, subgraph: &str, size: usize) -> Arc<Semaphore> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools
            .entry(subgraph.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(size)))
            .clone()
    }

    /// Runs the whole plan, returning one [`PartialResult`] per node,
    /// indexed by node id. Never fails as a whole: every per-node failure
    /// is recorded in its result.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        schema: &UnifiedSchema,
        ctx: &RequestContext,
    ) -> Vec<PartialResult> {
        let n = plan.nodes.len();
        let mut results: Vec<Option<PartialResult>> = (0..n).map(|_| None).collect();

        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for node in &plan.nodes {
            indegree[node.id] = node.depends_on.len();
            for &dep in &node.depends_on {
                dependents[dep].push(node.id);
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while let Some(id) = ready.pop_front() {
                let node = &plan.nodes[id];

                if let Some(result) = self.resolve_locally(node, plan, &results) {
                    debug!(node = id, subgraph = %node.subgraph, "node resolved without dispatch");
                    results[id] = Some(result);
                    release_dependents(id, &dependents, &mut indegree, &mut ready);
                    continue;
                }

                match self.prepare_dispatch(node, plan, schema, ctx, &results) {
                    Ok((url, variables)) => {
                        in_flight.push(self.dispatch(node, url, variables, ctx.headers.clone()));
                    }
                    Err(error) => {
                        results[id] =
                            Some(PartialResult::failed(id, error, Duration::ZERO));
                        release_dependents(id, &dependents, &mut indegree, &mut ready);
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }
            if let Some(result) = in_flight.next().await {
                let id = result.node_id;
                results[id] = Some(result);
                release_dependents(id, &dependents, &mut indegree, &mut ready);
            }
        }

        // The loop above fills every slot; the fallback marks a node the
        // scheduler never reached without blaming a prerequisite.
        results
            .into_iter()
            .enumerate()
            .map(|(id, r)| {
                r.unwrap_or_else(|| {
                    PartialResult::failed(
                        id,
                        ExecutionError::NotDispatched {
                            subgraph: plan.nodes[id].subgraph.clone(),
                        },
                        Duration::ZERO,
                    )
                })
            })
            .collect()
    }

    /// Nodes that complete without a network dispatch: a prerequisite
    /// failed, or an entity fetch has nothing to resolve.
    fn resolve_locally(
        &self,
        node: &PlanNode,
        plan: &ExecutionPlan,
        results: &[Option<PartialResult>],
    ) -> Option<PartialResult> {
        for &dep in &node.depends_on {
            let failed = matches!(
                results[dep],
                Some(PartialResult {
                    outcome: Err(_),
                    ..
                })
            );
            if failed {
                return Some(PartialResult::failed(
                    node.id,
                    ExecutionError::SkippedDependency {
                        failed_subgraph: plan.nodes[dep].subgraph.clone(),
                    },
                    Duration::ZERO,
                ));
            }
        }

        if let Some(entity) = &node.entity {
            let representations =
                build_representations(node, entity.parent, plan, results);
            if representations.is_empty() {
                return Some(PartialResult {
                    node_id: node.id,
                    outcome: Ok(json!({ "_entities": [] })),
                    upstream_errors: Vec::new(),
                    latency: Duration::ZERO,
                });
            }
        }
        None
    }

    fn prepare_dispatch(
        &self,
        node: &PlanNode,
        plan: &ExecutionPlan,
        schema: &UnifiedSchema,
        ctx: &RequestContext,
        results: &[Option<PartialResult>],
    ) -> Result<(String, Map<String, Value>), ExecutionError> {
        let url = schema
            .subgraph_url(&node.subgraph)
            .ok_or_else(|| ExecutionError::Transport {
                subgraph: node.subgraph.clone(),
                reason: "subgraph is not part of the unified schema".to_string(),
            })?
            .to_string();

        let mut variables = Map::new();
        if let Some(entity) = &node.entity {
            let representations =
                build_representations(node, entity.parent, plan, results);
            variables.insert("representations".to_string(), Value::Array(representations));
        }
        for name in &node.variables {
            if let Some(value) = ctx.variables.get(name) {
                variables.insert(name.clone(), value.clone());
            }
        }
        Ok((url, variables))
    }

    async fn dispatch(
        &self,
        node: &PlanNode,
        url: String,
        variables: Map<String, Value>,
        headers: HashMap<String, String>,
    ) -> PartialResult {
        let settings = self.settings_for(&node.subgraph);
        let start = Instant::now();

        let pool = self.pool_for(&node.subgraph, settings.pool_size);
        let permit = timeout(
            Duration::from_millis(settings.pool_wait_ms),
            pool.acquire_owned(),
        )
        .await;
        let _permit = match permit {
            Ok(Ok(permit)) => permit,
            _ => {
                warn!(node = node.id, subgraph = %node.subgraph, "pool exhausted");
                return PartialResult::failed(
                    node.id,
                    ExecutionError::PoolExhausted {
                        subgraph: node.subgraph.clone(),
                    },
                    start.elapsed(),
                );
            }
        };

        let request = SubgraphRequest {
            query: node.operation.clone(),
            variables: Value::Object(variables),
            headers,
        };

        // Only reads are idempotent; a mutation gets exactly one attempt.
        let attempts = match node.kind {
            OperationKind::Query => settings.retry_attempts.max(1),
            OperationKind::Mutation => 1,
        };
        let mut last_error = ExecutionError::Transport {
            subgraph: node.subgraph.clone(),
            reason: "not dispatched".to_string(),
        };

        for attempt in 1..=attempts {
            let call = self
                .transport
                .execute(&node.subgraph, &url, request.clone());
            match timeout(Duration::from_millis(settings.timeout_ms), call).await {
                Ok(Ok(body)) => {
                    let upstream_errors = body
                        .get("errors")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let data = body.get("data").cloned().unwrap_or(Value::Null);
                    debug!(
                        node = node.id,
                        subgraph = %node.subgraph,
                        latency_ms = start.elapsed().as_millis() as u64,
                        "sub-operation completed"
                    );
                    return PartialResult {
                        node_id: node.id,
                        outcome: Ok(data),
                        upstream_errors,
                        latency: start.elapsed(),
                    };
                }
                Ok(Err(e)) => {
                    last_error = ExecutionError::Transport {
                        subgraph: node.subgraph.clone(),
                        reason: e.to_string(),
                    };
                }
                Err(_) => {
                    last_error = ExecutionError::Timeout {
                        subgraph: node.subgraph.clone(),
                        elapsed_ms: settings.timeout_ms,
                    };
                }
            }
            if attempt < attempts {
                let backoff = settings.retry_backoff_ms.saturating_mul(1 << (attempt - 1));
                sleep(Duration::from_millis(backoff)).await;
            }
        }

        warn!(
            node = node.id,
            subgraph = %node.subgraph,
            error = %last_error,
            "sub-operation failed"
        );
        PartialResult::failed(node.id, last_error, start.elapsed())
    }
}

fn release_dependents(
    id: usize,
    dependents: &[Vec<usize>],
    indegree: &mut [usize],
    ready: &mut VecDeque<usize>,
) {
    for &dep in &dependents[id] {
        indegree[dep] -= 1;
        if indegree[dep] == 0 {
            ready.push_back(dep);
        }
    }
}

/// Builds the `_Any` representations for an entity node from the parent
/// node's data: every object found at the node's merge path relative to the
/// parent, keyed by `__typename` plus the entity's key fields. Order is
/// significant: `_entities` results come back in representation order.
fn build_representations(
    node: &PlanNode,
    parent: usize,
    plan: &ExecutionPlan,
    results: &[Option<PartialResult>],
) -> Vec<Value> {
    let entity = match &node.entity {
        Some(entity) => entity,
        None => return Vec::new(),
    };
    let parent_node = &plan.nodes[parent];
    let parent_data = match &results[parent] {
        Some(PartialResult {
            outcome: Ok(data), ..
        }) => data,
        _ => return Vec::new(),
    };

    // An entity parent's addressable output is its `_entities` list.
    let effective = if parent_node.entity.is_some() {
        match parent_data.get("_entities") {
            Some(entities) => entities,
            None => return Vec::new(),
        }
    } else {
        parent_data
    };
    let relative = &node.merge_path[parent_node.merge_path.len()..];

    let mut representations = Vec::new();
    for value in collect_at_path(effective, relative) {
        let object = match value.as_object() {
            Some(object) => object,
            None => continue,
        };
        let mut representation = Map::new();
        representation.insert(
            "__typename".to_string(),
            Value::String(entity.type_name.clone()),
        );
        let mut complete = true;
        for key in &entity.key_fields {
            match object.get(key) {
                Some(v) => {
                    representation.insert(key.clone(), v.clone());
                }
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            representations.push(Value::Object(representation));
        }
    }
    representations
}
