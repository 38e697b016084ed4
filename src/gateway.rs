//! The gateway façade: one entry point per client request, plus the
//! refresh cycle that keeps the unified schema current.
//!
//! The current [`UnifiedSchema`] is published through a watch channel. A
//! request clones the `Arc` once and keeps that version for its whole
//! lifetime; recomposition swaps the channel value atomically and never
//! disturbs in-flight requests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::composer;
use crate::config::GatewayConfig;
use crate::error::RefreshError;
use crate::executor::{Executor, RequestContext};
use crate::planner;
use crate::query::QueryDocument;
use crate::registry::{SchemaRegistry, SubgraphDescriptor, SubgraphEndpoint};
use crate::schema::UnifiedSchema;
use crate::transport::SubgraphTransport;
use crate::{GatewayResponse, GraphQLRequest, merger};

pub struct Gateway {
    registry: SchemaRegistry,
    executor: Executor,
    endpoints: Vec<SubgraphEndpoint>,
    current: watch::Sender<Option<Arc<UnifiedSchema>>>,
    request_deadline: Duration,
}

impl Gateway {
    pub fn new(config: &GatewayConfig, transport: Arc<dyn SubgraphTransport>) -> Self {
        let endpoints = config.endpoints();
        let overrides: BTreeMap<_, _> = endpoints
            .iter()
            .map(|e| (e.name.clone(), e.settings.clone()))
            .collect();
        let registry = SchemaRegistry::new(transport.clone(), config.refresh_policy);
        let executor = Executor::new(transport, config.defaults.clone(), overrides);
        let (current, _) = watch::channel(None);

        Gateway {
            registry,
            executor,
            endpoints,
            current,
            request_deadline: Duration::from_millis(config.request_deadline_ms),
        }
    }

    /// The currently published schema version, if composition has succeeded
    /// at least once.
    pub fn schema(&self) -> Option<Arc<UnifiedSchema>> {
        self.current.borrow().clone()
    }

    /// Observes schema publications; receivers always read the latest
    /// version without blocking in-flight requests.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<UnifiedSchema>>> {
        self.current.subscribe()
    }

    /// The registry's descriptor table, for health reporting.
    pub async fn descriptors(&self) -> BTreeMap<String, SubgraphDescriptor> {
        self.registry.snapshot().await
    }

    /// Fetches every subgraph schema and recomposes. Publishes a new
    /// unified schema only when composition fully succeeds and the result
    /// differs from the current version; on any error the previous schema
    /// stays live. Returns whether a new version was published.
    pub async fn refresh(&self) -> Result<bool, RefreshError> {
        let descriptors = self.registry.fetch(&self.endpoints).await?;
        let unified = match composer::compose(&descriptors) {
            Ok(unified) => unified,
            Err(e) => {
                // Operator surface: the conflict list is logged, never
                // returned to end clients.
                for conflict in &e.conflicts {
                    error!(%conflict, "schema conflict");
                }
                return Err(e.into());
            }
        };

        let unchanged = self
            .current
            .borrow()
            .as_ref()
            .map(|prev| prev.version == unified.version)
            .unwrap_or(false);
        if unchanged {
            debug!(version = %unified.version, "composition unchanged");
            return Ok(false);
        }

        info!(version = %unified.version, subgraphs = unified.subgraphs.len(), "unified schema published");
        self.current.send_replace(Some(Arc::new(unified)));
        Ok(true)
    }

    /// Handles one client request: plan, execute, merge. Planning failures
    /// fail the whole request; execution failures degrade to partial data.
    pub async fn handle(&self, request: GraphQLRequest) -> GatewayResponse {
        let Some(schema) = self.schema() else {
            return GatewayResponse::request_error("no unified schema is available yet");
        };

        let doc = match QueryDocument::parse(&request.query, request.operation_name.as_deref()) {
            Ok(doc) => doc,
            Err(e) => return GatewayResponse::request_error(e.to_string()),
        };

        let plan = match planner::plan(&doc, &schema) {
            Ok(plan) => plan,
            Err(e) => return GatewayResponse::request_error(e.to_string()),
        };
        debug!(nodes = plan.nodes.len(), version = %schema.version, "plan built");

        let variables = match request.variables {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let ctx = RequestContext {
            variables,
            headers: request.auth_headers.unwrap_or_default(),
        };

        // The deadline covers the whole fan-out; hitting it cancels every
        // in-flight sub-operation and discards completed partial results.
        let results = match tokio::time::timeout(
            self.request_deadline,
            self.executor.execute(&plan, &schema, &ctx),
        )
        .await
        {
            Ok(results) => results,
            Err(_) => {
                return GatewayResponse::request_error(format!(
                    "request deadline of {}ms exceeded",
                    self.request_deadline.as_millis()
                ));
            }
        };

        merger::merge(&results, &doc, &plan)
    }
}
