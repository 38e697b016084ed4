//! Schema registry: fetches and holds each subgraph's declared schema
//! document.
//!
//! Every refresh introspects all configured subgraphs concurrently, each
//! with its own timeout and bounded exponential backoff. One unreachable
//! subgraph never blocks the others; whether it blocks composition depends
//! on the refresh policy and on whether the subgraph had served a schema
//! before. Descriptors are immutable: a re-fetch supersedes the previous
//! snapshot, it never mutates it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::config::SubgraphSettings;
use crate::error::FetchError;
use crate::transport::SubgraphTransport;

/// A configured subgraph address, resolved from the gateway config.
#[derive(Debug, Clone)]
pub struct SubgraphEndpoint {
    pub name: String,
    pub url: String,
    pub schema_file: Option<PathBuf>,
    pub settings: SubgraphSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy { reason: String },
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

/// One subgraph's schema snapshot. Superseded, never mutated.
#[derive(Debug, Clone)]
pub struct SubgraphDescriptor {
    pub name: String,
    pub url: String,
    pub sdl: String,
    pub fetched_at: SystemTime,
    pub health: Health,
    /// Declaration position from the config, preserved for deterministic
    /// composition and tie-breaking.
    pub index: usize,
}

impl SubgraphDescriptor {
    /// False for a subgraph that has never served a schema; composition
    /// skips it.
    pub fn has_schema(&self) -> bool {
        !self.sdl.is_empty()
    }
}

/// What to do when a previously healthy subgraph stops answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshPolicy {
    /// Keep composing with the last known schema.
    FailOpen,
    /// Refuse to publish a new unified schema.
    FailClosed,
}

/// Emitted whenever a fetched schema differs from the previous snapshot.
#[derive(Debug, Clone)]
pub struct SchemaChange {
    pub subgraph: String,
}

pub struct SchemaRegistry {
    transport: Arc<dyn SubgraphTransport>,
    policy: RefreshPolicy,
    snapshots: RwLock<BTreeMap<String, SubgraphDescriptor>>,
    changes: broadcast::Sender<SchemaChange>,
}

impl SchemaRegistry {
    pub fn new(transport: Arc<dyn SubgraphTransport>, policy: RefreshPolicy) -> Self {
        let (changes, _) = broadcast::channel(32);
        SchemaRegistry {
            transport,
            policy,
            snapshots: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Subscribes to schema-change events; an event fires once per subgraph
    /// whose SDL differs from the previous snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<SchemaChange> {
        self.changes.subscribe()
    }

    /// The current descriptor table, for health reporting.
    pub async fn snapshot(&self) -> BTreeMap<String, SubgraphDescriptor> {
        self.snapshots.read().await.clone()
    }

    /// Fetches every configured subgraph's schema concurrently and returns
    /// the new descriptor table. Emits a [`SchemaChange`] per difference
    /// against the previous snapshot.
    pub async fn fetch(
        &self,
        endpoints: &[SubgraphEndpoint],
    ) -> Result<BTreeMap<String, SubgraphDescriptor>, FetchError> {
        let previous = self.snapshots.read().await.clone();

        let fetches = endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| self.fetch_one(endpoint, index, previous.get(&endpoint.name)));
        let results = join_all(fetches).await;

        let mut descriptors = BTreeMap::new();
        for result in results {
            let descriptor = result?;
            descriptors.insert(descriptor.name.clone(), descriptor);
        }

        for (name, descriptor) in &descriptors {
            let changed = previous
                .get(name)
                .map(|prev| prev.sdl != descriptor.sdl)
                .unwrap_or(descriptor.has_schema());
            if changed {
                info!(subgraph = %name, "subgraph schema changed");
                let _ = self.changes.send(SchemaChange {
                    subgraph: name.clone(),
                });
            }
        }

        *self.snapshots.write().await = descriptors.clone();
        Ok(descriptors)
    }

    async fn fetch_one(
        &self,
        endpoint: &SubgraphEndpoint,
        index: usize,
        previous: Option<&SubgraphDescriptor>,
    ) -> Result<SubgraphDescriptor, FetchError> {
        if let Some(file) = &endpoint.schema_file {
            let sdl =
                std::fs::read_to_string(file).map_err(|e| FetchError::SchemaFile {
                    subgraph: endpoint.name.clone(),
                    reason: e.to_string(),
                })?;
            return Ok(SubgraphDescriptor {
                name: endpoint.name.clone(),
                url: endpoint.url.clone(),
                sdl,
                fetched_at: SystemTime::now(),
                health: Health::Healthy,
                index,
            });
        }

        let settings = &endpoint.settings;
        let attempts = settings.retry_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let fetch = self.transport.fetch_sdl(&endpoint.name, &endpoint.url);
            match tokio::time::timeout(Duration::from_millis(settings.timeout_ms), fetch).await {
                Ok(Ok(sdl)) => {
                    debug!(subgraph = %endpoint.name, attempt, "introspection succeeded");
                    return Ok(SubgraphDescriptor {
                        name: endpoint.name.clone(),
                        url: endpoint.url.clone(),
                        sdl,
                        fetched_at: SystemTime::now(),
                        health: Health::Healthy,
                        index,
                    });
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {}ms", settings.timeout_ms),
            }
            if attempt < attempts {
                let backoff = settings.retry_backoff_ms.saturating_mul(1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }

        warn!(
            subgraph = %endpoint.name,
            attempts,
            error = %last_error,
            "subgraph introspection failed"
        );

        match previous {
            // The subgraph served a schema before and is now gone.
            Some(prev) if prev.has_schema() => match self.policy {
                RefreshPolicy::FailOpen => Ok(SubgraphDescriptor {
                    name: endpoint.name.clone(),
                    url: endpoint.url.clone(),
                    sdl: prev.sdl.clone(),
                    fetched_at: prev.fetched_at,
                    health: Health::Unhealthy { reason: last_error },
                    index,
                }),
                RefreshPolicy::FailClosed => Err(FetchError::Disappeared {
                    subgraph: endpoint.name.clone(),
                    reason: last_error,
                }),
            },
            // Never seen: marked unhealthy and excluded from composition,
            // without blocking the remaining subgraphs.
            _ => Ok(SubgraphDescriptor {
                name: endpoint.name.clone(),
                url: endpoint.url.clone(),
                sdl: String::new(),
                fetched_at: SystemTime::now(),
                health: Health::Unhealthy { reason: last_error },
                index,
            }),
        }
    }
}
