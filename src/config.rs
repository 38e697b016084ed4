//! Gateway configuration: the subgraph routing table plus timeout, retry,
//! pool and refresh settings, loaded from a YAML file with CLI overrides.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::registry::{RefreshPolicy, SubgraphEndpoint};

#[derive(Parser, Debug)]
#[command(name = "graphweave", about = "Federated GraphQL gateway", version)]
pub struct Cli {
    /// Path to the gateway configuration file.
    #[arg(long, short, default_value = "gateway.yaml")]
    pub config: PathBuf,

    /// Overrides the configured listen address.
    #[arg(long)]
    pub listen: Option<SocketAddr>,
}

/// Outbound behavior towards one subgraph. Applies gateway-wide via
/// `defaults` unless a subgraph entry overrides it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubgraphSettings {
    /// Per-dispatch timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Total attempts for read operations; mutations never retry.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base backoff, doubled per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Maximum in-flight requests towards the subgraph.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// How long a dispatch may queue for a pool slot before it fails as the
    /// subgraph's timeout.
    #[serde(default = "default_pool_wait_ms")]
    pub pool_wait_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_pool_size() -> usize {
    16
}
fn default_pool_wait_ms() -> u64 {
    1_000
}

impl Default for SubgraphSettings {
    fn default() -> Self {
        SubgraphSettings {
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            pool_size: default_pool_size(),
            pool_wait_ms: default_pool_wait_ms(),
        }
    }
}

/// One subgraph entry. List order is declaration order, which tie-breaks
/// shareable field ownership during planning.
#[derive(Debug, Clone, Deserialize)]
pub struct SubgraphConfig {
    pub name: String,
    pub routing_url: String,
    /// Optional static SDL file; when set the registry reads it instead of
    /// introspecting the subgraph.
    #[serde(default)]
    pub schema_file: Option<PathBuf>,
    #[serde(default)]
    pub settings: Option<SubgraphSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub subgraphs: Vec<SubgraphConfig>,
    #[serde(default)]
    pub defaults: SubgraphSettings,
    /// Seconds between registry refreshes; 0 disables polling.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_refresh_policy")]
    pub refresh_policy: RefreshPolicy,
    /// Overall deadline for one client request, covering every
    /// sub-operation it fans out into.
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 4000))
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_refresh_policy() -> RefreshPolicy {
    RefreshPolicy::FailOpen
}
fn default_request_deadline_ms() -> u64 {
    30_000
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Resolves the subgraph table into registry endpoints with concrete
    /// per-subgraph settings.
    pub fn endpoints(&self) -> Vec<SubgraphEndpoint> {
        self.subgraphs
            .iter()
            .map(|sub| SubgraphEndpoint {
                name: sub.name.clone(),
                url: sub.routing_url.clone(),
                schema_file: sub.schema_file.clone(),
                settings: sub.settings.clone().unwrap_or_else(|| self.defaults.clone()),
            })
            .collect()
    }
}
