//! Shared test fixtures: an in-process mock subgraph transport and SDL
//! documents mirroring a small building-management federation (a device
//! subgraph, a facility subgraph and a coffee-machine subgraph).

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;

use graphweave::config::{GatewayConfig, SubgraphConfig, SubgraphSettings};
use graphweave::registry::{Health, RefreshPolicy, SubgraphDescriptor};
use graphweave::transport::{SubgraphRequest, SubgraphTransport, TransportError};

pub const BMS_SDL: &str = r#"
type Device @key(fields: "id") {
  id: ID!
  status: String
}

type Query {
  device(id: ID!): Device
  devices: [Device!]!
}
"#;

pub const FMS_SDL: &str = r#"
type Device @key(fields: "id") {
  id: ID!
  location: String
}

type Machine @key(fields: "id") {
  id: ID!
  location: String
}

type Query {
  machine(id: ID!): Machine
}
"#;

pub const COFFEE_SDL: &str = r#"
type Machine @key(fields: "id") {
  id: ID! @external
  level: Int
}

type Query {
  beans: Int
}
"#;

#[derive(Default)]
struct MockSubgraph {
    sdl: Option<String>,
    sdl_unreachable: bool,
    default_response: Option<Value>,
    queued_responses: VecDeque<Value>,
    fail_next: usize,
    fail_always: bool,
    delay: Option<Duration>,
    calls: Vec<SubgraphRequest>,
    sdl_fetches: usize,
}

/// An in-process transport standing in for the subgraph fleet. Responses
/// are canned per subgraph; failures, delays and SDL swaps are scripted by
/// the individual tests.
#[derive(Default)]
pub struct MockTransport {
    subgraphs: Mutex<HashMap<String, MockSubgraph>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, sdl: &str) {
        let mut subgraphs = self.subgraphs.lock().unwrap();
        subgraphs.entry(name.to_string()).or_default().sdl = Some(sdl.to_string());
    }

    pub fn set_sdl(&self, name: &str, sdl: &str) {
        self.add(name, sdl);
    }

    /// Marks introspection as unreachable while execution keeps working.
    pub fn sdl_unreachable(&self, name: &str) {
        let mut subgraphs = self.subgraphs.lock().unwrap();
        subgraphs
            .entry(name.to_string())
            .or_default()
            .sdl_unreachable = true;
    }

    pub fn respond(&self, name: &str, response: Value) {
        let mut subgraphs = self.subgraphs.lock().unwrap();
        subgraphs.entry(name.to_string()).or_default().default_response = Some(response);
    }

    pub fn respond_seq(&self, name: &str, responses: Vec<Value>) {
        let mut subgraphs = self.subgraphs.lock().unwrap();
        subgraphs
            .entry(name.to_string())
            .or_default()
            .queued_responses = responses.into();
    }

    /// The next `n` execute calls fail with a transport error.
    pub fn fail_times(&self, name: &str, n: usize) {
        let mut subgraphs = self.subgraphs.lock().unwrap();
        subgraphs.entry(name.to_string()).or_default().fail_next = n;
    }

    pub fn fail_always(&self, name: &str) {
        let mut subgraphs = self.subgraphs.lock().unwrap();
        subgraphs.entry(name.to_string()).or_default().fail_always = true;
    }

    /// Every execute call sleeps first, to exercise timeouts and deadlines.
    pub fn delay(&self, name: &str, delay: Duration) {
        let mut subgraphs = self.subgraphs.lock().unwrap();
        subgraphs.entry(name.to_string()).or_default().delay = Some(delay);
    }

    pub fn calls(&self, name: &str) -> Vec<SubgraphRequest> {
        let subgraphs = self.subgraphs.lock().unwrap();
        subgraphs
            .get(name)
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn sdl_fetches(&self, name: &str) -> usize {
        let subgraphs = self.subgraphs.lock().unwrap();
        subgraphs.get(name).map(|s| s.sdl_fetches).unwrap_or(0)
    }
}

#[async_trait]
impl SubgraphTransport for MockTransport {
    async fn fetch_sdl(&self, subgraph: &str, _url: &str) -> Result<String, TransportError> {
        let mut subgraphs = self.subgraphs.lock().unwrap();
        let entry = subgraphs
            .get_mut(subgraph)
            .ok_or_else(|| TransportError::Request(format!("unknown subgraph `{subgraph}`")))?;
        entry.sdl_fetches += 1;
        if entry.sdl_unreachable {
            return Err(TransportError::Request("connection refused".to_string()));
        }
        entry
            .sdl
            .clone()
            .ok_or_else(|| TransportError::Request("connection refused".to_string()))
    }

    async fn execute(
        &self,
        subgraph: &str,
        _url: &str,
        request: SubgraphRequest,
    ) -> Result<Value, TransportError> {
        let delay = {
            let subgraphs = self.subgraphs.lock().unwrap();
            subgraphs.get(subgraph).and_then(|s| s.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut subgraphs = self.subgraphs.lock().unwrap();
        let entry = subgraphs
            .get_mut(subgraph)
            .ok_or_else(|| TransportError::Request(format!("unknown subgraph `{subgraph}`")))?;
        entry.calls.push(request);

        if entry.fail_always {
            return Err(TransportError::Request("connection reset".to_string()));
        }
        if entry.fail_next > 0 {
            entry.fail_next -= 1;
            return Err(TransportError::Request("connection reset".to_string()));
        }
        if let Some(response) = entry.queued_responses.pop_front() {
            return Ok(response);
        }
        entry
            .default_response
            .clone()
            .ok_or_else(|| TransportError::Request("no canned response".to_string()))
    }
}

/// A gateway config over the named subgraphs, fast timeouts, no polling.
pub fn test_config(subgraphs: &[&str]) -> GatewayConfig {
    GatewayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        subgraphs: subgraphs
            .iter()
            .map(|name| SubgraphConfig {
                name: name.to_string(),
                routing_url: format!("http://{name}.internal/query"),
                schema_file: None,
                settings: None,
            })
            .collect(),
        defaults: SubgraphSettings {
            timeout_ms: 200,
            retry_attempts: 2,
            retry_backoff_ms: 5,
            pool_size: 8,
            pool_wait_ms: 200,
        },
        poll_interval_secs: 0,
        refresh_policy: RefreshPolicy::FailOpen,
        request_deadline_ms: 2_000,
    }
}

/// A registry descriptor as a fetch would have produced it.
pub fn descriptor(name: &str, index: usize, sdl: &str) -> SubgraphDescriptor {
    SubgraphDescriptor {
        name: name.to_string(),
        url: format!("http://{name}.internal/query"),
        sdl: sdl.to_string(),
        fetched_at: SystemTime::now(),
        health: Health::Healthy,
        index,
    }
}

pub fn descriptors(entries: &[(&str, &str)]) -> BTreeMap<String, SubgraphDescriptor> {
    entries
        .iter()
        .enumerate()
        .map(|(index, (name, sdl))| (name.to_string(), descriptor(name, index, sdl)))
        .collect()
}
