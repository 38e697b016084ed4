//! The pluggable subgraph transport.
//!
//! Two operations are consumed from every subgraph: schema introspection via
//! the federation `_service { sdl }` field, and query execution. Anything
//! that can answer both can back the gateway; the production implementation
//! speaks GraphQL-over-HTTP with reqwest, tests substitute an in-process
//! mock.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

/// The operation subgraphs answer with their schema document.
pub const SDL_QUERY: &str = "query { _service { sdl } }";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Request(String),

    #[error("invalid response body: {0}")]
    InvalidBody(String),
}

/// A sub-operation dispatched to one subgraph. Auth headers are opaque to
/// the gateway and forwarded unchanged.
#[derive(Debug, Clone)]
pub struct SubgraphRequest {
    pub query: String,
    pub variables: Value,
    pub headers: HashMap<String, String>,
}

#[async_trait]
pub trait SubgraphTransport: Send + Sync {
    /// Fetches the subgraph's declared schema document.
    async fn fetch_sdl(&self, subgraph: &str, url: &str) -> Result<String, TransportError>;

    /// Executes one sub-operation, returning the raw `{data, errors}` body.
    async fn execute(
        &self,
        subgraph: &str,
        url: &str,
        request: SubgraphRequest,
    ) -> Result<Value, TransportError>;
}

/// GraphQL-over-HTTP transport backed by a shared reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubgraphTransport for HttpTransport {
    async fn fetch_sdl(&self, subgraph: &str, url: &str) -> Result<String, TransportError> {
        let request = SubgraphRequest {
            query: SDL_QUERY.to_string(),
            variables: json!({}),
            headers: HashMap::new(),
        };
        let body = self.execute(subgraph, url, request).await?;

        body.pointer("/data/_service/sdl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::InvalidBody(format!(
                    "subgraph `{subgraph}` returned no `_service.sdl` field"
                ))
            })
    }

    async fn execute(
        &self,
        subgraph: &str,
        url: &str,
        request: SubgraphRequest,
    ) -> Result<Value, TransportError> {
        let body = json!({
            "query": request.query,
            "variables": request.variables,
        });

        let mut outbound = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&body);
        for (name, value) in &request.headers {
            outbound = outbound.header(name, value);
        }

        let response = outbound
            .send()
            .await
            .map_err(|e| TransportError::Request(format!("request to `{subgraph}` failed: {e}")))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::InvalidBody(format!("from `{subgraph}`: {e}")))
    }
}
