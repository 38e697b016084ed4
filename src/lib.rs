pub mod composer;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod merger;
pub mod planner;
pub mod query;
pub mod registry;
pub mod schema;
pub mod transport;

pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use registry::SchemaRegistry;
pub use schema::UnifiedSchema;
pub use transport::{HttpTransport, SubgraphTransport};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client-submitted request: query text, variable bindings and the opaque
/// auth headers to forward to subgraphs.
#[derive(Debug, Serialize, Deserialize)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(rename = "operationName", default)]
    pub operation_name: Option<String>,
    #[serde(skip)]
    pub auth_headers: Option<HashMap<String, String>>,
}

/// One step of a response path: a field key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// The merged response returned to the client. Partial failure is not
/// total failure: `data` carries every field that resolved, with null
/// subtrees and error records for the rest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl GatewayResponse {
    /// A request-level failure: no data at all, one error message.
    pub fn request_error(message: impl Into<String>) -> Self {
        GatewayResponse {
            data: None,
            errors: vec![GraphQLError {
                message: message.into(),
                path: None,
                extensions: None,
            }],
        }
    }
}
