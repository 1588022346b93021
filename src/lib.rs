pub mod capability;
pub mod composed_schema;
pub mod composer;
pub mod config;
pub mod error;
pub mod federation_gateway;
pub mod operation;
pub mod query_executor;
pub mod query_plan;
pub mod query_planner;
pub mod result_stitcher;
pub mod schema_registry;
pub mod subgraph_client;

#[cfg(test)]
mod test_fixtures;

pub use composer::compose;
pub use federation_gateway::FederationGateway;
pub use query_executor::PlanExecutor;
pub use query_planner::FederatedQueryPlanner;
pub use schema_registry::PollingSchemaRegistry;
pub use subgraph_client::HttpSubgraphClient;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// A subgraph the gateway routes to. Names are unique across the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubgraphDescriptor {
    pub name: String,
    pub endpoint: Url,
    /// When set, the capability set is read from this SDL file instead of
    /// introspecting the endpoint.
    pub schema_file: Option<PathBuf>,
}

impl SubgraphDescriptor {
    pub fn new(name: impl Into<String>, endpoint: Url) -> Self {
        SubgraphDescriptor {
            name: name.into(),
            endpoint,
            schema_file: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
    #[serde(default)]
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        GraphQLRequest {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        if let Value::Object(map) = variables {
            self.variables = Some(map);
        }
        self
    }

    pub fn with_operation_name(mut self, operation_name: impl Into<String>) -> Self {
        self.operation_name = Some(operation_name.into());
        self
    }
}

/// One step of a response path: an object key or a list index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{index}"),
            PathSegment::Key(key) => f.write_str(key),
        }
    }
}

pub type ResponsePath = Vec<PathSegment>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<ResponsePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    pub fn with_path(mut self, path: ResponsePath) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_code(self, code: &str) -> Self {
        self.with_extension("code", Value::String(code.to_string()))
    }

    pub fn with_extension(mut self, key: &str, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|extensions| extensions.get("code"))
            .and_then(Value::as_str)
    }
}

/// Client-facing response. `data` is omitted entirely when the request was
/// rejected before execution, and serialized as `null` when execution ran
/// but nulled the root.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    pub fn from_error(error: GraphQLError) -> Self {
        GraphQLResponse {
            data: None,
            errors: vec![error],
        }
    }
}
