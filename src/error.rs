use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::GraphQLError;

/// A subgraph could not be reached or did not answer with a GraphQL body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request to subgraph \"{subgraph}\" timed out after {timeout:?}")]
    Timeout { subgraph: String, timeout: Duration },
    #[error("failed to send request to subgraph \"{subgraph}\": {reason}")]
    Request { subgraph: String, reason: String },
    #[error("subgraph \"{subgraph}\" answered with HTTP status {status}")]
    Status { subgraph: String, status: u16 },
    #[error("invalid response from subgraph \"{subgraph}\": {reason}")]
    InvalidResponse { subgraph: String, reason: String },
}

/// Failure to turn a subgraph's SDL into a capability set.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("failed to parse SDL of subgraph \"{subgraph}\": {reason}")]
    Parse { subgraph: String, reason: String },
    #[error("subgraph \"{subgraph}\" declares {kind} \"{name}\", which the gateway does not compose")]
    Unsupported {
        subgraph: String,
        kind: &'static str,
        name: String,
    },
    #[error("invalid @{directive} on \"{type_name}\" in subgraph \"{subgraph}\": {reason}")]
    InvalidDirective {
        subgraph: String,
        type_name: String,
        directive: &'static str,
        reason: String,
    },
    #[error("subgraph \"{subgraph}\" returned no SDL from its service definition query")]
    MissingSdl { subgraph: String },
    #[error("subgraph \"{subgraph}\" rejected the service definition query: {message}")]
    Introspection { subgraph: String, message: String },
    #[error("failed to read schema file {}: {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionErrorKind {
    DuplicateOwnership,
    MissingOwner,
    UnresolvedReference,
}

impl fmt::Display for CompositionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompositionErrorKind::DuplicateOwnership => "duplicate-ownership",
            CompositionErrorKind::MissingOwner => "missing-owner",
            CompositionErrorKind::UnresolvedReference => "unresolved-reference",
        })
    }
}

fn coordinate(type_name: &str, field: &Option<String>) -> String {
    match field {
        Some(field) => format!("{type_name}.{field}"),
        None => type_name.to_string(),
    }
}

/// Composition refused to merge the current capability sets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositionError {
    #[error("duplicate-ownership: {} is claimed by subgraphs {}", coordinate(.type_name, .field), .subgraphs.join(", "))]
    DuplicateOwnership {
        type_name: String,
        field: Option<String>,
        subgraphs: Vec<String>,
    },
    #[error("missing-owner: no subgraph resolves {} (referenced by {})", coordinate(.type_name, .field), .subgraphs.join(", "))]
    MissingOwner {
        type_name: String,
        field: Option<String>,
        subgraphs: Vec<String>,
    },
    #[error("unresolved-reference: {} in subgraph \"{subgraph}\" references unknown type \"{referenced}\"", coordinate(.type_name, .field))]
    UnresolvedReference {
        type_name: String,
        field: Option<String>,
        referenced: String,
        subgraph: String,
    },
}

impl CompositionError {
    pub fn kind(&self) -> CompositionErrorKind {
        match self {
            CompositionError::DuplicateOwnership { .. } => CompositionErrorKind::DuplicateOwnership,
            CompositionError::MissingOwner { .. } => CompositionErrorKind::MissingOwner,
            CompositionError::UnresolvedReference { .. } => {
                CompositionErrorKind::UnresolvedReference
            }
        }
    }
}

/// The client operation could not be mapped to an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    #[error("{0}")]
    Parse(String),
    #[error("{message}")]
    Validation { message: String, path: Vec<String> },
    #[error("schema drift: {type_name}.{field} has no owning subgraph in the active schema")]
    SchemaDrift { type_name: String, field: String },
    #[error("dependency cycle between subgraphs {} on entity \"{type_name}\"", .subgraphs.join(", "))]
    DependencyCycle {
        type_name: String,
        subgraphs: Vec<String>,
    },
    #[error("{type_name}.{field} is owned by \"{owner}\" and cannot be reached from subgraph \"{from}\"")]
    UnreachableField {
        type_name: String,
        field: String,
        from: String,
        owner: String,
    },
}

impl PlanningError {
    pub(crate) fn validation(message: impl Into<String>, path: &[String]) -> Self {
        PlanningError::Validation {
            message: message.into(),
            path: path.to_vec(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PlanningError::Parse(_) => "GRAPHQL_PARSE_FAILED",
            PlanningError::Validation { .. } => "GRAPHQL_VALIDATION_FAILED",
            PlanningError::SchemaDrift { .. } => "SCHEMA_DRIFT",
            PlanningError::DependencyCycle { .. } | PlanningError::UnreachableField { .. } => {
                "QUERY_PLANNING_FAILED"
            }
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PlanningError::Parse(_) | PlanningError::Validation { .. }
        )
    }
}

impl From<PlanningError> for GraphQLError {
    fn from(err: PlanningError) -> Self {
        let code = err.code();
        let path = match &err {
            PlanningError::Validation { path, .. } if !path.is_empty() => Some(
                path.iter()
                    .map(|key| crate::PathSegment::Key(key.clone()))
                    .collect(),
            ),
            _ => None,
        };
        let error = GraphQLError::new(err.to_string()).with_code(code);
        match path {
            Some(path) => error.with_path(path),
            None => error,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no subgraph has ever provided a capability set")]
    NoSubgraphsAvailable,
    #[error("composition failed: {0}")]
    Composition(#[from] CompositionError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("request cancelled by the client")]
    Cancelled,
}
