use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ExecutionError;
use crate::query_executor::{ExecutionContext, QueryExecutor};
use crate::query_planner::QueryPlanner;
use crate::result_stitcher::stitch;
use crate::schema_registry::{HealthReport, SchemaRegistry};
use crate::{GraphQLError, GraphQLRequest, GraphQLResponse};

/// Service description served at `GET /info`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GatewayInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub endpoints: BTreeMap<&'static str, &'static str>,
    pub subgraphs: Vec<SubgraphInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubgraphInfo {
    pub name: String,
    pub url: String,
}

/// Request pipeline: snapshot, plan, execute, stitch. Every failure comes
/// back as a GraphQL response; nothing here returns an error to the caller.
pub struct FederationGateway {
    schema_registry: Arc<dyn SchemaRegistry>,
    query_planner: Arc<dyn QueryPlanner>,
    query_executor: Arc<dyn QueryExecutor>,
}

impl FederationGateway {
    pub fn new(
        schema_registry: Arc<dyn SchemaRegistry>,
        query_planner: Arc<dyn QueryPlanner>,
        query_executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        FederationGateway {
            schema_registry,
            query_planner,
            query_executor,
        }
    }

    pub async fn process_request(&self, request: GraphQLRequest) -> GraphQLResponse {
        self.process_request_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Like [`process_request`](Self::process_request), but abandons all
    /// in-flight subrequests once `cancellation` fires.
    pub async fn process_request_with_cancellation(
        &self,
        request: GraphQLRequest,
        cancellation: CancellationToken,
    ) -> GraphQLResponse {
        // The snapshot stays pinned for the whole request even if the
        // registry publishes a new one meanwhile.
        let Some(supergraph) = self.schema_registry.current() else {
            warn!("rejecting request: no composed schema has been published yet");
            return GraphQLResponse::from_error(
                GraphQLError::new("gateway-not-ready: no composed schema is available yet")
                    .with_code("GATEWAY_NOT_READY"),
            );
        };

        let plan = match self.query_planner.plan(&request, &supergraph) {
            Ok(plan) => plan,
            Err(err) => {
                if err.is_client_error() {
                    debug!(error = %err, "rejected client operation");
                } else {
                    error!(
                        error = %err,
                        schema_version = supergraph.version,
                        "failed to plan operation"
                    );
                }
                return GraphQLResponse::from_error(err.into());
            }
        };

        let context = ExecutionContext::new(request.variables.unwrap_or_default(), cancellation);
        match self.query_executor.execute(&plan, &context).await {
            Ok(results) => {
                let (data, errors) = stitch(&plan, results);
                GraphQLResponse {
                    data: Some(data),
                    errors,
                }
            }
            Err(err @ ExecutionError::Cancelled) => {
                debug!("request cancelled before execution finished");
                GraphQLResponse::from_error(
                    GraphQLError::new(err.to_string()).with_code("REQUEST_CANCELLED"),
                )
            }
        }
    }

    pub fn health(&self) -> HealthReport {
        self.schema_registry.health()
    }

    pub fn info(&self) -> GatewayInfo {
        GatewayInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            description: env!("CARGO_PKG_DESCRIPTION"),
            endpoints: BTreeMap::from([
                ("graphql", "/graphql"),
                ("health", "/health"),
                ("info", "/info"),
                ("schema", "/schema"),
            ]),
            subgraphs: self
                .schema_registry
                .subgraphs()
                .into_iter()
                .map(|descriptor| SubgraphInfo {
                    name: descriptor.name,
                    url: descriptor.endpoint.to_string(),
                })
                .collect(),
        }
    }

    /// SDL of the active snapshot.
    pub fn composed_sdl(&self) -> Option<String> {
        self.schema_registry
            .current()
            .map(|supergraph| supergraph.schema.sdl().to_string())
    }
}
