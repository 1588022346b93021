use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::query_plan::{EntityBinding, ExecutionPlan, FLATTEN, InputBinding, NodeId, PlanNode};
use crate::subgraph_client::{SubgraphClient, SubgraphRequest, SubgraphResponse};
use crate::{GraphQLError, PathSegment, ResponsePath};

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Bound on each subrequest. Requests are never retried.
    pub request_timeout: Duration,
    /// Subrequests one client request may have outstanding at once.
    pub max_in_flight: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            request_timeout: Duration::from_secs(3),
            max_in_flight: 16,
        }
    }
}

/// Per-request inputs to execution.
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    pub variables: Map<String, Value>,
    /// Cancelled when the client goes away; in-flight subrequests are dropped.
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(variables: Map<String, Value>, cancellation: CancellationToken) -> Self {
        ExecutionContext {
            variables,
            cancellation,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeOutcome {
    /// The subgraph answered.
    Completed,
    /// Timeout, transport failure or an unusable response.
    Failed,
    /// A dependency failed, so the node was never sent.
    Skipped,
    /// There were no entities to resolve, so the node was never sent.
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PartialResult {
    pub node: NodeId,
    pub subgraph: String,
    pub outcome: NodeOutcome,
    /// Root nodes: the `data` object. Entity nodes: the `_entities` list.
    pub data: Option<Value>,
    /// Response path of each object in `data`: the root for root nodes, one
    /// path per representation for entity nodes.
    pub targets: Vec<ResponsePath>,
    /// Paths this node should have filled but could not. Nulls at or below
    /// them are already accounted for by `errors`.
    pub unresolved: Vec<ResponsePath>,
    pub errors: Vec<GraphQLError>,
}

impl PartialResult {
    /// Whether dependents can consume this node's output.
    pub fn is_usable(&self) -> bool {
        matches!(self.outcome, NodeOutcome::Completed | NodeOutcome::Empty)
    }

    /// Every object this node returned, paired with its response path.
    pub fn objects(&self) -> Vec<(&ResponsePath, &Value)> {
        match &self.data {
            Some(Value::Array(entities)) => self.targets.iter().zip(entities).collect(),
            Some(data) => self.targets.first().map(|root| vec![(root, data)]).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs every node of `plan` and returns their results ordered by node id.
    async fn execute(
        &self,
        plan: &ExecutionPlan,
        context: &ExecutionContext,
    ) -> Result<Vec<PartialResult>, ExecutionError>;
}

pub struct PlanExecutor {
    client: Arc<dyn SubgraphClient>,
    config: ExecutorConfig,
}

enum Dispatch {
    Resolved(PartialResult),
    Send {
        request: SubgraphRequest,
        targets: Vec<ResponsePath>,
    },
}

impl PlanExecutor {
    pub fn new(client: Arc<dyn SubgraphClient>, config: ExecutorConfig) -> Self {
        PlanExecutor { client, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn dispatch(
        &self,
        node: &PlanNode,
        results: &[Option<PartialResult>],
        context: &ExecutionContext,
    ) -> Dispatch {
        let failed_dependency = node
            .depends_on
            .iter()
            .filter_map(|dependency| results[*dependency].as_ref())
            .find(|result| !result.is_usable());
        if let Some(upstream) = failed_dependency {
            return Dispatch::Resolved(skipped(node, upstream, results));
        }

        let mut variables: Map<String, Value> = node
            .variable_usages
            .iter()
            .filter_map(|name| {
                context
                    .variables
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();

        let targets = match &node.input {
            InputBinding::Root => vec![ResponsePath::new()],
            InputBinding::Entities(binding) => {
                let (targets, representations) = representations(node, binding, results);
                if representations.is_empty() {
                    debug!(subgraph = %node.subgraph, node = node.id, "no entities to resolve");
                    return Dispatch::Resolved(PartialResult {
                        node: node.id,
                        subgraph: node.subgraph.clone(),
                        outcome: NodeOutcome::Empty,
                        data: Some(Value::Array(Vec::new())),
                        targets: Vec::new(),
                        unresolved: Vec::new(),
                        errors: Vec::new(),
                    });
                }
                variables.insert("representations".to_string(), Value::Array(representations));
                targets
            }
        };

        Dispatch::Send {
            request: SubgraphRequest {
                query: node.operation.clone(),
                operation_name: node.operation_name.clone(),
                variables,
            },
            targets,
        }
    }

    async fn send(
        &self,
        node: &PlanNode,
        request: SubgraphRequest,
        targets: Vec<ResponsePath>,
    ) -> PartialResult {
        debug!(subgraph = %node.subgraph, node = node.id, "sending subrequest");
        let response = self
            .client
            .execute(
                &node.subgraph,
                &node.endpoint,
                &request,
                self.config.request_timeout,
            )
            .await;
        match response {
            Ok(response) => completed(node, response, targets),
            Err(err) => {
                warn!(subgraph = %node.subgraph, node = node.id, error = %err, "subrequest failed");
                failed(node, targets, &err.to_string())
            }
        }
    }
}

#[async_trait]
impl QueryExecutor for PlanExecutor {
    async fn execute(
        &self,
        plan: &ExecutionPlan,
        context: &ExecutionContext,
    ) -> Result<Vec<PartialResult>, ExecutionError> {
        let limit = self.config.max_in_flight.max(1);
        let mut results: Vec<Option<PartialResult>> = vec![None; plan.nodes.len()];
        let mut started = vec![false; plan.nodes.len()];
        let mut in_flight = FuturesUnordered::new();

        loop {
            if context.cancellation.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            // Nodes resolved without a request can unblock others right away.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for node in &plan.nodes {
                    if started[node.id] || in_flight.len() >= limit {
                        continue;
                    }
                    if node.depends_on.iter().any(|dependency| results[*dependency].is_none()) {
                        continue;
                    }
                    started[node.id] = true;
                    progressed = true;
                    match self.dispatch(node, &results, context) {
                        Dispatch::Resolved(result) => results[node.id] = Some(result),
                        Dispatch::Send { request, targets } => {
                            in_flight.push(self.send(node, request, targets));
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = context.cancellation.cancelled() => {
                    debug!("execution cancelled");
                    return Err(ExecutionError::Cancelled);
                }
                Some(result) = in_flight.next() => {
                    let id = result.node;
                    results[id] = Some(result);
                }
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

/// Builds one representation per entity reachable through `binding`, with
/// the response path each one resolves.
fn representations(
    node: &PlanNode,
    binding: &EntityBinding,
    results: &[Option<PartialResult>],
) -> (Vec<ResponsePath>, Vec<Value>) {
    let mut targets = Vec::new();
    let mut representations = Vec::new();
    let Some(origin) = results.get(binding.origin).and_then(Option::as_ref) else {
        return (targets, representations);
    };

    'entities: for (target, object) in entity_locations(origin, &binding.path) {
        let mut representation = Map::new();
        representation.insert(
            "__typename".to_string(),
            Value::String(binding.type_name.clone()),
        );
        for key in &binding.key_fields {
            match object.get(key) {
                Some(value) if !value.is_null() => {
                    representation.insert(key.clone(), value.clone());
                }
                _ => {
                    debug!(subgraph = %node.subgraph, key = %key, "entity without key value");
                    continue 'entities;
                }
            }
        }
        for field in &binding.required_fields {
            let value = object
                .get(field)
                .filter(|value| !value.is_null())
                .cloned()
                .or_else(|| sibling_value(node, binding.origin, results, &target, field))
                .unwrap_or(Value::Null);
            representation.insert(field.clone(), value);
        }
        targets.push(target);
        representations.push(Value::Object(representation));
    }
    (targets, representations)
}

/// Objects at `path` inside every object `origin` returned. `@` segments
/// fan out over list elements.
fn entity_locations<'r>(
    origin: &'r PartialResult,
    path: &[String],
) -> Vec<(ResponsePath, &'r Map<String, Value>)> {
    let mut locations = Vec::new();
    for (target, value) in origin.objects() {
        walk(value, path, target.clone(), &mut locations);
    }
    locations
}

fn walk<'v>(
    value: &'v Value,
    path: &[String],
    at: ResponsePath,
    out: &mut Vec<(ResponsePath, &'v Map<String, Value>)>,
) {
    let Some((segment, rest)) = path.split_first() else {
        if let Value::Object(object) = value {
            out.push((at, object));
        }
        return;
    };
    if segment == FLATTEN {
        if let Value::Array(items) = value {
            for (index, item) in items.iter().enumerate() {
                let mut item_path = at.clone();
                item_path.push(PathSegment::Index(index));
                walk(item, rest, item_path, out);
            }
        }
    } else if let Some(child) = value.get(segment.as_str()) {
        let mut child_path = at;
        child_path.push(PathSegment::Key(segment.clone()));
        walk(child, rest, child_path, out);
    }
}

/// A required field fetched by a sibling node for the same entity.
fn sibling_value(
    node: &PlanNode,
    origin: NodeId,
    results: &[Option<PartialResult>],
    target: &ResponsePath,
    field: &str,
) -> Option<Value> {
    node.depends_on
        .iter()
        .filter(|&&dependency| dependency != origin)
        .filter_map(|&dependency| results[dependency].as_ref())
        .find_map(|sibling| {
            sibling
                .objects()
                .into_iter()
                .find(|(path, _)| *path == target)
                .and_then(|(_, entity)| entity.get(field))
                .filter(|value| !value.is_null())
                .cloned()
        })
}

fn completed(
    node: &PlanNode,
    response: SubgraphResponse,
    targets: Vec<ResponsePath>,
) -> PartialResult {
    let errors: Vec<GraphQLError> = response
        .errors
        .unwrap_or_default()
        .into_iter()
        .map(|error| subgraph_error(node, error, &targets))
        .collect();

    let data = match &node.input {
        InputBinding::Root => response.data.filter(Value::is_object),
        InputBinding::Entities(_) => {
            let entities = response
                .data
                .and_then(|mut data| data.get_mut("_entities").map(Value::take));
            match entities {
                Some(Value::Array(entities)) if entities.len() == targets.len() => {
                    Some(Value::Array(entities))
                }
                Some(Value::Array(entities)) => {
                    let reason = format!(
                        "returned {} entities for {} representations",
                        entities.len(),
                        targets.len()
                    );
                    warn!(subgraph = %node.subgraph, node = node.id, %reason, "unusable response");
                    return failed(node, targets, &reason);
                }
                _ => None,
            }
        }
    };

    if data.is_none() && errors.is_empty() {
        warn!(subgraph = %node.subgraph, node = node.id, "response carried no data or errors");
        return failed(node, targets, "response carried no data");
    }
    PartialResult {
        node: node.id,
        subgraph: node.subgraph.clone(),
        outcome: NodeOutcome::Completed,
        data,
        targets,
        unresolved: Vec::new(),
        errors,
    }
}

fn failed(node: &PlanNode, targets: Vec<ResponsePath>, reason: &str) -> PartialResult {
    let errors = targets
        .iter()
        .map(|target| {
            GraphQLError::new(format!("subgraph-unavailable: {}", node.subgraph))
                .with_path(anchored(target, node))
                .with_code("SUBGRAPH_UNAVAILABLE")
                .with_extension("serviceName", json!(node.subgraph))
                .with_extension("reason", json!(reason))
        })
        .collect();
    PartialResult {
        node: node.id,
        subgraph: node.subgraph.clone(),
        outcome: NodeOutcome::Failed,
        data: None,
        unresolved: unresolved_fields(node, &targets),
        targets,
        errors,
    }
}

fn skipped(
    node: &PlanNode,
    upstream: &PartialResult,
    results: &[Option<PartialResult>],
) -> PartialResult {
    let origin = node.entity_binding().map(|binding| {
        let origin = results
            .get(binding.origin)
            .and_then(Option::as_ref)
            .filter(|origin| origin.is_usable());
        (binding, origin)
    });
    let (targets, paths, unresolved) = match origin {
        None => {
            let root = vec![ResponsePath::new()];
            (Vec::new(), vec![anchored(&root[0], node)], unresolved_fields(node, &root))
        }
        Some((binding, Some(origin))) => {
            let targets: Vec<ResponsePath> = entity_locations(origin, &binding.path)
                .into_iter()
                .map(|(target, _)| target)
                .collect();
            let paths = targets.iter().map(|target| anchored(target, node)).collect();
            let unresolved = unresolved_fields(node, &targets);
            (targets, paths, unresolved)
        }
        Some((_, None)) => {
            let (prefix, fans_out) = planned_prefix(node);
            let unresolved = if fans_out {
                vec![prefix.clone()]
            } else {
                unresolved_fields(node, std::slice::from_ref(&prefix))
            };
            let path = if fans_out {
                prefix
            } else {
                anchored(&prefix, node)
            };
            (Vec::new(), vec![path], unresolved)
        }
    };

    if paths.is_empty() {
        // Nothing to resolve, so nothing was lost.
        return PartialResult {
            node: node.id,
            subgraph: node.subgraph.clone(),
            outcome: NodeOutcome::Empty,
            data: Some(Value::Array(Vec::new())),
            targets,
            unresolved: Vec::new(),
            errors: Vec::new(),
        };
    }

    debug!(subgraph = %node.subgraph, upstream = %upstream.subgraph, "skipping node");
    let errors = paths
        .into_iter()
        .map(|path| {
            GraphQLError::new(format!(
                "dependency-failed: {} needs {}",
                node.subgraph, upstream.subgraph
            ))
            .with_path(path)
            .with_code("DEPENDENCY_FAILED")
            .with_extension("serviceName", json!(node.subgraph))
            .with_extension("dependsOn", json!(upstream.subgraph))
        })
        .collect();
    PartialResult {
        node: node.id,
        subgraph: node.subgraph.clone(),
        outcome: NodeOutcome::Skipped,
        data: None,
        targets,
        unresolved,
        errors,
    }
}

fn anchored(target: &ResponsePath, node: &PlanNode) -> ResponsePath {
    let mut path = target.clone();
    path.push(PathSegment::Key(node.anchor_field.clone()));
    path
}

/// Every field `node` should have filled on every object at `targets`.
fn unresolved_fields(node: &PlanNode, targets: &[ResponsePath]) -> Vec<ResponsePath> {
    targets
        .iter()
        .flat_map(|target| {
            node.response_keys.iter().map(move |key| {
                let mut path = target.clone();
                path.push(PathSegment::Key(key.clone()));
                path
            })
        })
        .collect()
}

/// The node's planned location up to its first list, and whether a list cut
/// it short.
fn planned_prefix(node: &PlanNode) -> (ResponsePath, bool) {
    let mut path: ResponsePath = Vec::new();
    for segment in &node.path {
        if segment == FLATTEN {
            return (path, true);
        }
        path.push(PathSegment::Key(segment.clone()));
    }
    (path, false)
}

fn subgraph_error(
    node: &PlanNode,
    mut error: GraphQLError,
    targets: &[ResponsePath],
) -> GraphQLError {
    if node.entity_binding().is_some() {
        error.path = error
            .path
            .take()
            .and_then(|path| entity_error_path(&path, targets));
    }
    let error = error.with_extension("serviceName", json!(node.subgraph));
    if error.code().is_some() {
        error
    } else {
        error.with_code("SUBGRAPH_ERROR")
    }
}

/// Rewrites `["_entities", i, ...rest]` to the response path of entity `i`.
fn entity_error_path(path: &[PathSegment], targets: &[ResponsePath]) -> Option<ResponsePath> {
    match path {
        [PathSegment::Key(root), PathSegment::Index(index), rest @ ..] if root == "_entities" => {
            let mut remapped = targets.get(*index)?.clone();
            remapped.extend(rest.iter().cloned());
            Some(remapped)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GraphQLRequest;
    use crate::query_planner::{FederatedQueryPlanner, QueryPlanner};
    use crate::test_fixtures::{self, ScriptedSubgraphs};
    use pretty_assertions::assert_eq;

    fn plan_for(query: &str) -> ExecutionPlan {
        FederatedQueryPlanner::new()
            .plan(&GraphQLRequest::new(query), &test_fixtures::supergraph())
            .unwrap()
    }

    fn executor(subgraphs: &Arc<ScriptedSubgraphs>) -> PlanExecutor {
        PlanExecutor::new(subgraphs.clone(), ExecutorConfig::default())
    }

    fn key(name: &str) -> PathSegment {
        PathSegment::Key(name.to_string())
    }

    #[tokio::test]
    async fn entity_node_receives_representations_from_its_origin() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        subgraphs.respond(
            "customer",
            json!({ "data": { "customer": { "name": "Alice", "id": "C1" } } }),
        );
        subgraphs.respond("billing", json!({ "data": { "_entities": [{ "creditScore": 710 }] } }));
        let plan = plan_for(r#"{ customer(id: "C1") { name creditScore } }"#);

        let results = executor(&subgraphs)
            .execute(&plan, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome == NodeOutcome::Completed));
        assert_eq!(results[1].targets, vec![vec![key("customer")]]);
        assert_eq!(results[1].data, Some(json!([{ "creditScore": 710 }])));

        let billing = subgraphs.requests_to("billing");
        assert_eq!(billing.len(), 1);
        assert_eq!(
            billing[0].variables.get("representations"),
            Some(&json!([{ "__typename": "Customer", "id": "C1" }]))
        );
    }

    #[tokio::test]
    async fn unreachable_extender_fails_only_its_node() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        subgraphs.respond(
            "customer",
            json!({ "data": { "customer": { "name": "Alice", "id": "C1" } } }),
        );
        let plan = plan_for(r#"{ customer(id: "C1") { name creditScore } }"#);

        let results = executor(&subgraphs)
            .execute(&plan, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(results[0].outcome, NodeOutcome::Completed);
        assert_eq!(results[1].outcome, NodeOutcome::Failed);
        assert_eq!(results[1].data, None);
        let [error] = results[1].errors.as_slice() else {
            panic!("expected one error, got {:?}", results[1].errors);
        };
        assert_eq!(error.message, "subgraph-unavailable: billing");
        assert_eq!(error.path, Some(vec![key("customer"), key("creditScore")]));
        assert_eq!(error.code(), Some("SUBGRAPH_UNAVAILABLE"));
        assert_eq!(
            error.extensions.as_ref().and_then(|e| e.get("serviceName")),
            Some(&json!("billing"))
        );
    }

    #[tokio::test]
    async fn list_entities_are_addressed_by_index() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        subgraphs.respond(
            "orders",
            json!({ "data": { "ordersByStatus": [
                { "total": 10.5, "customer": { "id": "C1" } },
                { "total": 99.0, "customer": { "id": "C2" } }
            ] } }),
        );
        subgraphs.respond(
            "customer",
            json!({ "data": { "_entities": [{ "name": "Alice" }, { "name": "Bob" }] } }),
        );
        let plan = plan_for("{ ordersByStatus(status: SHIPPED) { total customer { name } } }");

        let results = executor(&subgraphs)
            .execute(&plan, &ExecutionContext::default())
            .await
            .unwrap();

        let targets: Vec<ResponsePath> = (0..2)
            .map(|index| vec![key("ordersByStatus"), PathSegment::Index(index), key("customer")])
            .collect();
        assert_eq!(results[1].targets, targets);
        assert_eq!(
            subgraphs.requests_to("customer")[0].variables.get("representations"),
            Some(&json!([
                { "__typename": "Customer", "id": "C1" },
                { "__typename": "Customer", "id": "C2" }
            ]))
        );
    }

    #[tokio::test]
    async fn required_fields_come_from_the_sibling_that_fetched_them() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        subgraphs.respond(
            "orders",
            json!({ "data": { "order": { "customer": { "id": "C1" } } } }),
        );
        subgraphs.respond(
            "customer",
            json!({ "data": { "_entities": [{ "email": "alice@example.com" }] } }),
        );
        subgraphs.respond(
            "support",
            json!({ "data": { "_entities": [{ "supportTier": "gold" }] } }),
        );
        let plan = plan_for(r#"{ order(orderId: "O1") { customer { supportTier } } }"#);

        executor(&subgraphs)
            .execute(&plan, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(
            subgraphs.requests_to("support")[0].variables.get("representations"),
            Some(&json!([{ "__typename": "Customer", "id": "C1", "email": "alice@example.com" }]))
        );
    }

    #[tokio::test]
    async fn dependents_of_a_failed_node_are_skipped_with_an_error() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        subgraphs.respond(
            "orders",
            json!({ "data": { "order": { "customer": { "id": "C1" } } } }),
        );
        subgraphs.respond(
            "support",
            json!({ "data": { "_entities": [{ "supportTier": "gold" }] } }),
        );
        let plan = plan_for(r#"{ order(orderId: "O1") { customer { supportTier } } }"#);

        let results = executor(&subgraphs)
            .execute(&plan, &ExecutionContext::default())
            .await
            .unwrap();

        let outcomes: Vec<NodeOutcome> = results.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![NodeOutcome::Completed, NodeOutcome::Failed, NodeOutcome::Skipped]
        );
        assert!(subgraphs.requests_to("support").is_empty());
        let error = &results[2].errors[0];
        assert_eq!(error.code(), Some("DEPENDENCY_FAILED"));
        assert_eq!(
            error.path,
            Some(vec![key("order"), key("customer"), key("supportTier")])
        );
    }

    #[tokio::test]
    async fn null_origin_leaves_nothing_to_resolve() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        subgraphs.respond("customer", json!({ "data": { "customer": null } }));
        let plan = plan_for(r#"{ customer(id: "C404") { name creditScore } }"#);

        let results = executor(&subgraphs)
            .execute(&plan, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(results[1].outcome, NodeOutcome::Empty);
        assert!(results[1].errors.is_empty());
        assert!(subgraphs.requests_to("billing").is_empty());
    }

    #[tokio::test]
    async fn entity_error_paths_point_into_the_client_response() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        subgraphs.respond(
            "customer",
            json!({ "data": { "customer": { "name": "Alice", "id": "C1" } } }),
        );
        subgraphs.respond(
            "billing",
            json!({
                "data": { "_entities": [{ "creditScore": null }] },
                "errors": [{
                    "message": "score service down",
                    "path": ["_entities", 0, "creditScore"]
                }]
            }),
        );
        let plan = plan_for(r#"{ customer(id: "C1") { name creditScore } }"#);

        let results = executor(&subgraphs)
            .execute(&plan, &ExecutionContext::default())
            .await
            .unwrap();

        let error = &results[1].errors[0];
        assert_eq!(error.message, "score service down");
        assert_eq!(error.path, Some(vec![key("customer"), key("creditScore")]));
        assert_eq!(error.code(), Some("SUBGRAPH_ERROR"));
        assert_eq!(
            error.extensions.as_ref().and_then(|e| e.get("serviceName")),
            Some(&json!("billing"))
        );
    }

    #[tokio::test]
    async fn only_used_variables_are_forwarded() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        subgraphs.respond("customer", json!({ "data": { "customer": { "name": "Alice" } } }));
        let request = GraphQLRequest::new(
            "query Lookup($id: ID!, $unused: Int) { customer(id: $id) { name } }",
        );
        let plan = FederatedQueryPlanner::new()
            .plan(&request, &test_fixtures::supergraph())
            .unwrap();
        let mut variables = Map::new();
        variables.insert("id".to_string(), json!("C1"));
        variables.insert("unused".to_string(), json!(3));

        executor(&subgraphs)
            .execute(&plan, &ExecutionContext::new(variables, CancellationToken::new()))
            .await
            .unwrap();

        let request = &subgraphs.requests_to("customer")[0];
        assert_eq!(request.operation_name.as_deref(), Some("Lookup__customer__0"));
        assert_eq!(request.variables.get("id"), Some(&json!("C1")));
        assert!(!request.variables.contains_key("unused"));
    }

    #[tokio::test]
    async fn in_flight_subrequests_are_bounded() {
        let subgraphs = Arc::new(ScriptedSubgraphs::with_latency(Duration::from_millis(20)));
        subgraphs.respond("customer", json!({ "data": { "customer": { "name": "Alice" } } }));
        subgraphs.respond("orders", json!({ "data": { "order": { "total": 1.0 } } }));
        subgraphs.respond("billing", json!({ "data": { "invoice": { "amount": 2.0 } } }));
        let plan = plan_for(
            r#"{ customer(id: "C1") { name } order(orderId: "O1") { total }
                 invoice(number: "INV-1") { amount } }"#,
        );
        assert_eq!(plan.roots().count(), 3);

        let limited = PlanExecutor::new(
            subgraphs.clone(),
            ExecutorConfig {
                max_in_flight: 1,
                ..ExecutorConfig::default()
            },
        );
        let results = limited.execute(&plan, &ExecutionContext::default()).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(subgraphs.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn cancellation_drops_in_flight_subrequests() {
        let subgraphs = Arc::new(ScriptedSubgraphs::with_latency(Duration::from_millis(200)));
        subgraphs.respond("customer", json!({ "data": { "customer": { "name": "Alice" } } }));
        let plan = plan_for(r#"{ customer(id: "C1") { name } }"#);
        let context = ExecutionContext::default();
        let cancel = context.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = executor(&subgraphs).execute(&plan, &context).await.unwrap_err();

        assert_eq!(err, ExecutionError::Cancelled);
        assert_eq!(subgraphs.requests_to("customer").len(), 1);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(subgraphs.completed(), 0);
    }

    #[tokio::test]
    async fn failed_entity_node_reports_every_entity() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        subgraphs.respond(
            "orders",
            json!({ "data": { "ordersByStatus": [
                { "total": 10.5, "customer": { "id": "C1" } },
                { "total": 99.0, "customer": { "id": "C2" } }
            ] } }),
        );
        let plan = plan_for(
            "{ ordersByStatus(status: SHIPPED) {
                 total customer { creditScore invoices { number } }
               } }",
        );

        let results = executor(&subgraphs)
            .execute(&plan, &ExecutionContext::default())
            .await
            .unwrap();

        let billing = &results[1];
        assert_eq!(billing.outcome, NodeOutcome::Failed);
        let paths: Vec<Option<ResponsePath>> =
            billing.errors.iter().map(|error| error.path.clone()).collect();
        let at = |index, field| {
            vec![
                key("ordersByStatus"),
                PathSegment::Index(index),
                key("customer"),
                key(field),
            ]
        };
        assert_eq!(paths, vec![Some(at(0, "creditScore")), Some(at(1, "creditScore"))]);
        assert_eq!(
            billing.unresolved,
            vec![
                at(0, "creditScore"),
                at(0, "invoices"),
                at(1, "creditScore"),
                at(1, "invoices")
            ]
        );
    }

    #[tokio::test]
    async fn skipped_root_node_leaves_all_its_fields_unresolved() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        let plan = plan_for(
            r#"mutation {
              updateCustomerEmail(id: "C1", email: "alice@example.com") { email }
              payInvoice(number: "INV-7") { status }
            }"#,
        );

        let results = executor(&subgraphs)
            .execute(&plan, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(results[0].unresolved, vec![vec![key("updateCustomerEmail")]]);
        assert_eq!(results[1].unresolved, vec![vec![key("payInvoice")]]);
    }

    #[tokio::test]
    async fn mutation_chain_stops_after_a_failure() {
        let subgraphs = Arc::new(ScriptedSubgraphs::default());
        subgraphs.respond(
            "billing",
            json!({ "data": { "payInvoice": { "status": "PAID" } } }),
        );
        let plan = plan_for(
            r#"mutation {
              updateCustomerEmail(id: "C1", email: "alice@example.com") { email }
              payInvoice(number: "INV-7") { status }
            }"#,
        );

        let results = executor(&subgraphs)
            .execute(&plan, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(results[0].outcome, NodeOutcome::Failed);
        assert_eq!(results[1].outcome, NodeOutcome::Skipped);
        assert_eq!(results[1].errors[0].path, Some(vec![key("payInvoice")]));
        assert!(subgraphs.requests_to("billing").is_empty());
    }
}
