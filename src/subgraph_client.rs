use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::GraphQLError;
use crate::error::TransportError;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubgraphResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQLError>>,
}

/// Issues one GraphQL request against one subgraph. Implementations never
/// retry; each call is a single attempt bounded by `timeout`.
#[async_trait]
pub trait SubgraphClient: Send + Sync {
    async fn execute(
        &self,
        subgraph: &str,
        endpoint: &Url,
        request: &SubgraphRequest,
        timeout: Duration,
    ) -> Result<SubgraphResponse, TransportError>;
}

pub struct HttpSubgraphClient {
    client: reqwest::Client,
}

impl HttpSubgraphClient {
    pub fn new() -> Self {
        HttpSubgraphClient {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        HttpSubgraphClient { client }
    }
}

impl Default for HttpSubgraphClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubgraphClient for HttpSubgraphClient {
    async fn execute(
        &self,
        subgraph: &str,
        endpoint: &Url,
        request: &SubgraphRequest,
        timeout: Duration,
    ) -> Result<SubgraphResponse, TransportError> {
        let transport_error = |e: reqwest::Error| {
            if e.is_timeout() {
                TransportError::Timeout {
                    subgraph: subgraph.to_string(),
                    timeout,
                }
            } else {
                TransportError::Request {
                    subgraph: subgraph.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let response = self
            .client
            .post(endpoint.clone())
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;

        // GraphQL servers may report errors with a non-2xx status and a
        // well-formed body; keep the body whenever it parses.
        match serde_json::from_slice::<SubgraphResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(TransportError::Status {
                subgraph: subgraph.to_string(),
                status: status.as_u16(),
            }),
            Err(e) => Err(TransportError::InvalidResponse {
                subgraph: subgraph.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request(query: &str) -> SubgraphRequest {
        SubgraphRequest {
            query: query.to_string(),
            operation_name: None,
            variables: Map::new(),
        }
    }

    #[tokio::test]
    async fn posts_the_request_and_parses_data_and_errors() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/graphql")
                    .header("Content-Type", "application/json")
                    .json_body(json!({
                        "query": "query Lookup($id: ID!) { customer(id: $id) { name } }",
                        "operationName": "Lookup",
                        "variables": { "id": "C1" }
                    }));
                then.status(200).json_body(json!({
                    "data": { "customer": { "name": "Alice" } },
                    "errors": [{ "message": "partial", "path": ["customer", "email"] }]
                }));
            })
            .await;

        let mut variables = Map::new();
        variables.insert("id".to_string(), json!("C1"));
        let request = SubgraphRequest {
            query: "query Lookup($id: ID!) { customer(id: $id) { name } }".to_string(),
            operation_name: Some("Lookup".to_string()),
            variables,
        };
        let endpoint = Url::parse(&server.url("/graphql")).unwrap();
        let response = HttpSubgraphClient::new()
            .execute("customer", &endpoint, &request, Duration::from_secs(2))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.data, Some(json!({ "customer": { "name": "Alice" } })));
        let errors = response.errors.unwrap();
        assert_eq!(errors[0].message, "partial");
        assert_eq!(errors[0].path, Some(vec!["customer".into(), "email".into()]));
    }

    #[tokio::test]
    async fn slow_subgraph_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/graphql");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({ "data": {} }));
            })
            .await;

        let endpoint = Url::parse(&server.url("/graphql")).unwrap();
        let err = HttpSubgraphClient::new()
            .execute("billing", &endpoint, &request("{ a }"), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TransportError::Timeout {
                subgraph: "billing".to_string(),
                timeout: Duration::from_millis(50),
            }
        );
    }

    #[tokio::test]
    async fn graphql_errors_with_error_status_are_kept() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/graphql");
                then.status(400)
                    .json_body(json!({ "errors": [{ "message": "Cannot query field" }] }));
            })
            .await;

        let endpoint = Url::parse(&server.url("/graphql")).unwrap();
        let response = HttpSubgraphClient::new()
            .execute("orders", &endpoint, &request("{ a }"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.data, None);
        assert_eq!(response.errors.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_graphql_error_status_is_a_transport_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/graphql");
                then.status(502).body("bad gateway");
            })
            .await;

        let endpoint = Url::parse(&server.url("/graphql")).unwrap();
        let err = HttpSubgraphClient::new()
            .execute("orders", &endpoint, &request("{ a }"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Status {
                subgraph: "orders".to_string(),
                status: 502,
            }
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_request_error() {
        // Port 9 is discard; nothing listens there in test environments.
        let endpoint = Url::parse("http://127.0.0.1:9/graphql").unwrap();
        let err = HttpSubgraphClient::new()
            .execute("support", &endpoint, &request("{ a }"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Request { .. } | TransportError::Timeout { .. }));
    }
}
