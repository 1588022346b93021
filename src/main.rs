use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE,
};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use customer360_gateway::config::{Cli, GatewayConfig};
use customer360_gateway::subgraph_client::SubgraphClient;
use customer360_gateway::{
    FederatedQueryPlanner, FederationGateway, GraphQLError, GraphQLRequest, GraphQLResponse,
    HttpSubgraphClient, PlanExecutor, PollingSchemaRegistry,
};

type Body = BoxBody<Bytes, hyper::Error>;

fn full<T: Into<Bytes>>(value: T) -> Body {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, json: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(full(json))
        .unwrap_or_else(|_| internal_server_error())
}

fn graphql_response(status: StatusCode, response: &GraphQLResponse) -> Response<Body> {
    json_response(status, serde_json::to_string(response).unwrap_or_default())
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<FederationGateway>,
) -> Result<Response<Body>, Infallible> {
    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(err) => {
                    debug!(error = %err, "failed to read request body");
                    let response = GraphQLResponse::from_error(
                        GraphQLError::new("Failed to read request body").with_code("BAD_REQUEST"),
                    );
                    return Ok(graphql_response(StatusCode::BAD_REQUEST, &response));
                }
            };

            match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
                Ok(graphql_req) => {
                    // Dropping this handler (client disconnect) cancels the
                    // plan's in-flight subrequests.
                    let cancellation = CancellationToken::new();
                    let _cancel_on_drop = cancellation.clone().drop_guard();
                    let response = gateway
                        .process_request_with_cancellation(graphql_req, cancellation)
                        .await;
                    graphql_response(StatusCode::OK, &response)
                }
                Err(err) => {
                    let response = GraphQLResponse::from_error(
                        GraphQLError::new(format!("Invalid JSON request: {err}"))
                            .with_code("BAD_REQUEST"),
                    );
                    graphql_response(StatusCode::BAD_REQUEST, &response)
                }
            }
        }

        (&Method::GET, "/health") => {
            let health = gateway.health();
            let status = if health.ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, serde_json::to_string(&health).unwrap_or_default())
        }

        (&Method::GET, "/info") => json_response(
            StatusCode::OK,
            serde_json::to_string(&gateway.info()).unwrap_or_default(),
        ),

        (&Method::GET, "/schema") => match gateway.composed_sdl() {
            Some(sdl) => Response::builder()
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
                .body(full(sdl))
                .unwrap_or_else(|_| internal_server_error()),
            None => Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
                .body(full("No composed schema is available yet"))
                .unwrap_or_else(|_| internal_server_error()),
        },

        (&Method::OPTIONS, _) => Response::builder()
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
            .header(ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(result)
}

fn internal_server_error() -> Response<Body> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let loaded = GatewayConfig::load(&cli.config);
    let log_level = loaded
        .as_ref()
        .map(|config| config.gateway.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&log_level);

    let mut config = loaded.inspect_err(|err| {
        error!(error = %err, path = %cli.config.display(), "failed to load gateway config");
    })?;
    config.apply_cli(&cli);
    let descriptors = config.subgraph_descriptors()?;

    let client: Arc<dyn SubgraphClient> = Arc::new(HttpSubgraphClient::new());
    let registry = Arc::new(PollingSchemaRegistry::new(
        descriptors,
        client.clone(),
        config.registry_config(),
    ));
    let gateway = Arc::new(FederationGateway::new(
        registry.clone(),
        Arc::new(FederatedQueryPlanner::new()),
        Arc::new(PlanExecutor::new(client, config.executor_config())),
    ));

    let shutdown = CancellationToken::new();
    let poller = tokio::spawn(registry.run(shutdown.clone()));

    let addr = config.gateway.listen;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "federation gateway listening");

    loop {
        let (stream, _addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        };
        let io = TokioIo::new(stream);
        let gateway_clone = Arc::clone(&gateway);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway_clone.clone();
                handle_request(req, gateway)
            });

            if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor)
                .serve_connection(io, service)
                .await
            {
                debug!(error = %err, "connection closed with error");
            }
        });
    }

    shutdown.cancel();
    if let Err(err) = poller.await {
        error!(error = %err, "schema poller task failed");
    }
    Ok(())
}
