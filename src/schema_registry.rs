use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::SubgraphDescriptor;
use crate::capability::CapabilitySet;
use crate::composed_schema::ComposedSchema;
use crate::composer::compose;
use crate::error::{CapabilityError, RegistryError};
use crate::subgraph_client::{SubgraphClient, SubgraphRequest};

pub const SERVICE_DEFINITION_OPERATION: &str = "__SubgraphServiceDefinition";
pub const SERVICE_DEFINITION_QUERY: &str =
    "query __SubgraphServiceDefinition { _service { sdl } }";

/// An immutable, published composition. Requests hold an `Arc` to the
/// snapshot they started with for their whole lifetime.
#[derive(Debug)]
pub struct Supergraph {
    pub version: u64,
    pub schema: ComposedSchema,
    pub subgraphs: BTreeMap<String, SubgraphDescriptor>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubgraphStatus {
    Healthy,
    /// The last poll failed; the previously fetched capabilities are still
    /// part of the composition.
    DegradedStale,
    /// The subgraph has no capabilities in the served composition: it never
    /// answered, or its answers so far failed to compose.
    Unreachable,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// True once at least one composition has been published.
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u64>,
    pub subgraphs: BTreeMap<String, SubgraphStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_composition_error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub poll_interval: Duration,
    pub introspection_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            poll_interval: Duration::from_secs(10),
            introspection_timeout: Duration::from_secs(5),
        }
    }
}

pub trait SchemaRegistry: Send + Sync {
    /// The latest published snapshot, if any composition has succeeded.
    fn current(&self) -> Option<Arc<Supergraph>>;
    fn health(&self) -> HealthReport;
    /// Every configured subgraph, whether or not it is in the composition.
    fn subgraphs(&self) -> Vec<SubgraphDescriptor>;
}

#[derive(Default)]
struct RegistryState {
    capabilities: BTreeMap<String, CapabilitySet>,
    version: u64,
    last_composition_error: Option<String>,
}

pub struct PollingSchemaRegistry {
    subgraphs: Vec<SubgraphDescriptor>,
    client: Arc<dyn SubgraphClient>,
    config: RegistryConfig,
    current: ArcSwapOption<Supergraph>,
    health: ArcSwap<HealthReport>,
    // Held for the whole poll so only one poll runs at a time.
    state: Mutex<RegistryState>,
}

impl PollingSchemaRegistry {
    pub fn new(
        subgraphs: Vec<SubgraphDescriptor>,
        client: Arc<dyn SubgraphClient>,
        config: RegistryConfig,
    ) -> Self {
        PollingSchemaRegistry {
            subgraphs,
            client,
            config,
            current: ArcSwapOption::empty(),
            health: ArcSwap::from_pointee(HealthReport::default()),
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Fetches every subgraph's capabilities, recomposes and publishes the
    /// result. On failure the previous snapshot stays active.
    pub async fn poll(&self) -> Result<Arc<Supergraph>, RegistryError> {
        let mut state = self.state.lock().await;

        let fetched = join_all(self.subgraphs.iter().map(|descriptor| async move {
            (descriptor, self.fetch_capabilities(descriptor).await)
        }))
        .await;

        // Fetched sets are staged and only committed once they compose.
        let mut staged = state.capabilities.clone();
        let mut statuses = BTreeMap::new();
        for (descriptor, result) in fetched {
            let name = descriptor.name.clone();
            let status = match result {
                Ok(capabilities) => {
                    debug!(subgraph = %name, "fetched subgraph capabilities");
                    staged.insert(name.clone(), capabilities);
                    SubgraphStatus::Healthy
                }
                Err(err) if state.capabilities.contains_key(&name) => {
                    warn!(
                        subgraph = %name,
                        error = %err,
                        "subgraph poll failed, composing with its last known capabilities"
                    );
                    SubgraphStatus::DegradedStale
                }
                Err(err) => {
                    warn!(
                        subgraph = %name,
                        error = %err,
                        "subgraph unreachable, leaving it out of composition"
                    );
                    SubgraphStatus::Unreachable
                }
            };
            statuses.insert(name, status);
        }

        let outcome = if staged.is_empty() {
            Err(RegistryError::NoSubgraphsAvailable)
        } else {
            compose(&staged).map_err(RegistryError::from)
        };

        let result = match outcome {
            Ok(schema) => {
                state.capabilities = staged;
                state.last_composition_error = None;
                Ok(self.publish(&mut state, schema))
            }
            Err(err) => {
                match &err {
                    RegistryError::Composition(composition) => {
                        error!(
                            kind = %composition.kind(),
                            error = %composition,
                            "schema composition failed, keeping the previous schema"
                        );
                        state.last_composition_error = Some(composition.to_string());
                        // Subgraphs whose new capabilities were rejected are
                        // served from what was committed before, if anything.
                        for (name, status) in statuses.iter_mut() {
                            if staged.get(name) == state.capabilities.get(name) {
                                continue;
                            }
                            *status = if state.capabilities.contains_key(name) {
                                SubgraphStatus::DegradedStale
                            } else {
                                SubgraphStatus::Unreachable
                            };
                        }
                    }
                    RegistryError::NoSubgraphsAvailable => {
                        warn!("no subgraph capabilities available, nothing to compose");
                    }
                }
                Err(err)
            }
        };

        let current = self.current.load_full();
        self.health.store(Arc::new(HealthReport {
            ready: current.is_some(),
            schema_version: current.as_ref().map(|supergraph| supergraph.version),
            subgraphs: statuses,
            last_composition_error: state.last_composition_error.clone(),
        }));
        result
    }

    fn publish(&self, state: &mut RegistryState, schema: ComposedSchema) -> Arc<Supergraph> {
        let subgraphs: BTreeMap<String, SubgraphDescriptor> = self
            .subgraphs
            .iter()
            .filter(|descriptor| state.capabilities.contains_key(&descriptor.name))
            .map(|descriptor| (descriptor.name.clone(), descriptor.clone()))
            .collect();

        if let Some(current) = self.current.load_full() {
            if current.schema == schema && current.subgraphs == subgraphs {
                debug!(version = current.version, "composed schema unchanged");
                return current;
            }
        }

        state.version += 1;
        let supergraph = Arc::new(Supergraph {
            version: state.version,
            schema,
            subgraphs,
        });
        self.current.store(Some(supergraph.clone()));
        info!(
            version = supergraph.version,
            subgraphs = supergraph.subgraphs.len(),
            "published composed schema"
        );
        supergraph
    }

    async fn fetch_capabilities(
        &self,
        descriptor: &SubgraphDescriptor,
    ) -> Result<CapabilitySet, CapabilityError> {
        if let Some(path) = &descriptor.schema_file {
            let sdl = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| CapabilityError::ReadFile {
                    path: path.clone(),
                    source,
                })?;
            return CapabilitySet::from_sdl(&descriptor.name, &sdl);
        }

        let request = SubgraphRequest {
            query: SERVICE_DEFINITION_QUERY.to_string(),
            operation_name: Some(SERVICE_DEFINITION_OPERATION.to_string()),
            variables: Map::new(),
        };
        let response = self
            .client
            .execute(
                &descriptor.name,
                &descriptor.endpoint,
                &request,
                self.config.introspection_timeout,
            )
            .await?;

        if let Some(errors) = response.errors.filter(|errors| !errors.is_empty()) {
            let message = errors
                .iter()
                .map(|error| error.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CapabilityError::Introspection {
                subgraph: descriptor.name.clone(),
                message,
            });
        }
        let sdl = response
            .data
            .as_ref()
            .and_then(|data| data.pointer("/_service/sdl"))
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::MissingSdl {
                subgraph: descriptor.name.clone(),
            })?;
        CapabilitySet::from_sdl(&descriptor.name, sdl)
    }

    /// Polls until `shutdown` fires. The next poll is scheduled only after
    /// the previous one finished.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(err) = self.poll().await {
                debug!(error = %err, "schema poll did not publish a new snapshot");
            }

            debug!(
                interval_ms = self.config.poll_interval.as_millis() as u64,
                "waiting before the next schema poll"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        info!("schema registry polling stopped");
    }
}

impl SchemaRegistry for PollingSchemaRegistry {
    fn current(&self) -> Option<Arc<Supergraph>> {
        self.current.load_full()
    }

    fn health(&self) -> HealthReport {
        self.health.load().as_ref().clone()
    }

    fn subgraphs(&self) -> Vec<SubgraphDescriptor> {
        self.subgraphs.clone()
    }
}
