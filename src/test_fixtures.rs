use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;

use crate::SubgraphDescriptor;
use crate::capability::CapabilitySet;
use crate::composer::compose;
use crate::error::TransportError;
use crate::schema_registry::Supergraph;
use crate::subgraph_client::{SubgraphClient, SubgraphRequest, SubgraphResponse};

pub(crate) const CUSTOMER_SDL: &str = include_str!("../schemas/customer.graphql");
pub(crate) const BILLING_SDL: &str = include_str!("../schemas/billing.graphql");
pub(crate) const ORDERS_SDL: &str = include_str!("../schemas/orders.graphql");
pub(crate) const SUPPORT_SDL: &str = include_str!("../schemas/support.graphql");

pub(crate) const SUBGRAPHS: [(&str, &str); 4] = [
    ("customer", CUSTOMER_SDL),
    ("billing", BILLING_SDL),
    ("orders", ORDERS_SDL),
    ("support", SUPPORT_SDL),
];

pub(crate) fn endpoint(subgraph: &str) -> Url {
    Url::parse(&format!("http://{subgraph}.test/graphql")).unwrap()
}

pub(crate) fn capabilities_of(sdls: &[(&str, &str)]) -> BTreeMap<String, CapabilitySet> {
    sdls.iter()
        .map(|(name, sdl)| (name.to_string(), CapabilitySet::from_sdl(name, sdl).unwrap()))
        .collect()
}

pub(crate) fn capabilities() -> BTreeMap<String, CapabilitySet> {
    capabilities_of(&SUBGRAPHS)
}

pub(crate) fn supergraph_of(sdls: &[(&str, &str)]) -> Supergraph {
    let capabilities = capabilities_of(sdls);
    Supergraph {
        version: 1,
        schema: compose(&capabilities).unwrap(),
        subgraphs: capabilities
            .keys()
            .map(|name| (name.clone(), SubgraphDescriptor::new(name.as_str(), endpoint(name))))
            .collect(),
    }
}

pub(crate) fn supergraph() -> Supergraph {
    supergraph_of(&SUBGRAPHS)
}

/// Answers subrequests with canned response bodies. A subgraph without a
/// canned body times out.
#[derive(Default)]
pub(crate) struct ScriptedSubgraphs {
    bodies: Mutex<HashMap<String, Value>>,
    requests: Mutex<Vec<(String, SubgraphRequest)>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    completed: AtomicUsize,
}

impl ScriptedSubgraphs {
    pub(crate) fn with_latency(latency: Duration) -> Self {
        ScriptedSubgraphs {
            latency: Some(latency),
            ..Default::default()
        }
    }

    pub(crate) fn respond(&self, subgraph: &str, body: Value) {
        self.bodies.lock().unwrap().insert(subgraph.to_string(), body);
    }

    pub(crate) fn requests(&self) -> Vec<(String, SubgraphRequest)> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn requests_to(&self, subgraph: &str) -> Vec<SubgraphRequest> {
        self.requests()
            .into_iter()
            .filter(|(name, _)| name == subgraph)
            .map(|(_, request)| request)
            .collect()
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Subrequests that ran to the end of their latency.
    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubgraphClient for ScriptedSubgraphs {
    async fn execute(
        &self,
        subgraph: &str,
        _endpoint: &Url,
        request: &SubgraphRequest,
        timeout: Duration,
    ) -> Result<SubgraphResponse, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push((subgraph.to_string(), request.clone()));
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);

        let body = self.bodies.lock().unwrap().get(subgraph).cloned();
        match body {
            Some(body) => Ok(serde_json::from_value(body).unwrap()),
            None => Err(TransportError::Timeout {
                subgraph: subgraph.to_string(),
                timeout,
            }),
        }
    }
}
