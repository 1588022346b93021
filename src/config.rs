use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use reqwest::Url;
use serde::Deserialize;

use crate::SubgraphDescriptor;
use crate::query_executor::ExecutorConfig;
use crate::schema_registry::RegistryConfig;

/// Command line options. Flags override the config file.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "customer360-gateway",
    about = "Federated GraphQL gateway for the Customer360 subgraphs"
)]
pub struct Cli {
    /// Gateway configuration file.
    #[arg(
        short,
        long = "config",
        env = "GATEWAY_CONFIG",
        default_value = "schemas/supergraph.yaml"
    )]
    pub config: PathBuf,

    /// Address to listen on.
    #[arg(long, env = "GATEWAY_LISTEN")]
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config declares no subgraphs")]
    NoSubgraphs,
    #[error("subgraph \"{subgraph}\" has an invalid routing url \"{url}\": {reason}")]
    InvalidUrl {
        subgraph: String,
        url: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySettings {
    pub listen: SocketAddr,
    pub poll_interval_ms: u64,
    pub introspection_timeout_ms: u64,
    pub subgraph_timeout_ms: u64,
    pub max_in_flight_subrequests: usize,
    pub log_level: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 4000)),
            poll_interval_ms: 10_000,
            introspection_timeout_ms: 5_000,
            subgraph_timeout_ms: 3_000,
            max_in_flight_subrequests: 16,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubgraphConfig {
    pub routing_url: String,
    #[serde(default)]
    pub schema: Option<SchemaConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchemaConfig {
    /// SDL file, relative to the config file's directory.
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    pub subgraphs: BTreeMap<String, SubgraphConfig>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&contents)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)?;
        if config.subgraphs.is_empty() {
            return Err(ConfigError::NoSubgraphs);
        }
        for (name, subgraph) in &config.subgraphs {
            parse_url(name, &subgraph.routing_url)?;
        }
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen {
            self.gateway.listen = listen;
        }
    }

    /// Subgraph descriptors with `<NAME>_SUBGRAPH_URL` overrides from the
    /// process environment.
    pub fn subgraph_descriptors(&self) -> Result<Vec<SubgraphDescriptor>, ConfigError> {
        self.subgraph_descriptors_with(|name| std::env::var(name).ok())
    }

    pub fn subgraph_descriptors_with(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Vec<SubgraphDescriptor>, ConfigError> {
        self.subgraphs
            .iter()
            .map(|(name, subgraph)| {
                let url =
                    env(&url_override_var(name)).unwrap_or_else(|| subgraph.routing_url.clone());
                let mut descriptor = SubgraphDescriptor::new(name.as_str(), parse_url(name, &url)?);
                descriptor.schema_file = subgraph
                    .schema
                    .as_ref()
                    .map(|schema| self.base_dir.join(&schema.file));
                Ok(descriptor)
            })
            .collect()
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            poll_interval: Duration::from_millis(self.gateway.poll_interval_ms),
            introspection_timeout: Duration::from_millis(self.gateway.introspection_timeout_ms),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            request_timeout: Duration::from_millis(self.gateway.subgraph_timeout_ms),
            max_in_flight: self.gateway.max_in_flight_subrequests.max(1),
        }
    }
}

fn url_override_var(subgraph: &str) -> String {
    format!("{}_SUBGRAPH_URL", subgraph.to_uppercase().replace('-', "_"))
}

fn parse_url(subgraph: &str, url: &str) -> Result<Url, ConfigError> {
    Url::parse(url).map_err(|err| ConfigError::InvalidUrl {
        subgraph: subgraph.to_string(),
        url: url.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"
gateway:
  listen: 127.0.0.1:4100
  subgraph_timeout_ms: 1500
subgraphs:
  customer:
    routing_url: http://localhost:4001/graphql
    schema:
      file: customer.graphql
  billing:
    routing_url: http://localhost:4003/graphql
"#;

    #[test]
    fn unset_gateway_keys_take_defaults() {
        let config = GatewayConfig::from_yaml(CONFIG).unwrap();

        assert_eq!(config.gateway.listen, "127.0.0.1:4100".parse().unwrap());
        assert_eq!(config.gateway.poll_interval_ms, 10_000);
        assert_eq!(config.gateway.max_in_flight_subrequests, 16);
        assert_eq!(config.gateway.log_level, "info");
        assert_eq!(config.executor_config().request_timeout, Duration::from_millis(1500));
        assert_eq!(config.registry_config().introspection_timeout, Duration::from_secs(5));
    }

    #[test]
    fn gateway_section_is_optional() {
        let config = GatewayConfig::from_yaml(
            "subgraphs:\n  customer:\n    routing_url: http://localhost:4001/graphql\n",
        )
        .unwrap();
        assert_eq!(config.gateway, GatewaySettings::default());
    }

    #[test]
    fn descriptors_resolve_schema_files_and_env_overrides() {
        let mut config = GatewayConfig::from_yaml(CONFIG).unwrap();
        config.base_dir = PathBuf::from("schemas");

        let descriptors = config
            .subgraph_descriptors_with(|var| {
                (var == "BILLING_SUBGRAPH_URL").then(|| "http://billing:8080/graphql".to_string())
            })
            .unwrap();

        assert_eq!(descriptors.len(), 2);
        let billing = &descriptors[0];
        assert_eq!(billing.name, "billing");
        assert_eq!(billing.endpoint.as_str(), "http://billing:8080/graphql");
        assert_eq!(billing.schema_file, None);
        let customer = &descriptors[1];
        assert_eq!(customer.endpoint.as_str(), "http://localhost:4001/graphql");
        assert_eq!(customer.schema_file, Some(PathBuf::from("schemas/customer.graphql")));
    }

    #[test]
    fn invalid_routing_url_is_rejected() {
        let err = GatewayConfig::from_yaml("subgraphs:\n  customer:\n    routing_url: not a url\n")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidUrl { ref subgraph, .. } if subgraph == "customer"
        ));
    }

    #[test]
    fn at_least_one_subgraph_is_required() {
        let err = GatewayConfig::from_yaml("subgraphs: {}\n").unwrap_err();
        assert!(matches!(err, ConfigError::NoSubgraphs));
    }

    #[test]
    fn unknown_gateway_keys_are_rejected() {
        let err = GatewayConfig::from_yaml(
            "gateway:\n  poll_every: 5\nsubgraphs:\n  a:\n    routing_url: http://a/graphql\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn listen_flag_overrides_the_file() {
        let cli = Cli::try_parse_from([
            "customer360-gateway",
            "--config",
            "gateway.yaml",
            "--listen",
            "127.0.0.1:5000",
        ])
        .unwrap();
        let mut config = GatewayConfig::from_yaml(CONFIG).unwrap();
        config.apply_cli(&cli);

        assert_eq!(cli.config, PathBuf::from("gateway.yaml"));
        assert_eq!(config.gateway.listen, "127.0.0.1:5000".parse().unwrap());
    }
}
