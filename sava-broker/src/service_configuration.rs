use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use sava_core::ordering::QueueOrdering;
use sava_core::storage::StorageConfig;

use crate::policies::Policies;

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// Sava cluster name
    pub cluster_name: String,
    /// Prometheus metrics exporter endpoint (optional)
    pub prometheus: Option<PrometheusConfig>,
    /// Message storage backend
    #[serde(default)]
    pub storage: StorageConfig,
    /// Broker policies, overridable per queue at declaration
    #[serde(default)]
    pub policies: Policies,
    /// Queues to be declared on boot
    #[serde(default)]
    pub bootstrap_queues: Vec<QueueDeclaration>,
    /// Exchange bindings to be created on boot
    #[serde(default)]
    pub bootstrap_bindings: Vec<BindingDeclaration>,
}

/// Prometheus exporter endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct PrometheusConfig {
    pub host: String,
    pub port: usize,
}

/// configuration settings for the Sava broker service, validated from the
/// loaded file
#[derive(Debug)]
pub struct ServiceConfiguration {
    /// Sava cluster name
    pub cluster_name: String,
    /// Prometheus exporter address
    pub prom_exporter: Option<SocketAddr>,
    /// Message storage backend
    pub storage: StorageConfig,
    /// Broker policies
    pub policies: Policies,
    /// Queues to be declared on boot
    pub bootstrap_queues: Vec<QueueDeclaration>,
    /// Exchange bindings to be created on boot
    pub bootstrap_bindings: Vec<BindingDeclaration>,
}

/// A queue declared at boot, with optional policy overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDeclaration {
    pub name: String,
    #[serde(default)]
    pub ordering: Option<QueueOrdering>,
    #[serde(default)]
    pub max_deliveries: Option<u32>,
}

/// An exchange binding declared at boot. A missing routing key binds the
/// queue to every key on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingDeclaration {
    pub exchange: String,
    #[serde(default)]
    pub routing_key: Option<String>,
    pub queue: String,
}

/// Implementing the TryFrom trait to transform LoadConfiguration into ServiceConfiguration
impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        // Construct prom_exporter from prometheus.host and prometheus.port if provided
        let prom_exporter: Option<SocketAddr> = if let Some(prometheus) = &config.prometheus {
            Some(
                format!("{}:{}", prometheus.host, prometheus.port)
                    .parse()
                    .context("Failed to create prom_exporter")?,
            )
        } else {
            None
        };

        Ok(ServiceConfiguration {
            cluster_name: config.cluster_name,
            prom_exporter,
            storage: config.storage,
            policies: config.policies,
            bootstrap_queues: config.bootstrap_queues,
            bootstrap_bindings: config.bootstrap_bindings,
        })
    }
}
