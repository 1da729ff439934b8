use std::{fs::read_to_string, net::SocketAddr, path::Path, sync::Arc};

use anyhow::{Context, Result};
use tracing::info;

use sava_broker::{
    args_parse::Args,
    broker_metrics::init_metrics,
    broker_service::BrokerService,
    service_configuration::{LoadConfiguration, ServiceConfiguration},
};
use sava_core::storage::{MemoryStore, MessageStore, StorageConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Parse command line arguments
    let args = Args::parse()?;

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;

    // Attempt to transform LoadConfiguration into ServiceConfiguration
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    // If `prom_exporter` is provided via command-line args, override the value from the config file
    if let Some(prom_exporter) = args.prom_exporter {
        let prom_address: SocketAddr = prom_exporter.parse().context(format!(
            "Failed to parse into Socket address: {}",
            prom_exporter
        ))?;
        service_config.prom_exporter = Some(prom_address);
    }

    // Init metrics with or without prometheus exporter
    init_metrics(service_config.prom_exporter, &service_config.cluster_name);

    // Message storage; the dispatch engine only sees the MessageStore trait,
    // so a journal-backed store slots in here
    let store: Arc<dyn MessageStore> = match service_config.storage {
        StorageConfig::InMemory => Arc::new(MemoryStore::new()),
    };

    info!(
        "Initializing Sava Message Broker service, cluster {}",
        service_config.cluster_name
    );
    let broker = BrokerService::new(store, service_config.policies.clone());

    // Declare the bootstrap topology: queues first, then their bindings
    for declaration in &service_config.bootstrap_queues {
        broker.declare_queue_with(
            &declaration.name,
            declaration.ordering,
            declaration.max_deliveries,
        )?;
    }
    for binding in &service_config.bootstrap_bindings {
        broker.bind_queue(
            &binding.exchange,
            binding.routing_key.as_deref(),
            &binding.queue,
        )?;
    }

    info!("Sava Message Broker service has started successfully");

    // The wire protocol attaches through the BrokerService API; the binary
    // itself runs until asked to stop
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping broker");

    Ok(())
}
