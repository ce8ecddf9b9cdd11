//! The plugin executable started by Grafana.
use std::net::SocketAddr;

use grafana_axiom_datasource::AxiomDataSource;
use grafana_plugin_sdk::backend;

/// Connecting to this address asks the plugin to shut down; only honoured in debug builds.
const SHUTDOWN_HANDLER: &str = "0.0.0.0:10001";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service = AxiomDataSource::new()?;
    let shutdown_handler: SocketAddr = SHUTDOWN_HANDLER.parse()?;
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("grafana-plugin-worker-thread")
        .enable_all()
        .build()?
        .block_on(async move {
            let listener = backend::initialize().await?;
            backend::Plugin::new()
                .data_service(service.clone())
                .diagnostics_service(service.clone())
                .resource_service(service)
                .init_subscriber(true)
                .shutdown_handler(shutdown_handler)
                .start(listener)
                .await?;
            Ok::<_, Box<dyn std::error::Error>>(())
        })
}
