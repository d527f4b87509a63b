//! Connector agent entry point.
//!
//! Initialises tracing, loads configuration from `CONNECTOR_*` environment
//! variables, starts the local bus, connects to the cloud broker and then
//! brings up the sketch supervisor, hot-plug watcher and heartbeat.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use connector_agent::cloud::{self, CloudSession};
use connector_agent::dispatch::{Dispatcher, HandlerContext};
use connector_agent::{
    HOTPLUG_SKETCH, HotplugWatcher, LocalBus, StatusStore, Supervisor, handlers, heartbeat,
    install_log,
};
use connector_common::{AgentConfig, shadow_delete_topic, validate_device_id};

#[derive(Parser, Debug)]
#[command(name = "connector-agent", version, about)]
struct Cli {
    /// Log every inbound cloud message before it is dispatched
    #[arg(long, env = "CONNECTOR_DEBUG_MQTT")]
    debug_mqtt: bool,

    /// Follow an installer log and forward `$$$` progress lines to `/install`
    #[arg(long, value_name = "FILE")]
    listen: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Tracing first so every later step is logged.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // 2. Configuration.
    let config: AgentConfig = envy::prefixed("CONNECTOR_").from_env().context(
        "failed to load config from CONNECTOR_* env vars \
         (CONNECTOR_ID and CONNECTOR_HOST are required)",
    )?;
    validate_device_id(&config.id)
        .map_err(anyhow::Error::msg)
        .context("invalid CONNECTOR_ID")?;

    tracing::info!(
        id = %config.id,
        host = %config.host,
        port = config.port,
        sketch_folder = %config.sketch_folder.display(),
        drop_dir = %config.drop_dir.display(),
        "connector-agent starting",
    );

    // 3. Local bus before anything else touches the network.
    let bus = LocalBus::start(config.local_bus_addr)
        .await
        .context("failed to start local bus")?;

    // 4. Status store.
    let store = Arc::new(StatusStore::new(&config.id));
    store.update(&config).await;
    store.attach_local_bus(bus.clone()).await;

    // 5. Supervisor and command table.
    let supervisor = Supervisor::from_config(store.clone(), &config);
    let dispatcher = Dispatcher::new(HandlerContext::new(supervisor.clone()));
    handlers::register_builtin(&dispatcher, &config);

    // 6. Cloud session.
    let link = cloud::connect(&config)
        .await
        .context("failed to connect to the cloud broker")?;
    store.attach_cloud(link.channel()).await;
    let session = CloudSession::new(&config.id, link.channel(), dispatcher.clone())
        .with_debug(cli.debug_mqtt);
    tokio::spawn(link.run(session));

    if let Err(e) = store.send(&shadow_delete_topic(&config.id), Vec::new()).await {
        tracing::warn!(error = %e, "cannot clear the device shadow");
    }

    if let Some(path) = cli.listen {
        install_log::spawn(store.clone(), path);
    }

    // 7. Local commands share the cloud command table.
    dispatcher.bridge_local_bus(&bus);

    heartbeat::spawn(store.clone(), config.heartbeat_interval());

    // 8. Sketches already on disk, then hot-plug.
    let found = supervisor.scan_folder().await;
    tracing::info!(count = found.len(), "sketch folder scanned");

    let watcher = HotplugWatcher::start(&config.drop_dir, supervisor.clone())
        .await
        .context("failed to watch the hot-plug folder")?;
    tokio::spawn(watcher.run());

    match supervisor.autospawn(HOTPLUG_SKETCH).await {
        Some(Ok(record)) => {
            tracing::info!(sketch = %record.id(), pid = record.pid(), "autospawned");
        }
        Some(Err(e)) => tracing::error!(error = %e, "autospawn failed"),
        None => {}
    }

    store.publish_best_effort().await;
    tracing::info!("connector-agent ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    tracing::info!("received shutdown signal");
    Ok(())
}
