// Chat node entry point.
use anyhow::{Context, Result};
use chatd::config::ServerConfig;
use chatd::store::mysql::MySqlDirectory;
use chatd::{AppContext, Services};
use parley_bus::InProcessBus;
use parley_presence::MemoryPresence;
use parley_storage::{MemoryCache, MemoryMessageStore};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Configuration failure is fatal; nothing useful runs without it.
    let config = ServerConfig::from_env_or_yaml().context("load configuration")?;
    tracing::info!(node_id = %config.node_id, "starting chat node");

    // Primary directory DB. A connect failure aborts boot.
    let directory = Arc::new(
        MySqlDirectory::connect(&config.mysql, &config.sharding)
            .await
            .context("connect directory database")?,
    );

    // Message cache, presence, and bus backends. The in-process
    // implementations serve a single-node deployment; a cluster points
    // these at its shared cache, service registry, and broker instead.
    let message_ttl = Duration::from_secs(config.message_expiration_secs);
    let messages = Arc::new(MemoryMessageStore::new(Some(message_ttl)));
    let cache = Arc::new(MemoryCache::new());
    let presence = Arc::new(MemoryPresence::new());
    let bus = Arc::new(InProcessBus::new());

    let services = Arc::new(Services::new(
        config, directory, messages, cache, presence, bus,
    ));
    let ctx = Arc::new(AppContext::new(services));

    let handle = chatd::server::start(ctx).await.context("start server")?;

    // Block until SIGINT, then unwind in order.
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
