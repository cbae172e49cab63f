use hub_runtime::{Runtime, RuntimeConfig};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration - fail fast if invalid
    let config = RuntimeConfig::load()?;

    hub_core::observability::init_tracing(&config.log_level, config.log_json);

    tracing::info!(
        stores = %config.stores_dir.display(),
        http = config.http.enabled,
        "starting hiveot hub"
    );

    let runtime = Runtime::new(config)?;
    runtime.start().await?;

    signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    runtime.stop().await;
    Ok(())
}
