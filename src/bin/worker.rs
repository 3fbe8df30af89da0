use tokio::signal;
use tracing_subscriber::EnvFilter;

use doclib::{config::AppConfig, db, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    let workers = config.queue.extraction_workers
        + config.queue.index_workers
        + config.queue.storage_workers
        + config.queue.downstream_workers;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        workers,
        quickwit_enabled = config.quickwit_endpoint.is_some(),
        s3_bucket = config.s3_bucket.as_deref().unwrap_or("-"),
        local_storage = config.local_storage_root.is_some(),
        "loaded pipeline configuration"
    );
    // every worker loop may hold a connection at once
    let pool_size = config.database_max_pool_size.max(workers as u32 + 1);
    let pool = db::init_pool_with_size(&config.database_url, pool_size)?;

    let state = AppState::from_config(config, pool).await?;
    let report = state.queue.process_pending_database_jobs().await?;
    tracing::info!(?report, "startup recovery finished");

    state.queue.start().await;
    signal::ctrl_c().await?;
    tracing::info!("worker received shutdown signal");
    state.queue.stop().await;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
