use std::net::SocketAddr;

use anyhow::Context;
use tokio::{net::TcpListener, signal};
use tower::make::Shared;
use tracing_subscriber::EnvFilter;

use doclib::{config::AppConfig, db, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        server_host = %config.server_host,
        server_port = config.server_port,
        quickwit_enabled = config.quickwit_endpoint.is_some(),
        s3_bucket = config.s3_bucket.as_deref().unwrap_or("-"),
        local_storage = config.local_storage_root.is_some(),
        embedded_workers = config.embedded_workers,
        "loaded pipeline configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let applied = db::run_migrations(&pool)?;
    tracing::info!(applied, "database migrations checked");

    let listen_addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("SERVER_HOST/SERVER_PORT do not form a socket address")?;
    let embedded_workers = config.embedded_workers;
    let state = AppState::from_config(config, pool).await?;

    if embedded_workers {
        state.queue.start().await;
    }
    let queue = state.queue.clone();
    let router = routes::create_router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    axum::serve(listener, Shared::new(router))
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            tracing::info!("server received shutdown signal");
        })
        .await?;

    queue.stop().await;
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
