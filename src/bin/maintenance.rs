use std::env;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use doclib::{config::AppConfig, db, models::SyncType, state::AppState};

const USAGE: &str = "Usage: maintenance <command>
  migrate
  recover
  sync-org <organization-id> [full|incremental]
  reindex-org <organization-id> [batch-size]
  reset-job <extraction-job-id>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    match command.as_str() {
        "migrate" => migrate()?,
        "recover" => recover().await?,
        "sync-org" => {
            let organization_id = parse_id(args.get(1), "organization id")?;
            let sync_type = match args.get(2).map(String::as_str) {
                None | Some("incremental") => SyncType::Incremental,
                Some("full") => SyncType::Full,
                Some(other) => bail!("unknown sync type `{other}`\n{USAGE}"),
            };
            sync_organization(organization_id, sync_type).await?;
        }
        "reindex-org" => {
            let organization_id = parse_id(args.get(1), "organization id")?;
            let batch_size = args
                .get(2)
                .map(|raw| raw.parse::<i64>())
                .transpose()
                .context("batch size must be a number")?;
            reindex_organization(organization_id, batch_size).await?;
        }
        "reset-job" => {
            let job_id = parse_id(args.get(1), "extraction job id")?;
            reset_job(job_id).await?;
        }
        cmd => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn parse_id(raw: Option<&String>, what: &str) -> Result<Uuid> {
    let raw = raw.with_context(|| format!("missing {what}\n{USAGE}"))?;
    Uuid::parse_str(raw).with_context(|| format!("{what} `{raw}` is not a UUID"))
}

fn load_config() -> Result<AppConfig> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        quickwit_enabled = config.quickwit_endpoint.is_some(),
        s3_bucket = config.s3_bucket.as_deref().unwrap_or("-"),
        "loaded pipeline configuration"
    );
    Ok(config)
}

async fn load_state() -> Result<AppState> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    AppState::from_config(config, pool).await
}

fn migrate() -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let applied = db::run_migrations(&pool)?;
    println!("Applied {applied} migrations.");
    Ok(())
}

async fn recover() -> Result<()> {
    let state = load_state().await?;
    let report = state.queue.process_pending_database_jobs().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn sync_organization(organization_id: Uuid, sync_type: SyncType) -> Result<()> {
    let state = load_state().await?;
    let sync_job_id = state
        .storage
        .sync_storage(organization_id, sync_type, None, "maintenance")
        .await?;
    // the queued entry finds the job finished and completes without work
    let job = state.storage.run_sync(sync_job_id).await?;
    println!(
        "Sync job {} {}: {} files checked, {} repaired.",
        job.id, job.status, job.files_checked, job.files_repaired
    );
    if let Some(error) = job.error_message {
        println!("Errors: {error}");
    }
    Ok(())
}

async fn reindex_organization(organization_id: Uuid, batch_size: Option<i64>) -> Result<()> {
    let state = load_state().await?;
    let batch_size = batch_size
        .filter(|size| *size > 0)
        .unwrap_or(state.config.pipeline.bulk_index_batch_size);
    let report = state
        .indexer
        .reindex_organization(organization_id, batch_size)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn reset_job(job_id: Uuid) -> Result<()> {
    let state = load_state().await?;
    let job = state.pipeline.retry_extraction(job_id).await?;
    println!(
        "Extraction job {} reset to {} for file {}.",
        job.id, job.status, job.file_id
    );
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
