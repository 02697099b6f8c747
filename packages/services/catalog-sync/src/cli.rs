use anyhow::{bail, Context, Result};
use mongodb::{options::ClientOptions, Client as MongoClient};
use std::sync::Arc;

use catalog_sync::clients::{OpenAiClient, RedisProgressBroadcaster};
use catalog_sync::config::Config;
use catalog_sync::models::JobStatus;
use catalog_sync::progress::{NoopBroadcaster, ProgressBroadcaster};
use catalog_sync::providers::{HttpFetcher, PlatformAdapterFactory};
use catalog_sync::storage::MongoGraphStore;
use catalog_sync::sync::{SyncEngine, SyncJobs};

pub enum Command {
    Serve,
    Sync { store_id: String, force: bool },
    Help,
}

pub fn parse_args(args: &[String]) -> Result<Command> {
    match args.get(1).map(String::as_str) {
        None | Some("serve") => Ok(Command::Serve),
        Some("help") | Some("--help") | Some("-h") => Ok(Command::Help),
        Some("sync") => {
            let mut store_id = None;
            let mut force = false;
            for arg in &args[2..] {
                match arg.as_str() {
                    "--force" | "-f" => force = true,
                    other if store_id.is_none() && !other.starts_with('-') => store_id = Some(other.to_string()),
                    other => bail!("Unexpected argument: {}", other),
                }
            }
            let store_id = store_id.context("Usage: catalog-sync sync <store_id> [--force]")?;
            Ok(Command::Sync { store_id, force })
        }
        Some(other) => bail!("Unknown command: {} (try `catalog-sync help`)", other),
    }
}

pub fn print_usage() {
    println!("Catalog Sync Service");
    println!();
    println!("Usage:");
    println!("  catalog-sync                      Start the job-control server");
    println!("  catalog-sync sync <store_id> [--force]");
    println!("                                    Run one sync in the foreground");
    println!("  catalog-sync help                 Show this message");
}

/// Mongo-backed graph store plus the job registry wired over it.
pub async fn build_jobs(cfg: &Config, broadcaster: Arc<dyn ProgressBroadcaster>) -> Result<SyncJobs> {
    let client_options = ClientOptions::parse(&cfg.mongodb_uri).await?;
    let mongo_client = MongoClient::with_options(client_options)?;
    let db = mongo_client.database(&cfg.database_name);
    let store = MongoGraphStore::new(mongo_client, db, cfg.mongodb_use_transactions);
    if let Err(e) = store.ensure_indexes().await {
        tracing::warn!(error = %e, "Failed to ensure graph store indexes");
    }

    let ai = OpenAiClient::from_config(cfg)?;
    let adapters = PlatformAdapterFactory::new(HttpFetcher::from_config(cfg)?);
    let engine = SyncEngine::new(
        cfg.clone(),
        Arc::new(store),
        Arc::new(adapters),
        Arc::new(ai),
        broadcaster,
    );
    Ok(SyncJobs::new(engine))
}

/// Runs one sync to completion. Ctrl-C cancels at the next stage boundary.
pub async fn run_sync_once(cfg: Config, store_id: &str, force: bool) -> Result<()> {
    cfg.validate()?;
    let broadcaster: Arc<dyn ProgressBroadcaster> = match RedisProgressBroadcaster::new(&cfg.redis_url).await {
        Ok(redis) => Arc::new(redis),
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable; progress events will only be logged");
            Arc::new(NoopBroadcaster)
        }
    };
    let jobs = build_jobs(&cfg, broadcaster).await?;

    let job_id = jobs.start_sync(store_id, force).await?;
    let view = tokio::select! {
        view = jobs.wait(job_id) => view?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(store_id = %store_id, "Interrupt received; cancelling sync");
            jobs.cancel(store_id).await;
            jobs.wait(job_id).await?
        }
    };

    println!(
        "{} {}: {} ({}/{} products)",
        view.store_id, view.job_id, view.status, view.progress, view.total
    );
    match view.status {
        JobStatus::Completed => Ok(()),
        status => bail!(
            "Sync {} for {}: {}",
            status,
            store_id,
            view.error.unwrap_or_else(|| "no error recorded".to_string())
        ),
    }
}
