use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{response::Html, routing::get, Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;

use catalog_sync::clients::RedisProgressBroadcaster;
use catalog_sync::config::Config;
use catalog_sync::schema::{build_schema, CatalogSchema};
use catalog_sync::sync::SyncJobs;

use crate::cli::{build_jobs, parse_args, print_usage, run_sync_once, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load this crate's .env regardless of current working directory
    let _ = dotenvy::from_filename_override(concat!(env!("CARGO_MANIFEST_DIR"), "/.env"));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .init();

    let cfg = Config::from_env();
    let args: Vec<String> = std::env::args().collect();
    match parse_args(&args)? {
        Command::Help => {
            print_usage();
            return Ok(());
        }
        Command::Sync { store_id, force } => return run_sync_once(cfg, &store_id, force).await,
        Command::Serve => {}
    }

    cfg.validate()?;
    tracing::info!(
        database = %cfg.database_name,
        scheduler_enabled = cfg.enable_scheduler,
        enrichment_workers = cfg.enrichment_workers,
        "Loaded configuration"
    );

    let broadcaster = RedisProgressBroadcaster::new(&cfg.redis_url).await?;
    let jobs = build_jobs(&cfg, Arc::new(broadcaster)).await?;
    let graphql_schema = build_schema(jobs.clone());

    let scheduler = JobScheduler::new().await?;
    if cfg.enable_scheduler {
        start_sync_scheduler(&scheduler, &cfg.sync_cron, jobs.clone()).await?;
        scheduler.start().await?;
        tracing::info!(cron = %cfg.sync_cron, "Sync scheduler started");
    }

    let app = Router::new()
        .route("/graphql", get(graphql_playground).post(graphql_handler))
        .route("/health", get(health_check))
        .layer(Extension(graphql_schema))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.port).parse()?;
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                tracing::error!(port = cfg.port, "Port is already in use. Another catalog-sync instance might be running. Try changing PORT or stop the other process.");
            }
            return Err(e.into());
        }
    };
    tracing::info!(port = cfg.port, "Catalog sync service listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn graphql_playground() -> Html<String> {
    Html(async_graphql::http::playground_source(
        async_graphql::http::GraphQLPlaygroundConfig::new("/graphql"),
    ))
}

async fn graphql_handler(Extension(schema): Extension<CatalogSchema>, req: GraphQLRequest) -> GraphQLResponse {
    schema.execute(req.into_inner()).await.into()
}

async fn health_check() -> &'static str {
    "OK"
}

async fn start_sync_scheduler(scheduler: &JobScheduler, cron: &str, jobs: SyncJobs) -> anyhow::Result<()> {
    let sync_job = Job::new_async(cron, move |_uuid, _l| {
        let jobs = jobs.clone();
        Box::pin(async move {
            if let Err(e) = jobs.start_due_syncs().await {
                tracing::error!(error = %e, "Error starting scheduled syncs");
            }
        })
    })?;

    scheduler.add(sync_job).await?;
    Ok(())
}
