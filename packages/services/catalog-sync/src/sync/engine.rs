use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::clients::AiProvider;
use crate::config::Config;
use crate::enrichment::{Enricher, EnrichmentOptions, EnrichmentStats, GuardedAi};
use crate::models::*;
use crate::progress::{ProgressBroadcaster, ProgressEvent};
use crate::providers::AdapterFactory;
use crate::resilience::{map_concurrent, SlidingWindowLimiter};
use crate::storage::{GraphStore, PersistenceLayer};

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Re-enrich and rewrite products that already exist in the store.
    pub force: bool,
}

/// Per-run handles shared with the job registry.
#[derive(Clone)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub job: Arc<RwLock<SyncJob>>,
}

impl RunControl {
    pub fn new(job: SyncJob) -> Self {
        Self { cancel: CancellationToken::new(), job: Arc::new(RwLock::new(job)) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub status: JobStatus,
    pub count_processed: u64,
    pub total_products_seen: u64,
    pub count: u64,
    pub pages: u64,
    pub dropped_batches: usize,
    pub enrichment: EnrichmentStats,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    count_processed: u64,
    total_products_seen: u64,
    count: u64,
}

/// Drives fetch, diff, enrich, persist and checkpoint for one store until the adapter runs dry.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn GraphStore>,
    adapters: Arc<dyn AdapterFactory>,
    ai: Arc<dyn AiProvider>,
    limiter: Arc<SlidingWindowLimiter>,
    broadcaster: Arc<dyn ProgressBroadcaster>,
    persistence: PersistenceLayer,
    checkpoints: CheckpointManager,
    cfg: Config,
}

impl SyncEngine {
    pub fn new(
        cfg: Config,
        store: Arc<dyn GraphStore>,
        adapters: Arc<dyn AdapterFactory>,
        ai: Arc<dyn AiProvider>,
        broadcaster: Arc<dyn ProgressBroadcaster>,
    ) -> Self {
        let limiter = Arc::new(SlidingWindowLimiter::new(cfg.ai_max_requests_per_minute));
        let persistence = PersistenceLayer::new(
            store.clone(),
            cfg.persist_batch_size,
            cfg.persist_fan_out,
            cfg.tx_retry_policy(),
        );
        let checkpoints = CheckpointManager::new(&cfg.checkpoint_dir, cfg.checkpoint_max_age());
        Self { store, adapters, ai, limiter, broadcaster, persistence, checkpoints, cfg }
    }

    pub fn with_limiter(mut self, limiter: Arc<SlidingWindowLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceLayer) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn graph_store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Runs one sync and records the terminal state on the job and the store.
    /// `Err` is returned for runs that ended `failed` or `cancelled`.
    pub async fn run(&self, store_id: &str, options: SyncOptions, control: &RunControl) -> Result<SyncOutcome> {
        let job_id = control.job.read().await.id;
        let span = tracing::info_span!("sync", store_id = %store_id, job_id = %job_id);

        async move {
            control.job.write().await.mark_running();
            self.publish_status(store_id, control, None).await;
            tracing::info!(force = options.force, "Starting catalog sync");
            let started = Instant::now();

            let result = self.run_pipeline(store_id, options, control).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) if outcome.status == JobStatus::Completed => {
                    control.job.write().await.complete_successfully();
                    tracing::info!(
                        count_processed = outcome.count_processed,
                        total_products_seen = outcome.total_products_seen,
                        pages = outcome.pages,
                        duration_ms = elapsed_ms,
                        "Catalog sync completed"
                    );
                    self.publish_status(store_id, control, None).await;
                    Ok(outcome)
                }
                Ok(outcome) => {
                    let message = format!(
                        "{} product batch(es) could not be persisted; checkpoint kept for resume",
                        outcome.dropped_batches
                    );
                    self.record_failure(store_id, control, &message).await;
                    tracing::error!(
                        count_processed = outcome.count_processed,
                        dropped_batches = outcome.dropped_batches,
                        duration_ms = elapsed_ms,
                        "Catalog sync finished with dropped batches"
                    );
                    Err(CatalogError::Sync(message))
                }
                Err(CatalogError::Cancelled) => {
                    control.job.write().await.mark_cancelled();
                    tracing::info!(duration_ms = elapsed_ms, "Catalog sync cancelled; checkpoint kept for resume");
                    self.publish_status(store_id, control, None).await;
                    Err(CatalogError::Cancelled)
                }
                Err(e) => {
                    self.record_failure(store_id, control, &e.to_string()).await;
                    tracing::error!(error = %e, duration_ms = elapsed_ms, "Catalog sync failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Marks job and store as failed. Also used by the job supervisor after a panic.
    pub async fn record_failure(&self, store_id: &str, control: &RunControl, message: &str) {
        control.job.write().await.fail_with_error(message);
        if let Err(e) = self.store.update_store_status(store_id, StoreStatus::Error, None).await {
            tracing::warn!(store_id = %store_id, error = %e, "Failed to mark store as errored");
        }
        self.publish_status(store_id, control, Some(message.to_string())).await;
    }

    async fn run_pipeline(&self, store_id: &str, options: SyncOptions, control: &RunControl) -> Result<SyncOutcome> {
        let store = self
            .store
            .load_store(store_id)
            .await?
            .ok_or_else(|| CatalogError::Sync(format!("Store {} not found", store_id)))?;
        let adapter = self.adapters.build(&store)?;
        check_cancel(control)?;

        let metadata = adapter.shop_metadata().await?;
        self.store.upsert_application_and_store(&store, &metadata).await?;
        let categories = match adapter.fetch_category_tree().await {
            Ok(tree) => {
                if let Err(e) = self.store.upsert_categories(store_id, &tree).await {
                    tracing::warn!(error = %e, "Failed to upsert category tree; continuing");
                }
                tree.into_iter().map(|c| c.name).collect::<Vec<_>>()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch category tree; continuing with known categories");
                self.store.category_names(store_id).await.unwrap_or_default()
            }
        };
        tracing::info!(
            platform = adapter.platform(),
            categories = categories.len(),
            total_products = ?metadata.total_products,
            "Store prepared"
        );

        let checkpoint = match self.checkpoints.load(store_id).await {
            Ok(cp) => cp,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read checkpoint; starting fresh");
                None
            }
        };
        let (mut cursor, mut counters, started_at) = match checkpoint {
            Some(cp) => {
                tracing::info!(
                    count_processed = cp.count_processed,
                    total_products_seen = cp.total_products_seen,
                    "Resuming from checkpoint"
                );
                let counters = Counters {
                    count_processed: cp.count_processed,
                    total_products_seen: cp.total_products_seen,
                    count: cp.count,
                };
                (cp.provider_state, counters, cp.started_at)
            }
            None => (adapter.initial_cursor(), Counters::default(), Utc::now().timestamp_millis()),
        };

        let total = metadata.total_products.unwrap_or(0);
        {
            let mut job = control.job.write().await;
            job.total = total;
            job.progress = counters.count_processed;
        }

        let enricher = Enricher::new(
            GuardedAi::new(self.ai.clone(), self.limiter.clone(), self.cfg.ai_retry_policy()),
            EnrichmentOptions {
                generate_descriptions: self.cfg.generate_descriptions,
                visual_trigger_categories: self.cfg.visual_trigger_categories.clone(),
            },
        );

        // Resume point: cursor plus the counters as they stood at that cursor
        let mut checkpoint_cursor = cursor.clone();
        let mut checkpoint_counters = counters;
        let mut pinned = false;
        let mut seen: HashSet<String> = HashSet::new();
        let mut dropped_batches = 0usize;
        let mut pages = 0u64;

        loop {
            check_cancel(control)?;
            set_state(control, PipelineState::Fetching).await;
            let page_start_counters = counters;
            let page = adapter.fetch_page(&cursor).await?;
            pages += 1;
            counters.total_products_seen += page.raw_count as u64;

            let mut items: Vec<Product> = page.items.into_iter().filter(|p| seen.insert(p.id.clone())).collect();
            for product in &mut items {
                product.store_id = store_id.to_string();
                adapter.post_process(product);
            }
            counters.count += items.len() as u64;

            check_cancel(control)?;
            set_state(control, PipelineState::Diffing).await;
            let mut already_present = 0u64;
            if !options.force && !items.is_empty() {
                let ids: Vec<String> = items.iter().map(|p| p.id.clone()).collect();
                let existing = self.store.existing_product_ids(store_id, &ids).await?;
                items.retain(|p| !existing.contains(&p.id));
                already_present = existing.len() as u64;
            }

            check_cancel(control)?;
            set_state(control, PipelineState::Enriching).await;
            let enriched = map_concurrent(items, self.cfg.enrichment_workers, |product| {
                enricher.enrich(product, &categories)
            })
            .await;

            check_cancel(control)?;
            set_state(control, PipelineState::Persisting).await;
            let report = self.persistence.save_page(enriched, store_id, &control.cancel).await?;
            counters.count_processed += report.persisted as u64 + already_present;

            if report.cancelled > 0 {
                return Err(CatalogError::Cancelled);
            }
            if report.failed_batches.is_empty() {
                if !pinned {
                    checkpoint_cursor = page.next_cursor.clone();
                    checkpoint_counters = counters;
                }
            } else {
                dropped_batches += report.failed_batches.len();
                if !pinned {
                    pinned = true;
                    checkpoint_cursor = cursor.clone();
                    checkpoint_counters = page_start_counters;
                    tracing::warn!(
                        page = pages,
                        cursor = %cursor.0,
                        failed_products = report.failed_products(),
                        "Checkpoint pinned at this page for resume"
                    );
                }
            }

            set_state(control, PipelineState::Checkpointing).await;
            let mut checkpoint = Checkpoint::new(started_at, checkpoint_cursor.clone());
            checkpoint.saved_at = Utc::now().timestamp_millis();
            checkpoint.count_processed = checkpoint_counters.count_processed;
            checkpoint.total_products_seen = checkpoint_counters.total_products_seen;
            checkpoint.count = checkpoint_counters.count;
            if let Err(e) = self.checkpoints.save(store_id, &checkpoint).await {
                tracing::warn!(error = %e, "Failed to save checkpoint");
            }

            control.job.write().await.progress = counters.count_processed;
            self.publish(
                store_id,
                ProgressEvent::Progress { processed: counters.count_processed, total },
            )
            .await;
            tracing::info!(
                page = pages,
                fetched = page.raw_count,
                persisted = report.persisted,
                skipped_existing = already_present,
                dropped_batches = report.failed_batches.len(),
                count_processed = counters.count_processed,
                "Page synced"
            );

            cursor = page.next_cursor;
            if !page.has_more {
                break;
            }
        }

        let stats = enricher.stats();
        tracing::info!(enrichment = ?stats, "Enrichment summary");

        let outcome = SyncOutcome {
            status: JobStatus::Completed,
            count_processed: counters.count_processed,
            total_products_seen: counters.total_products_seen,
            count: counters.count,
            pages,
            dropped_batches,
            enrichment: stats,
        };
        if dropped_batches > 0 {
            return Ok(SyncOutcome { status: JobStatus::Failed, ..outcome });
        }

        check_cancel(control)?;
        set_state(control, PipelineState::Finalizing).await;
        self.finalize(store_id, &store, &metadata).await?;
        Ok(outcome)
    }

    async fn finalize(&self, store_id: &str, store: &Store, metadata: &ShopMetadata) -> Result<()> {
        let mut context = self.store.compute_store_context(store_id).await?;
        context.currency = metadata.currency.clone().or_else(|| store.currency.clone());
        context.generated_at = Some(Utc::now());
        self.store.save_store_context(store_id, &context).await?;

        if let Err(e) = self.checkpoints.clear(store_id).await {
            tracing::warn!(error = %e, "Failed to clear checkpoint");
        }
        self.store
            .update_store_status(store_id, StoreStatus::Active, Some(Utc::now()))
            .await?;
        tracing::info!(
            product_count = context.product_count,
            top_categories = ?context.top_categories(5),
            "Store context finalized"
        );
        Ok(())
    }

    async fn publish_status(&self, store_id: &str, control: &RunControl, message: Option<String>) {
        let (status, state) = {
            let job = control.job.read().await;
            (job.status, job.state)
        };
        self.publish(store_id, ProgressEvent::Status { status, state, message }).await;
    }

    async fn publish(&self, store_id: &str, event: ProgressEvent) {
        let channel = self.cfg.progress_channel(store_id);
        if let Err(e) = self.broadcaster.publish(&channel, &event).await {
            tracing::warn!(channel = %channel, error = %e, "Failed to publish progress event");
        }
    }
}

fn check_cancel(control: &RunControl) -> Result<()> {
    if control.cancel.is_cancelled() {
        Err(CatalogError::Cancelled)
    } else {
        Ok(())
    }
}

async fn set_state(control: &RunControl, state: PipelineState) {
    control.job.write().await.state = state;
}
