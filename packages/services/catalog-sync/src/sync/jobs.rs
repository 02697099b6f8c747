use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use super::engine::{RunControl, SyncEngine, SyncOptions};
use crate::models::*;

/// Finished jobs kept per store for status queries; older ones are evicted.
pub const FINISHED_JOBS_PER_STORE: usize = 5;

struct JobEntry {
    store_id: String,
    seq: u64,
    control: RunControl,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<Uuid, JobEntry>,
    active_by_store: HashMap<String, Uuid>,
    next_seq: u64,
}

impl Registry {
    fn insert(&mut self, job_id: Uuid, store_id: &str, control: RunControl, done: watch::Receiver<bool>) {
        self.next_seq += 1;
        let entry = JobEntry { store_id: store_id.to_string(), seq: self.next_seq, control, done };
        self.jobs.insert(job_id, entry);
    }

    fn latest_for_store(&self, store_id: &str) -> Option<&JobEntry> {
        self.jobs.values().filter(|e| e.store_id == store_id).max_by_key(|e| e.seq)
    }

    /// Drops the store's oldest finished jobs beyond `keep`. The active job is never evicted.
    fn evict_finished(&mut self, store_id: &str, keep: usize) -> usize {
        let active = self.active_by_store.get(store_id).copied();
        let mut finished: Vec<(u64, Uuid)> = self
            .jobs
            .iter()
            .filter(|(id, e)| e.store_id == store_id && Some(**id) != active)
            .map(|(id, e)| (e.seq, *id))
            .collect();
        if finished.len() <= keep {
            return 0;
        }
        finished.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        let evicted = finished.split_off(keep);
        for (_, id) in &evicted {
            self.jobs.remove(id);
        }
        evicted.len()
    }
}

/// Job registry: one supervised pipeline task per store at a time.
#[derive(Clone)]
pub struct SyncJobs {
    engine: SyncEngine,
    registry: Arc<Mutex<Registry>>,
}

impl SyncJobs {
    pub fn new(engine: SyncEngine) -> Self {
        Self { engine, registry: Arc::new(Mutex::new(Registry::default())) }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub async fn start_sync(&self, store_id: &str, force: bool) -> Result<Uuid> {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.active_by_store.get(store_id) {
            return Err(CatalogError::Sync(format!(
                "A sync for store {} is already running (job {})",
                store_id, existing
            )));
        }

        let job = SyncJob::new(store_id, force);
        let job_id = job.id;
        let control = RunControl::new(job);
        let (done_tx, done_rx) = watch::channel(false);
        registry.insert(job_id, store_id, control.clone(), done_rx);
        registry.active_by_store.insert(store_id.to_string(), job_id);
        drop(registry);

        let engine = self.engine.clone();
        let pipeline_store_id = store_id.to_string();
        let pipeline_control = control.clone();
        let pipeline = tokio::spawn(async move {
            engine
                .run(&pipeline_store_id, SyncOptions { force }, &pipeline_control)
                .await
        });

        let engine = self.engine.clone();
        let registry = self.registry.clone();
        let supervised_store_id = store_id.to_string();
        tokio::spawn(async move {
            let store_id = supervised_store_id;
            match pipeline.await {
                Ok(Ok(outcome)) => {
                    tracing::debug!(job_id = %job_id, count_processed = outcome.count_processed, "Sync job finished");
                }
                Ok(Err(e)) => {
                    tracing::debug!(job_id = %job_id, error = %e, "Sync job ended without completing");
                }
                Err(join_err) => {
                    let message = if join_err.is_panic() {
                        format!("sync task panicked: {}", panic_message(join_err.into_panic()))
                    } else {
                        "sync task was aborted".to_string()
                    };
                    tracing::error!(job_id = %job_id, store_id = %store_id, error = %message, "Sync task did not finish");
                    engine.record_failure(&store_id, &control, &message).await;
                }
            }

            let mut registry = registry.lock().await;
            if registry.active_by_store.get(&store_id) == Some(&job_id) {
                registry.active_by_store.remove(&store_id);
            }
            let evicted = registry.evict_finished(&store_id, FINISHED_JOBS_PER_STORE);
            if evicted > 0 {
                tracing::debug!(store_id = %store_id, evicted = evicted, "Evicted finished sync jobs");
            }
            drop(registry);
            let _ = done_tx.send(true);
        });

        tracing::info!(job_id = %job_id, store_id = %store_id, force = force, "Sync job started");
        Ok(job_id)
    }

    /// Scheduler tick: starts a sync for every due store without a running job.
    /// Active and pending stores are due; an errored store is due only while it
    /// still has a fresh checkpoint to resume from.
    pub async fn start_due_syncs(&self) -> Result<Vec<Uuid>> {
        let stores = self.engine.graph_store().list_stores().await?;
        let mut started = Vec::new();
        for store in stores {
            if !self.is_due(&store).await {
                continue;
            }
            if self.is_running(&store.id).await {
                tracing::debug!(store_id = %store.id, "Store already syncing; skipping schedule");
                continue;
            }
            match self.start_sync(&store.id, false).await {
                Ok(job_id) => {
                    tracing::info!(store_id = %store.id, job_id = %job_id, "Scheduled sync started");
                    started.push(job_id);
                }
                Err(e) => tracing::warn!(store_id = %store.id, error = %e, "Failed to start scheduled sync"),
            }
        }
        Ok(started)
    }

    async fn is_due(&self, store: &Store) -> bool {
        if store.is_syncable() {
            return true;
        }
        if store.status != StoreStatus::Error {
            return false;
        }
        match self.engine.checkpoints().load(&store.id).await {
            Ok(checkpoint) => checkpoint.is_some(),
            Err(e) => {
                tracing::warn!(store_id = %store.id, error = %e, "Failed to read checkpoint; not resuming");
                false
            }
        }
    }

    /// Status of the running job for the store, else its most recent one.
    pub async fn get_status(&self, store_id: &str) -> Option<JobStatusView> {
        let registry = self.registry.lock().await;
        let entry = registry
            .active_by_store
            .get(store_id)
            .and_then(|id| registry.jobs.get(id))
            .or_else(|| registry.latest_for_store(store_id))?;
        let view = JobStatusView::from(&*entry.control.job.read().await);
        Some(view)
    }

    pub async fn job_status(&self, job_id: Uuid) -> Option<JobStatusView> {
        let registry = self.registry.lock().await;
        let entry = registry.jobs.get(&job_id)?;
        let view = JobStatusView::from(&*entry.control.job.read().await);
        Some(view)
    }

    pub async fn is_running(&self, store_id: &str) -> bool {
        self.registry.lock().await.active_by_store.contains_key(store_id)
    }

    /// Signals the store's running job to stop at its next stage boundary.
    pub async fn cancel(&self, store_id: &str) -> bool {
        let registry = self.registry.lock().await;
        let Some(entry) = registry
            .active_by_store
            .get(store_id)
            .and_then(|id| registry.jobs.get(id))
        else {
            return false;
        };
        entry.control.cancel.cancel();
        tracing::info!(store_id = %store_id, "Sync cancellation requested");
        true
    }

    /// Waits for the job's supervisor to finish and returns its final status.
    pub async fn wait(&self, job_id: Uuid) -> Result<JobStatusView> {
        let (mut done, control) = {
            let registry = self.registry.lock().await;
            let entry = registry
                .jobs
                .get(&job_id)
                .ok_or_else(|| CatalogError::Sync(format!("Unknown job {}", job_id)))?;
            (entry.done.clone(), entry.control.clone())
        };
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        let view = JobStatusView::from(&*control.job.read().await);
        Ok(view)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
