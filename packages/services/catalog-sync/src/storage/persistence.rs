use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::GraphStore;
use crate::models::*;
use crate::resilience::{map_concurrent, with_retry, RetryPolicy, Retryable};

/// Sub-batch skipped after its retries were exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedBatch {
    pub product_ids: Vec<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageSaveReport {
    pub persisted: usize,
    pub failed_batches: Vec<FailedBatch>,
    /// Products whose sub-batch was never started because the run was cancelled.
    pub cancelled: usize,
}

impl PageSaveReport {
    pub fn is_clean(&self) -> bool {
        self.failed_batches.is_empty() && self.cancelled == 0
    }

    pub fn failed_products(&self) -> usize {
        self.failed_batches.iter().map(|b| b.product_ids.len()).sum()
    }
}

enum BatchOutcome {
    Saved(usize),
    Dropped(FailedBatch),
    Cancelled(usize),
    Fatal(CatalogError),
}

/// Splits a page into bounded transactions and writes them with limited fan-out.
#[derive(Clone)]
pub struct PersistenceLayer {
    store: Arc<dyn GraphStore>,
    batch_size: usize,
    fan_out: usize,
    policy: RetryPolicy,
}

impl PersistenceLayer {
    pub fn new(store: Arc<dyn GraphStore>, batch_size: usize, fan_out: usize, policy: RetryPolicy) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            fan_out: fan_out.max(1),
            policy,
        }
    }

    pub async fn save_page(
        &self,
        products: Vec<Product>,
        store_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PageSaveReport> {
        let batches: Vec<Vec<Product>> = products.chunks(self.batch_size).map(|c| c.to_vec()).collect();

        let outcomes = map_concurrent(batches, self.fan_out, |batch| async move {
            if cancel.is_cancelled() {
                return BatchOutcome::Cancelled(batch.len());
            }
            let result = with_retry(&self.policy, "save_product_batch", || {
                self.store.save_product_batch(&batch, store_id)
            })
            .await;
            match result {
                Ok(()) => BatchOutcome::Saved(batch.len()),
                Err(e) if e.retry_class().is_retryable() => {
                    let product_ids: Vec<String> = batch.iter().map(|p| p.id.clone()).collect();
                    tracing::error!(
                        store_id = %store_id,
                        product_ids = ?product_ids,
                        error = %e,
                        "Dropping product batch after exhausting retries"
                    );
                    BatchOutcome::Dropped(FailedBatch { product_ids, error: e.to_string() })
                }
                Err(e) => BatchOutcome::Fatal(e),
            }
        })
        .await;

        let mut report = PageSaveReport::default();
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Saved(n) => report.persisted += n,
                BatchOutcome::Dropped(failed) => report.failed_batches.push(failed),
                BatchOutcome::Cancelled(n) => report.cancelled += n,
                BatchOutcome::Fatal(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FlakyStore {
        attempts: AtomicU32,
        conflicts_before_success: u32,
        saved: Mutex<Vec<String>>,
        fatal: bool,
    }

    #[async_trait]
    impl GraphStore for FlakyStore {
        async fn load_store(&self, _: &str) -> Result<Option<Store>> {
            Ok(None)
        }
        async fn list_stores(&self) -> Result<Vec<Store>> {
            Ok(Vec::new())
        }
        async fn upsert_application_and_store(&self, _: &Store, _: &ShopMetadata) -> Result<()> {
            Ok(())
        }
        async fn upsert_categories(&self, _: &str, c: &[Category]) -> Result<usize> {
            Ok(c.len())
        }
        async fn category_names(&self, _: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn existing_product_ids(&self, _: &str, _: &[String]) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }
        async fn save_product_batch(&self, products: &[Product], _: &str) -> Result<()> {
            if self.fatal {
                return Err(CatalogError::AuthRejected("graph store".to_string()));
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.conflicts_before_success {
                return Err(CatalogError::LockConflict(format!("attempt {}", attempt)));
            }
            self.saved.lock().await.extend(products.iter().map(|p| p.id.clone()));
            Ok(())
        }
        async fn update_store_status(&self, _: &str, _: StoreStatus, _: Option<DateTime<Utc>>) -> Result<()> {
            Ok(())
        }
        async fn compute_store_context(&self, _: &str) -> Result<StoreContext> {
            Ok(StoreContext::default())
        }
        async fn save_store_context(&self, _: &str, _: &StoreContext) -> Result<()> {
            Ok(())
        }
    }

    fn products(n: usize) -> Vec<Product> {
        (0..n).map(|i| Product::new(i.to_string(), "s", format!("P{}", i))).collect()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(500))
    }

    #[tokio::test(start_paused = true)]
    async fn splits_into_sub_batches() {
        let store = Arc::new(FlakyStore::default());
        let layer = PersistenceLayer::new(store.clone(), 25, 2, policy());
        let report = layer.save_page(products(60), "s", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.persisted, 60);
        assert!(report.is_clean());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_conflicts_drop_the_batch() {
        let store = Arc::new(FlakyStore { conflicts_before_success: u32::MAX, ..Default::default() });
        let layer = PersistenceLayer::new(store.clone(), 25, 2, policy());
        let report = layer.save_page(products(3), "s", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.persisted, 0);
        assert_eq!(report.failed_batches.len(), 1);
        assert_eq!(report.failed_batches[0].product_ids, vec!["0", "1", "2"]);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_propagate() {
        let store = Arc::new(FlakyStore { fatal: true, ..Default::default() });
        let layer = PersistenceLayer::new(store, 25, 2, policy());
        let err = layer.save_page(products(3), "s", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CatalogError::AuthRejected(_)));
    }

    #[tokio::test]
    async fn cancelled_token_skips_every_batch() {
        let store = Arc::new(FlakyStore::default());
        let layer = PersistenceLayer::new(store.clone(), 10, 2, policy());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = layer.save_page(products(30), "s", &cancel).await.unwrap();
        assert_eq!(report.cancelled, 30);
        assert!(store.saved.lock().await.is_empty());
    }
}
