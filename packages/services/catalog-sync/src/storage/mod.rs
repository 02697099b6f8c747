pub mod mongo;
pub mod persistence;

pub use self::mongo::MongoGraphStore;
pub use self::persistence::{FailedBatch, PageSaveReport, PersistenceLayer};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::models::*;

/// Destination graph. Nodes are Store, Product, Variant, Category and Demographic.
/// All writes are create-or-merge so re-processing a page is safe.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn load_store(&self, store_id: &str) -> Result<Option<Store>>;

    async fn list_stores(&self) -> Result<Vec<Store>>;

    async fn upsert_application_and_store(&self, store: &Store, metadata: &ShopMetadata) -> Result<()>;

    /// Merges category nodes, their parent links and the store link. Returns the number written.
    async fn upsert_categories(&self, store_id: &str, categories: &[Category]) -> Result<usize>;

    /// Category names previously linked to the store.
    async fn category_names(&self, store_id: &str) -> Result<Vec<String>>;

    async fn existing_product_ids(&self, store_id: &str, candidate_ids: &[String]) -> Result<HashSet<String>>;

    /// One atomic unit: every product in the slice is written or none is.
    async fn save_product_batch(&self, products: &[Product], store_id: &str) -> Result<()>;

    async fn update_store_status(
        &self,
        store_id: &str,
        status: StoreStatus,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Tallies over every product the store currently owns.
    async fn compute_store_context(&self, store_id: &str) -> Result<StoreContext>;

    async fn save_store_context(&self, store_id: &str, context: &StoreContext) -> Result<()>;
}
