#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use catalog_sync::clients::{AiProvider, DescriptionStrategy};
use catalog_sync::config::Config;
use catalog_sync::models::*;
use catalog_sync::progress::{ProgressBroadcaster, ProgressEvent};
use catalog_sync::providers::{AdapterFactory, Page, PageCursor, ProviderAdapter};
use catalog_sync::storage::GraphStore;
use catalog_sync::sync::SyncEngine;

pub const STORE_ID: &str = "acme.test";

pub fn product(id: &str, price: f64) -> Product {
    let mut p = Product::new(id, STORE_ID, format!("Product {}", id));
    p.description = format!("<p>Linen piece &amp; more {}</p>", id);
    p.description_source = DescriptionSource::Original;
    p.images.push(format!("https://cdn.test/{}.jpg", id));
    let mut variant = Variant::new(format!("{}-v1", id), price);
    variant.size = Some("M".to_string());
    variant.color = Some("Red".to_string());
    p.variants.push(variant);
    p
}

pub fn products(prefix: &str, n: usize) -> Vec<Product> {
    (0..n).map(|i| product(&format!("{}{}", prefix, i), 10.0 + i as f64)).collect()
}

pub fn test_store() -> Store {
    Store::new(
        STORE_ID,
        "app-1",
        Platform::Shopify { access_token: None, api_version: None },
    )
}

pub fn test_config(checkpoint_dir: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.openai_api_key = Some("test-key".to_string());
    cfg.checkpoint_dir = checkpoint_dir.to_string_lossy().to_string();
    cfg.ai_max_requests_per_minute = 100_000;
    cfg.visual_trigger_categories = vec!["dresses".to_string()];
    cfg
}

/// In-memory graph store with failure injection.
#[derive(Default)]
pub struct InMemoryGraphStore {
    pub stores: Mutex<BTreeMap<String, Store>>,
    pub products: Mutex<BTreeMap<(String, String), Product>>,
    pub categories: Mutex<BTreeMap<String, Category>>,
    pub contexts: Mutex<BTreeMap<String, StoreContext>>,
    /// Any batch containing one of these ids fails with a lock conflict.
    pub poisoned_ids: Mutex<HashSet<String>>,
    /// The next N batch calls fail with a lock conflict.
    pub conflicts_remaining: AtomicU32,
    pub batch_calls: AtomicU32,
    pub writes: AtomicUsize,
}

impl InMemoryGraphStore {
    pub async fn with_store(store: Store) -> Arc<Self> {
        let graph = Arc::new(Self::default());
        graph.stores.lock().await.insert(store.id.clone(), store);
        graph
    }

    pub async fn poison(&self, ids: impl IntoIterator<Item = String>) {
        self.poisoned_ids.lock().await.extend(ids);
    }

    pub async fn upsert_known_categories(&self, names: &[&str]) {
        let mut categories = self.categories.lock().await;
        for name in names {
            categories.insert(label_key(name), Category::new(*name));
        }
    }

    pub async fn product_ids(&self) -> Vec<String> {
        self.products.lock().await.keys().map(|(_, id)| id.clone()).collect()
    }

    /// Products with their timestamps zeroed, for state comparison.
    pub async fn snapshot(&self) -> BTreeMap<String, Product> {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default();
        self.products
            .lock()
            .await
            .values()
            .map(|p| {
                let mut p = p.clone();
                p.updated_at = epoch;
                (p.id.clone(), p)
            })
            .collect()
    }

    pub async fn store_status(&self, store_id: &str) -> Option<StoreStatus> {
        self.stores.lock().await.get(store_id).map(|s| s.status)
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn load_store(&self, store_id: &str) -> Result<Option<Store>> {
        Ok(self.stores.lock().await.get(store_id).cloned())
    }

    async fn list_stores(&self) -> Result<Vec<Store>> {
        Ok(self.stores.lock().await.values().cloned().collect())
    }

    async fn upsert_application_and_store(&self, store: &Store, metadata: &ShopMetadata) -> Result<()> {
        let mut stores = self.stores.lock().await;
        let entry = stores.entry(store.id.clone()).or_insert_with(|| store.clone());
        entry.name = metadata.name.clone().or_else(|| entry.name.clone());
        entry.currency = metadata.currency.clone().or_else(|| entry.currency.clone());
        Ok(())
    }

    async fn upsert_categories(&self, _store_id: &str, categories: &[Category]) -> Result<usize> {
        let mut stored = self.categories.lock().await;
        for c in categories {
            stored.insert(c.key(), c.clone());
        }
        Ok(categories.len())
    }

    async fn category_names(&self, _store_id: &str) -> Result<Vec<String>> {
        Ok(self.categories.lock().await.values().map(|c| c.name.clone()).collect())
    }

    async fn existing_product_ids(&self, store_id: &str, candidate_ids: &[String]) -> Result<HashSet<String>> {
        let products = self.products.lock().await;
        Ok(candidate_ids
            .iter()
            .filter(|id| products.contains_key(&(store_id.to_string(), id.to_string())))
            .cloned()
            .collect())
    }

    async fn save_product_batch(&self, batch: &[Product], store_id: &str) -> Result<()> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.conflicts_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(CatalogError::LockConflict("simulated deadlock".to_string()));
        }
        {
            let poisoned = self.poisoned_ids.lock().await;
            if batch.iter().any(|p| poisoned.contains(&p.id)) {
                return Err(CatalogError::LockConflict("simulated permanent deadlock".to_string()));
            }
        }

        let mut products = self.products.lock().await;
        for p in batch {
            let key = (store_id.to_string(), p.id.clone());
            let mut incoming = p.clone();
            if let Some(existing) = products.get(&key) {
                if existing.sku.is_some() {
                    incoming.sku = existing.sku.clone();
                }
            }
            products.insert(key, incoming);
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn update_store_status(
        &self,
        store_id: &str,
        status: StoreStatus,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(store) = self.stores.lock().await.get_mut(store_id) {
            store.status = status;
            if last_sync.is_some() {
                store.last_sync = last_sync;
            }
        }
        Ok(())
    }

    async fn compute_store_context(&self, store_id: &str) -> Result<StoreContext> {
        let mut context = StoreContext::default();
        for ((sid, _), p) in self.products.lock().await.iter() {
            if sid != store_id {
                continue;
            }
            context.product_count += 1;
            if let Some(c) = &p.category {
                *context.categories.entry(label_key(c)).or_insert(0) += 1;
            }
            for d in &p.demographics {
                *context.demographics.entry(label_key(d)).or_insert(0) += 1;
            }
            if let Some(price) = p.min_price() {
                context.price_min = Some(context.price_min.map_or(price, |m| m.min(price)));
                context.price_max = Some(context.price_max.map_or(price, |m| m.max(price)));
            }
        }
        Ok(context)
    }

    async fn save_store_context(&self, store_id: &str, context: &StoreContext) -> Result<()> {
        self.contexts.lock().await.insert(store_id.to_string(), context.clone());
        if let Some(store) = self.stores.lock().await.get_mut(store_id) {
            store.context = Some(context.clone());
        }
        Ok(())
    }
}

/// Adapter serving fixed pages behind a `{"page": n}` cursor.
pub struct ScriptedAdapter {
    pub pages: Vec<Vec<Product>>,
    pub fetched_pages: Mutex<Vec<u64>>,
    /// Cancels the token when this page is requested.
    pub cancel_on_page: Mutex<Option<(u64, CancellationToken)>>,
    /// Page fetches wait for a permit when set.
    pub gate: Option<Arc<Semaphore>>,
    pub panic_on_page: Option<u64>,
    /// Fetching this page returns the built error.
    pub fail_on_page: Option<(u64, fn() -> CatalogError)>,
    pub fail_categories: bool,
}

impl ScriptedAdapter {
    pub fn new(pages: Vec<Vec<Product>>) -> Self {
        Self {
            pages,
            fetched_pages: Mutex::new(Vec::new()),
            cancel_on_page: Mutex::new(None),
            gate: None,
            panic_on_page: None,
            fail_on_page: None,
            fail_categories: false,
        }
    }

    pub fn total(&self) -> u64 {
        self.pages.iter().map(|p| p.len() as u64).sum()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn platform(&self) -> &'static str {
        "scripted"
    }

    fn initial_cursor(&self) -> PageCursor {
        PageCursor(json!({ "page": 1 }))
    }

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page> {
        let page = cursor.u64_field("page").unwrap_or(1);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        if self.panic_on_page == Some(page) {
            panic!("scripted adapter blew up on page {}", page);
        }
        if let Some((on_page, make_error)) = self.fail_on_page {
            if on_page == page {
                self.fetched_pages.lock().await.push(page);
                return Err(make_error());
            }
        }
        if let Some((on_page, token)) = self.cancel_on_page.lock().await.as_ref() {
            if *on_page == page {
                token.cancel();
            }
        }
        self.fetched_pages.lock().await.push(page);

        let items = self.pages.get(page as usize - 1).cloned().unwrap_or_default();
        Ok(Page {
            raw_count: items.len(),
            items,
            next_cursor: PageCursor(json!({ "page": page + 1 })),
            has_more: (page as usize) < self.pages.len(),
        })
    }

    async fn fetch_category_tree(&self) -> Result<Vec<Category>> {
        if self.fail_categories {
            return Err(CatalogError::Provider("category endpoint unavailable".to_string()));
        }
        let mut dresses = Category::new("Dresses");
        dresses.parent = Some("Clothing".to_string());
        Ok(vec![Category::new("Clothing"), dresses, Category::new("Shoes")])
    }

    async fn shop_metadata(&self) -> Result<ShopMetadata> {
        Ok(ShopMetadata {
            name: Some("Acme".to_string()),
            currency: Some("EUR".to_string()),
            total_products: Some(self.total()),
        })
    }

    fn post_process(&self, product: &mut Product) {
        product.description = catalog_sync::providers::html_to_text(&product.description);
    }
}

pub struct ScriptedFactory(pub Arc<ScriptedAdapter>);

impl AdapterFactory for ScriptedFactory {
    fn build(&self, _store: &Store) -> Result<Arc<dyn ProviderAdapter>> {
        Ok(self.0.clone())
    }
}

/// Deterministic AI provider.
#[derive(Default)]
pub struct FakeAi {
    pub calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
    pub fail_classification: bool,
    pub fail_embeddings: bool,
}

#[async_trait]
impl AiProvider for FakeAi {
    async fn classify_properties(&self, text: &str, categories: &[String]) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_classification {
            return Err(CatalogError::Ai("classifier unavailable".to_string()));
        }
        let category = if text.to_lowercase().contains("shoe") { "Shoes" } else { "Dresses" };
        assert!(categories.iter().any(|c| c == category), "candidates must include {}", category);
        Ok(json!({
            "product_type": "dress",
            "characteristics": ["linen", "short sleeves"],
            "color": "red",
            "demographic": "woman",
            "category": category,
            "style": "casual",
        }))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_embeddings {
            return Err(CatalogError::RateLimited { retry_after: None, message: "quota".to_string() });
        }
        Ok(vec![text.len() as f32, 1.0, 0.5])
    }

    async fn generate_description(&self, product: &Product, strategy: DescriptionStrategy) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match strategy {
            DescriptionStrategy::SearchGrounded => Ok(None),
            DescriptionStrategy::FromImage => Ok(Some(format!("Seen in a photo: {}", product.title))),
        }
    }

    async fn classify_image(&self, _image_url: &str, _categories: &[String]) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "color": "Crimson", "category": "dresses" }))
    }
}

#[derive(Default)]
pub struct RecordingBroadcaster {
    pub events: Mutex<Vec<(String, ProgressEvent)>>,
}

impl RecordingBroadcaster {
    pub async fn progress(&self) -> Vec<(u64, u64)> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|(_, e)| match e {
                ProgressEvent::Progress { processed, total } => Some((*processed, *total)),
                _ => None,
            })
            .collect()
    }

    pub async fn statuses(&self) -> Vec<JobStatus> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|(_, e)| match e {
                ProgressEvent::Status { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ProgressBroadcaster for RecordingBroadcaster {
    async fn publish(&self, channel: &str, event: &ProgressEvent) -> Result<()> {
        self.events.lock().await.push((channel.to_string(), event.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub graph: Arc<InMemoryGraphStore>,
    pub adapter: Arc<ScriptedAdapter>,
    pub ai: Arc<FakeAi>,
    pub broadcaster: Arc<RecordingBroadcaster>,
}

pub fn harness(cfg: Config, graph: Arc<InMemoryGraphStore>, adapter: Arc<ScriptedAdapter>, ai: Arc<FakeAi>) -> Harness {
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let engine = SyncEngine::new(
        cfg,
        graph.clone(),
        Arc::new(ScriptedFactory(adapter.clone())),
        ai.clone(),
        broadcaster.clone(),
    );
    Harness { engine, graph, adapter, ai, broadcaster }
}

/// Binds an axum router on an ephemeral local port and returns its base URL.
pub async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{}", addr)
}
