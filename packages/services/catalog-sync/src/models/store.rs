use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Platform {
    Shopify {
        // Without a token only the public storefront endpoints are used
        access_token: Option<String>,
        api_version: Option<String>,
    },
    WooCommerce {
        consumer_key: String,
        consumer_secret: String,
    },
}

impl Platform {
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Shopify { .. } => "shopify",
            Platform::WooCommerce { .. } => "woocommerce",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreStatus {
    Pending,
    Active,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    /// Platform domain, e.g. `acme.myshopify.com`.
    pub id: String,
    pub name: Option<String>,
    pub application_id: String,
    pub platform: Platform,
    // Overrides https://{id} (tests, staging shops behind a proxy)
    pub base_url: Option<String>,
    pub status: StoreStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub currency: Option<String>,
    pub context: Option<StoreContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    pub fn new(domain: impl Into<String>, application_id: impl Into<String>, platform: Platform) -> Self {
        let now = Utc::now();
        Self {
            id: domain.into(),
            name: None,
            application_id: application_id.into(),
            platform,
            base_url: None,
            status: StoreStatus::Pending,
            last_sync: None,
            currency: None,
            context: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}", self.id.trim_end_matches('/')),
        }
    }

    pub fn is_syncable(&self) -> bool {
        matches!(self.status, StoreStatus::Active | StoreStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ShopMetadata {
    pub name: Option<String>,
    pub currency: Option<String>,
    pub total_products: Option<u64>,
}

/// Per-store tallies written when a sync finishes cleanly; downstream suggestion
/// features read these instead of scanning the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StoreContext {
    pub product_count: u64,
    pub categories: BTreeMap<String, u64>,
    pub demographics: BTreeMap<String, u64>,
    pub currency: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl StoreContext {
    pub fn top_categories(&self, n: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self.categories.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }
}
