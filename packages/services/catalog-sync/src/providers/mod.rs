pub mod http;
pub mod shopify;
pub mod woocommerce;

pub use self::http::{Auth, FetchedJson, HttpFetcher};
pub use self::shopify::ShopifyAdapter;
pub use self::woocommerce::WooCommerceAdapter;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};

use crate::models::*;

/// Provider-specific resume token. Opaque to everything but the adapter that minted it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct PageCursor(pub Value);

impl PageCursor {
    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    /// Publishable, purchasable products only.
    pub items: Vec<Product>,
    pub next_cursor: PageCursor,
    pub has_more: bool,
    /// Items the platform returned before filtering.
    pub raw_count: usize,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn platform(&self) -> &'static str;

    fn initial_cursor(&self) -> PageCursor;

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page>;

    async fn fetch_category_tree(&self) -> Result<Vec<Category>>;

    async fn shop_metadata(&self) -> Result<ShopMetadata>;

    /// Shop-specific cleanup applied to every fetched product before enrichment.
    fn post_process(&self, _product: &mut Product) {}
}

pub trait AdapterFactory: Send + Sync {
    fn build(&self, store: &Store) -> Result<Arc<dyn ProviderAdapter>>;
}

/// Picks the adapter from the store's platform descriptor.
#[derive(Clone)]
pub struct PlatformAdapterFactory {
    fetcher: HttpFetcher,
}

impl PlatformAdapterFactory {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

impl AdapterFactory for PlatformAdapterFactory {
    fn build(&self, store: &Store) -> Result<Arc<dyn ProviderAdapter>> {
        match &store.platform {
            Platform::Shopify { access_token, api_version } => Ok(Arc::new(ShopifyAdapter::new(
                self.fetcher.clone(),
                store.id.clone(),
                store.base_url(),
                access_token.clone(),
                api_version.clone(),
            ))),
            Platform::WooCommerce { consumer_key, consumer_secret } => {
                if consumer_key.is_empty() || consumer_secret.is_empty() {
                    return Err(CatalogError::Configuration(format!(
                        "Store {} is missing WooCommerce credentials",
                        store.id
                    )));
                }
                Ok(Arc::new(WooCommerceAdapter::new(
                    self.fetcher.clone(),
                    store.id.clone(),
                    store.base_url(),
                    consumer_key.clone(),
                    consumer_secret.clone(),
                )))
            }
        }
    }
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("Invalid regex"))
}

/// Strips markup from a product description, keeping paragraph breaks.
pub fn html_to_text(html: &str) -> String {
    static SCRIPT: OnceLock<Regex> = OnceLock::new();
    static BREAK: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();

    let without_scripts = regex(&SCRIPT, r"(?is)<(script|style)[^>]*>.*?</(script|style)>").replace_all(html, " ");
    let with_breaks = regex(&BREAK, r"(?i)<br\s*/?>|</p>|</li>|</div>|</h[1-6]>").replace_all(&without_scripts, "\n");
    let stripped = regex(&TAG, r"<[^>]*>").replace_all(&with_breaks, "");
    let decoded = decode_entities(&stripped);

    let spaces = regex(&SPACES, r"[ \t\u{a0}]+");
    decoded
        .lines()
        .map(|line| spaces.replace_all(line, " ").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn decode_entities(text: &str) -> String {
    static NUMERIC: OnceLock<Regex> = OnceLock::new();

    let numeric = regex(&NUMERIC, r"&#([xX][0-9a-fA-F]+|[0-9]+);").replace_all(text, |caps: &regex::Captures| {
        let raw = &caps[1];
        let code = if let Some(hex) = raw.strip_prefix('x').or_else(|| raw.strip_prefix('X')) {
            u32::from_str_radix(hex, 16).ok()
        } else {
            raw.parse::<u32>().ok()
        };
        code.and_then(char::from_u32).map(|c| c.to_string()).unwrap_or_default()
    });

    // &amp; last so "&amp;lt;" stays "&lt;"
    numeric
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Parses a decimal price string; blanks and garbage read as zero.
pub(crate) fn parse_price(raw: Option<&str>) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|p| p.is_finite())
        .unwrap_or(0.0)
}

pub(crate) fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
