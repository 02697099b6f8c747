use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;

use super::{decode_entities, html_to_text, non_empty, parse_price, Auth, HttpFetcher, Page, PageCursor, ProviderAdapter};
use crate::models::*;

const PAGE_LIMIT: usize = 250;
const DEFAULT_API_VERSION: &str = "2024-01";
// Public collections listing has no total; stop walking after this many pages
const MAX_COLLECTION_PAGES: u64 = 40;

#[derive(Debug, Deserialize)]
pub struct ShopifyProductsResponse {
    #[serde(default)]
    pub products: Vec<ShopifyProduct>,
}

#[derive(Debug, Deserialize)]
pub struct ShopifyProduct {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    // Array on products.json, comma separated string on the Admin API
    #[serde(default)]
    pub tags: ShopifyTags,
    // Admin API only
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub options: Vec<ShopifyOption>,
    #[serde(default)]
    pub images: Vec<ShopifyImage>,
    #[serde(default)]
    pub variants: Vec<ShopifyVariant>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ShopifyTags {
    List(Vec<String>),
    Joined(String),
}

impl Default for ShopifyTags {
    fn default() -> Self {
        ShopifyTags::List(Vec::new())
    }
}

impl ShopifyTags {
    fn into_vec(self) -> Vec<String> {
        let raw = match self {
            ShopifyTags::List(v) => v,
            ShopifyTags::Joined(s) => s.split(',').map(|t| t.to_string()).collect(),
        };
        raw.into_iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct ShopifyOption {
    pub name: String,
    #[serde(default)]
    pub position: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct ShopifyImage {
    pub src: String,
}

#[derive(Debug, Deserialize)]
pub struct ShopifyVariant {
    pub id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub compare_at_price: Option<String>,
    // products.json only; the Admin API reports inventory instead
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub inventory_quantity: Option<i64>,
    #[serde(default)]
    pub inventory_management: Option<String>,
    #[serde(default)]
    pub inventory_policy: Option<String>,
    #[serde(default)]
    pub option1: Option<String>,
    #[serde(default)]
    pub option2: Option<String>,
    #[serde(default)]
    pub option3: Option<String>,
}

fn default_available() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ShopifyCollection {
    id: u64,
    title: String,
}

pub struct ShopifyAdapter {
    fetcher: HttpFetcher,
    store_id: String,
    base_url: String,
    access_token: Option<String>,
    api_version: String,
}

impl ShopifyAdapter {
    pub fn new(
        fetcher: HttpFetcher,
        store_id: String,
        base_url: String,
        access_token: Option<String>,
        api_version: Option<String>,
    ) -> Self {
        Self {
            fetcher,
            store_id,
            base_url,
            access_token: access_token.filter(|t| !t.is_empty()),
            api_version: api_version.unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        }
    }

    fn auth(&self) -> Auth {
        match &self.access_token {
            Some(token) => Auth::Header {
                name: "X-Shopify-Access-Token".to_string(),
                value: token.clone(),
            },
            None => Auth::None,
        }
    }

    fn admin_url(&self, path: &str) -> String {
        format!("{}/admin/api/{}/{}", self.base_url, self.api_version, path)
    }

    async fn fetch_collections(&self, path: &str) -> Result<Vec<ShopifyCollection>> {
        let auth = self.auth();
        let mut all = Vec::new();
        let mut page = 1u64;
        loop {
            let url = if self.access_token.is_some() {
                format!("{}?limit={}&since_id={}", self.admin_url(path), PAGE_LIMIT, all.last().map_or(0, |c: &ShopifyCollection| c.id))
            } else {
                format!("{}/{}?limit={}&page={}", self.base_url, path, PAGE_LIMIT, page)
            };
            let fetched = self.fetcher.get_json(&url, &auth).await?;
            let key = if path.starts_with("custom") {
                "custom_collections"
            } else if path.starts_with("smart") {
                "smart_collections"
            } else {
                "collections"
            };
            let batch: Vec<ShopifyCollection> = match fetched.body.get(key) {
                Some(v) => serde_json::from_value(v.clone())?,
                None => Vec::new(),
            };
            if batch.is_empty() || page >= MAX_COLLECTION_PAGES {
                all.extend(batch);
                break;
            }
            all.extend(batch);
            page += 1;
        }
        Ok(all)
    }

    fn normalize(&self, raw: ShopifyProduct) -> Option<Product> {
        let publishable = raw.status.as_deref().map_or(true, |s| s.eq_ignore_ascii_case("active"))
            && (self.access_token.is_none() || raw.published_at.is_some());
        if !publishable {
            return None;
        }

        let option_index = |needle: &[&str]| {
            raw.options
                .iter()
                .enumerate()
                .find(|(_, o)| needle.iter().any(|n| o.name.to_lowercase().contains(n)))
                .map(|(i, o)| o.position.map(|p| p as usize).unwrap_or(i + 1))
        };
        let size_pos = option_index(&["size", "taglia", "größe"]);
        let color_pos = option_index(&["color", "colour", "colore", "farbe"]);

        let variants: Vec<Variant> = raw
            .variants
            .into_iter()
            .map(|v| {
                let tracked = v.inventory_management.as_deref() == Some("shopify")
                    && v.inventory_policy.as_deref() != Some("continue");
                let pick = |pos: Option<usize>| match pos {
                    Some(1) => non_empty(v.option1.clone()),
                    Some(2) => non_empty(v.option2.clone()),
                    Some(3) => non_empty(v.option3.clone()),
                    _ => None,
                };
                let mut variant = Variant::new(v.id.to_string(), parse_price(v.price.as_deref()));
                variant.size = pick(size_pos);
                variant.color = pick(color_pos);
                variant.title = non_empty(v.title);
                variant.sku = non_empty(v.sku);
                variant.compare_at_price = v
                    .compare_at_price
                    .as_deref()
                    .map(|p| parse_price(Some(p)))
                    .filter(|p| *p > 0.0);
                variant.available = v.available;
                variant.inventory_quantity = if tracked { v.inventory_quantity } else { None };
                variant
            })
            .filter(|v| v.is_purchasable())
            .collect();
        if variants.is_empty() {
            return None;
        }

        let mut product = Product::new(raw.id.to_string(), self.store_id.clone(), raw.title);
        product.description = raw.body_html.unwrap_or_default();
        if !product.description.trim().is_empty() {
            product.description_source = DescriptionSource::Original;
        }
        product.handle = non_empty(raw.handle);
        product.vendor = non_empty(raw.vendor);
        product.product_type = non_empty(raw.product_type);
        product.tags = raw.tags.into_vec();
        product.raw_categories = product.product_type.iter().cloned().collect();
        product.sku = variants.iter().find_map(|v| v.sku.clone());
        product.images = raw.images.into_iter().map(|i| i.src).collect();
        product.variants = variants;
        Some(product)
    }
}

#[async_trait]
impl ProviderAdapter for ShopifyAdapter {
    fn platform(&self) -> &'static str {
        "shopify"
    }

    fn initial_cursor(&self) -> PageCursor {
        if self.access_token.is_some() {
            PageCursor(json!({ "since_id": 0 }))
        } else {
            PageCursor(json!({ "page": 1 }))
        }
    }

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page> {
        let (url, next_position) = match &self.access_token {
            Some(_) => {
                let since_id = cursor.u64_field("since_id").unwrap_or(0);
                (
                    format!("{}?limit={}&since_id={}&status=active", self.admin_url("products.json"), PAGE_LIMIT, since_id),
                    None,
                )
            }
            None => {
                let page = cursor.u64_field("page").unwrap_or(1).max(1);
                (format!("{}/products.json?limit={}&page={}", self.base_url, PAGE_LIMIT, page), Some(page + 1))
            }
        };

        let fetched = self.fetcher.get_json(&url, &self.auth()).await?;
        let response: ShopifyProductsResponse = serde_json::from_value(fetched.body)?;
        let raw_count = response.products.len();

        let next_cursor = match next_position {
            Some(page) => PageCursor(json!({ "page": page })),
            None => {
                let previous = cursor.u64_field("since_id").unwrap_or(0);
                let max_id = response.products.iter().map(|p| p.id).max().unwrap_or(previous);
                PageCursor(json!({ "since_id": max_id.max(previous) }))
            }
        };

        let mut seen = HashSet::new();
        let items: Vec<Product> = response
            .products
            .into_iter()
            .filter(|p| seen.insert(p.id))
            .filter_map(|p| self.normalize(p))
            .collect();

        tracing::debug!(url = %url, raw_count = raw_count, kept = items.len(), "Fetched Shopify page");
        Ok(Page {
            items,
            next_cursor,
            has_more: raw_count > 0,
            raw_count,
        })
    }

    async fn fetch_category_tree(&self) -> Result<Vec<Category>> {
        let collections = if self.access_token.is_some() {
            let mut all = self.fetch_collections("custom_collections.json").await?;
            all.extend(self.fetch_collections("smart_collections.json").await?);
            all
        } else {
            self.fetch_collections("collections.json").await?
        };

        let mut seen = HashSet::new();
        Ok(collections
            .into_iter()
            .filter_map(|c| {
                let name = decode_entities(c.title.trim());
                if name.is_empty() || !seen.insert(label_key(&name)) {
                    return None;
                }
                let mut category = Category::new(name);
                category.external_id = Some(c.id.to_string());
                Some(category)
            })
            .collect())
    }

    async fn shop_metadata(&self) -> Result<ShopMetadata> {
        let auth = self.auth();
        if self.access_token.is_some() {
            let shop = self.fetcher.get_json(&self.admin_url("shop.json"), &auth).await?;
            let count = self.fetcher.get_json(&self.admin_url("products/count.json"), &auth).await?;
            Ok(ShopMetadata {
                name: shop.body.pointer("/shop/name").and_then(|v| v.as_str()).map(String::from),
                currency: shop.body.pointer("/shop/currency").and_then(|v| v.as_str()).map(String::from),
                total_products: count.body.get("count").and_then(|v| v.as_u64()),
            })
        } else {
            let meta = self.fetcher.get_json(&format!("{}/meta.json", self.base_url), &auth).await?;
            Ok(ShopMetadata {
                name: meta.body.get("name").and_then(|v| v.as_str()).map(String::from),
                currency: meta.body.get("currency").and_then(|v| v.as_str()).map(String::from),
                total_products: meta.body.get("published_products_count").and_then(|v| v.as_u64()),
            })
        }
    }

    fn post_process(&self, product: &mut Product) {
        product.title = decode_entities(product.title.trim());
        if !product.description.is_empty() {
            product.description = html_to_text(&product.description);
        }
    }
}
