use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};

use super::{decode_entities, html_to_text, non_empty, parse_price, Auth, HttpFetcher, Page, PageCursor, ProviderAdapter};
use crate::models::*;
use crate::resilience::map_concurrent;

const PER_PAGE: usize = 100;
const VARIATION_FETCH_CONCURRENCY: usize = 4;
const MAX_CATEGORY_PAGES: u64 = 50;
const MAX_VARIATION_PAGES: u64 = 10;

#[derive(Debug, Deserialize)]
pub struct WooProduct {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "type", default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub regular_price: Option<String>,
    #[serde(default)]
    pub stock_status: Option<String>,
    #[serde(default)]
    pub stock_quantity: Option<i64>,
    #[serde(default = "default_true")]
    pub purchasable: bool,
    #[serde(default)]
    pub categories: Vec<WooTerm>,
    #[serde(default)]
    pub tags: Vec<WooTerm>,
    #[serde(default)]
    pub images: Vec<WooImage>,
    #[serde(default)]
    pub attributes: Vec<WooAttribute>,
    #[serde(default)]
    pub variations: Vec<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WooVariation {
    pub id: u64,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub regular_price: Option<String>,
    #[serde(default)]
    pub stock_status: Option<String>,
    #[serde(default)]
    pub stock_quantity: Option<i64>,
    #[serde(default = "default_true")]
    pub purchasable: bool,
    #[serde(default)]
    pub attributes: Vec<WooVariationAttribute>,
}

#[derive(Debug, Deserialize)]
pub struct WooTerm {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct WooImage {
    pub src: String,
}

#[derive(Debug, Deserialize)]
pub struct WooAttribute {
    pub name: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct WooVariationAttribute {
    pub name: String,
    #[serde(default)]
    pub option: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WooCategory {
    id: u64,
    name: String,
    #[serde(default)]
    parent: u64,
}

fn default_true() -> bool {
    true
}

fn is_size_attribute(name: &str) -> bool {
    let n = name.to_lowercase();
    n.contains("size") || n.contains("taglia")
}

fn is_color_attribute(name: &str) -> bool {
    let n = name.to_lowercase();
    n.contains("color") || n.contains("colour") || n.contains("colore")
}

fn in_stock(stock_status: Option<&str>, quantity: Option<i64>) -> bool {
    stock_status.map_or(true, |s| s == "instock") && quantity.map_or(true, |q| q > 0)
}

fn compare_at(regular: Option<&str>, price: f64) -> Option<f64> {
    let regular = parse_price(regular);
    if regular > price {
        Some(regular)
    } else {
        None
    }
}

pub struct WooCommerceAdapter {
    fetcher: HttpFetcher,
    store_id: String,
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
}

impl WooCommerceAdapter {
    pub fn new(fetcher: HttpFetcher, store_id: String, base_url: String, consumer_key: String, consumer_secret: String) -> Self {
        Self {
            fetcher,
            store_id,
            base_url,
            consumer_key,
            consumer_secret,
        }
    }

    fn auth(&self) -> Auth {
        Auth::Basic {
            username: self.consumer_key.clone(),
            password: self.consumer_secret.clone(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/wp-json/wc/v3/{}", self.base_url, path)
    }

    async fn fetch_variations(&self, product_id: u64) -> Result<Vec<WooVariation>> {
        let mut variations: Vec<WooVariation> = Vec::new();
        let mut page = 1u64;
        loop {
            let url = self.api_url(&format!(
                "products/{}/variations?per_page={}&page={}",
                product_id, PER_PAGE, page
            ));
            let fetched = self.fetcher.get_json(&url, &self.auth()).await?;
            let total_pages = fetched.header_u64("X-WP-TotalPages");
            let batch: Vec<WooVariation> = serde_json::from_value(fetched.body)?;
            let done = batch.is_empty() || total_pages.map_or(false, |tp| page >= tp) || page >= MAX_VARIATION_PAGES;
            variations.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(variations)
    }

    fn simple_variant(raw: &WooProduct) -> Variant {
        let price = parse_price(raw.price.as_deref());
        let mut variant = Variant::new(raw.id.to_string(), price);
        variant.sku = non_empty(raw.sku.clone());
        variant.compare_at_price = compare_at(raw.regular_price.as_deref(), price);
        variant.available = raw.purchasable && in_stock(raw.stock_status.as_deref(), raw.stock_quantity);
        variant.inventory_quantity = raw.stock_quantity;
        for attr in &raw.attributes {
            // Only a single-valued attribute describes the one variant
            if attr.options.len() != 1 {
                continue;
            }
            if is_size_attribute(&attr.name) {
                variant.size = non_empty(attr.options.first().cloned());
            } else if is_color_attribute(&attr.name) {
                variant.color = non_empty(attr.options.first().cloned());
            }
        }
        variant
    }

    fn variation_variant(raw: WooVariation) -> Option<Variant> {
        if raw.status.as_deref().map_or(false, |s| s != "publish") {
            return None;
        }
        let price = parse_price(raw.price.as_deref());
        let mut variant = Variant::new(raw.id.to_string(), price);
        variant.sku = non_empty(raw.sku);
        variant.compare_at_price = compare_at(raw.regular_price.as_deref(), price);
        variant.available = raw.purchasable && in_stock(raw.stock_status.as_deref(), raw.stock_quantity);
        variant.inventory_quantity = raw.stock_quantity;
        for attr in raw.attributes {
            if is_size_attribute(&attr.name) {
                variant.size = non_empty(attr.option);
            } else if is_color_attribute(&attr.name) {
                variant.color = non_empty(attr.option);
            }
        }
        let title: Vec<String> = [variant.size.clone(), variant.color.clone()].into_iter().flatten().collect();
        variant.title = if title.is_empty() { None } else { Some(title.join(" / ")) };
        Some(variant)
    }

    fn normalize(&self, raw: WooProduct, variations: Vec<WooVariation>) -> Option<Product> {
        if raw.status.as_deref().map_or(false, |s| s != "publish") {
            return None;
        }

        let variants: Vec<Variant> = if raw.product_type.as_deref() == Some("variable") {
            variations.into_iter().filter_map(Self::variation_variant).collect()
        } else {
            vec![Self::simple_variant(&raw)]
        };
        let variants: Vec<Variant> = variants.into_iter().filter(|v| v.is_purchasable()).collect();
        if variants.is_empty() {
            return None;
        }

        let description = non_empty(raw.description).or_else(|| non_empty(raw.short_description)).unwrap_or_default();
        let mut product = Product::new(raw.id.to_string(), self.store_id.clone(), raw.name);
        if !description.is_empty() {
            product.description = description;
            product.description_source = DescriptionSource::Original;
        }
        product.handle = non_empty(raw.slug);
        product.sku = non_empty(raw.sku).or_else(|| variants.iter().find_map(|v| v.sku.clone()));
        product.tags = raw.tags.into_iter().map(|t| decode_entities(t.name.trim())).filter(|t| !t.is_empty()).collect();
        product.raw_categories = raw
            .categories
            .into_iter()
            .map(|c| decode_entities(c.name.trim()))
            .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("uncategorized"))
            .collect();
        product.images = raw.images.into_iter().map(|i| i.src).collect();
        product.variants = variants;
        Some(product)
    }
}

#[async_trait]
impl ProviderAdapter for WooCommerceAdapter {
    fn platform(&self) -> &'static str {
        "woocommerce"
    }

    fn initial_cursor(&self) -> PageCursor {
        PageCursor(json!({ "page": 1 }))
    }

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page> {
        let page = cursor.u64_field("page").unwrap_or(1).max(1);
        let url = self.api_url(&format!(
            "products?per_page={}&page={}&status=publish&stock_status=instock&orderby=id&order=asc",
            PER_PAGE, page
        ));
        let fetched = self.fetcher.get_json(&url, &self.auth()).await?;
        let total = fetched.header_u64("X-WP-Total");
        let total_pages = fetched.header_u64("X-WP-TotalPages");
        let raw: Vec<WooProduct> = serde_json::from_value(fetched.body)?;
        let raw_count = raw.len();

        let mut seen = HashSet::new();
        let raw: Vec<WooProduct> = raw.into_iter().filter(|p| seen.insert(p.id)).collect();

        let variable_ids: Vec<u64> = raw
            .iter()
            .filter(|p| p.product_type.as_deref() == Some("variable") && !p.variations.is_empty())
            .map(|p| p.id)
            .collect();
        let fetched_variations = map_concurrent(variable_ids.clone(), VARIATION_FETCH_CONCURRENCY, |id| self.fetch_variations(id)).await;
        let mut variations: HashMap<u64, Vec<WooVariation>> = HashMap::new();
        for (id, result) in variable_ids.into_iter().zip(fetched_variations) {
            variations.insert(id, result?);
        }

        let items: Vec<Product> = raw
            .into_iter()
            .filter_map(|p| {
                let vars = variations.remove(&p.id).unwrap_or_default();
                self.normalize(p, vars)
            })
            .collect();

        tracing::debug!(
            page = page,
            raw_count = raw_count,
            kept = items.len(),
            total = ?total,
            total_pages = ?total_pages,
            "Fetched WooCommerce page"
        );
        Ok(Page {
            items,
            next_cursor: PageCursor(json!({ "page": page + 1 })),
            has_more: raw_count > 0 && total_pages.map_or(true, |tp| page < tp),
            raw_count,
        })
    }

    async fn fetch_category_tree(&self) -> Result<Vec<Category>> {
        let mut raw: Vec<WooCategory> = Vec::new();
        let mut page = 1u64;
        loop {
            let url = self.api_url(&format!("products/categories?per_page={}&page={}", PER_PAGE, page));
            let fetched = self.fetcher.get_json(&url, &self.auth()).await?;
            let total_pages = fetched.header_u64("X-WP-TotalPages");
            let batch: Vec<WooCategory> = serde_json::from_value(fetched.body)?;
            let done = batch.is_empty() || total_pages.map_or(false, |tp| page >= tp) || page >= MAX_CATEGORY_PAGES;
            raw.extend(batch);
            if done {
                break;
            }
            page += 1;
        }

        let names: HashMap<u64, String> = raw.iter().map(|c| (c.id, decode_entities(c.name.trim()))).collect();
        let mut seen = HashSet::new();
        Ok(raw
            .into_iter()
            .filter_map(|c| {
                let name = names.get(&c.id).cloned().unwrap_or_default();
                if name.is_empty() || name.eq_ignore_ascii_case("uncategorized") || !seen.insert(label_key(&name)) {
                    return None;
                }
                let mut category = Category::new(name);
                category.parent = if c.parent == 0 { None } else { names.get(&c.parent).cloned() };
                category.external_id = Some(c.id.to_string());
                Some(category)
            })
            .collect())
    }

    async fn shop_metadata(&self) -> Result<ShopMetadata> {
        let auth = self.auth();
        let count_url = self.api_url("products?per_page=1&status=publish&stock_status=instock");
        let counted = self.fetcher.get_json(&count_url, &auth).await?;

        // Store name and currency need broader key scopes; both are optional
        let name = match self.fetcher.get_json(&format!("{}/wp-json", self.base_url), &auth).await {
            Ok(root) => root.body.get("name").and_then(|v| v.as_str()).map(decode_entities),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read WooCommerce site name");
                None
            }
        };
        let currency = match self
            .fetcher
            .get_json(&self.api_url("settings/general/woocommerce_currency"), &auth)
            .await
        {
            Ok(setting) => setting.body.get("value").and_then(|v| v.as_str()).map(String::from),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read WooCommerce currency setting");
                None
            }
        };

        Ok(ShopMetadata {
            name,
            currency,
            total_products: counted.header_u64("X-WP-Total"),
        })
    }

    fn post_process(&self, product: &mut Product) {
        product.title = decode_entities(product.title.trim());
        if !product.description.is_empty() {
            product.description = html_to_text(&product.description);
        }
        for variant in &mut product.variants {
            if let Some(title) = variant.title.take() {
                variant.title = Some(decode_entities(&title));
            }
        }
    }
}
