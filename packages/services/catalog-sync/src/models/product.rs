use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_PROPERTY: &str = "unknown";
pub const DEFAULT_DEMOGRAPHIC: &str = "woman";
pub const DEFAULT_CATEGORY: &str = "clothing";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionSource {
    Original,
    GoogleSearch,
    AiImage,
    #[default]
    None,
}

/// Normalized product as produced by a provider adapter and completed by enrichment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: String,
    pub store_id: String,
    pub title: String,
    pub description: String,
    pub description_source: DescriptionSource,
    pub sku: Option<String>,
    pub handle: Option<String>,
    pub vendor: Option<String>,
    pub product_type: Option<String>,
    pub tags: Vec<String>,
    // Collection / category names as the platform reports them
    pub raw_categories: Vec<String>,
    pub category: Option<String>,
    pub demographics: BTreeSet<String>,
    pub properties: Option<ProductProperties>,
    pub style_code: Option<String>,
    pub embeddings: ProductEmbeddings,
    pub images: Vec<String>,
    pub variants: Vec<Variant>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new(id: impl Into<String>, store_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            store_id: store_id.into(),
            title: title.into(),
            description: String::new(),
            description_source: DescriptionSource::None,
            sku: None,
            handle: None,
            vendor: None,
            product_type: None,
            tags: Vec::new(),
            raw_categories: Vec::new(),
            category: None,
            demographics: BTreeSet::new(),
            properties: None,
            style_code: None,
            embeddings: ProductEmbeddings::default(),
            images: Vec::new(),
            variants: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn has_description(&self) -> bool {
        !self.description.trim().is_empty()
    }

    /// Title and description joined the way classification and content embeddings consume them.
    pub fn content_text(&self) -> String {
        if self.has_description() {
            format!("{}\n\n{}", self.title.trim(), self.description.trim())
        } else {
            self.title.trim().to_string()
        }
    }

    pub fn min_price(&self) -> Option<f64> {
        self.variants
            .iter()
            .map(|v| v.price)
            .fold(None, |acc, p| Some(acc.map_or(p, |a: f64| a.min(p))))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variant {
    pub id: String,
    pub title: Option<String>,
    pub sku: Option<String>,
    pub price: f64,
    pub compare_at_price: Option<f64>,
    pub size: Option<String>,
    pub color: Option<String>,
    pub inventory_quantity: Option<i64>,
    pub available: bool,
    pub embeddings: VariantEmbeddings,
}

impl Variant {
    pub fn new(id: impl Into<String>, price: f64) -> Self {
        Self {
            id: id.into(),
            title: None,
            sku: None,
            price,
            compare_at_price: None,
            size: None,
            color: None,
            inventory_quantity: None,
            available: true,
            embeddings: VariantEmbeddings::default(),
        }
    }

    /// Sellable means in stock and carrying a positive price.
    pub fn is_purchasable(&self) -> bool {
        self.available && self.price > 0.0 && self.inventory_quantity.map_or(true, |q| q > 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductProperties {
    pub product_type: String,
    pub characteristics: Vec<String>,
    pub color: String,
    pub demographic: String,
    pub category: String,
    pub style: String,
}

impl Default for ProductProperties {
    fn default() -> Self {
        Self {
            product_type: DEFAULT_PROPERTY.to_string(),
            characteristics: Vec::new(),
            color: DEFAULT_PROPERTY.to_string(),
            demographic: DEFAULT_DEMOGRAPHIC.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            style: DEFAULT_PROPERTY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProductEmbeddings {
    pub title: Option<Vec<f32>>,
    pub content: Option<Vec<f32>>,
    pub product: Option<Vec<f32>>,
    pub characteristics: Option<Vec<f32>>,
    pub category: Option<Vec<f32>>,
    pub style: Option<Vec<f32>>,
}

impl ProductEmbeddings {
    pub fn count(&self) -> usize {
        [
            &self.title,
            &self.content,
            &self.product,
            &self.characteristics,
            &self.category,
            &self.style,
        ]
        .iter()
        .filter(|v| v.is_some())
        .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VariantEmbeddings {
    pub color: Option<Vec<f32>>,
    pub size: Option<Vec<f32>>,
}

/// Category label node. Identity is the lower-cased name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    pub parent: Option<String>,
    pub external_id: Option<String>,
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), parent: None, external_id: None }
    }

    pub fn key(&self) -> String {
        label_key(&self.name)
    }
}

/// Dedup key shared by Category and Demographic nodes.
pub fn label_key(name: &str) -> String {
    name.trim().to_lowercase()
}
