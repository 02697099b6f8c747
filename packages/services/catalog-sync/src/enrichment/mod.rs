pub mod cache;
pub mod guarded;

pub use self::cache::{cache_key, EmbeddingCache};
pub use self::guarded::GuardedAi;

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::clients::DescriptionStrategy;
use crate::models::*;

#[derive(Debug, Clone, Default)]
pub struct EnrichmentOptions {
    pub generate_descriptions: bool,
    /// Lower-cased category labels that trigger image classification.
    pub visual_trigger_categories: Vec<String>,
}

#[derive(Default)]
struct EnrichmentCounters {
    products: AtomicU64,
    descriptions_generated: AtomicU64,
    description_failures: AtomicU64,
    property_fallbacks: AtomicU64,
    embedding_failures: AtomicU64,
    visual_classified: AtomicU64,
    visual_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EnrichmentStats {
    pub products: u64,
    pub descriptions_generated: u64,
    pub description_failures: u64,
    pub property_fallbacks: u64,
    pub embedding_failures: u64,
    pub visual_classified: u64,
    pub visual_failures: u64,
    pub cache_hits: u64,
}

/// Per-run enrichment stage. Never fails: every sub-step degrades to a default and is counted.
pub struct Enricher {
    ai: GuardedAi,
    options: EnrichmentOptions,
    cache: EmbeddingCache,
    counters: EnrichmentCounters,
}

impl Enricher {
    pub fn new(ai: GuardedAi, options: EnrichmentOptions) -> Self {
        Self {
            ai,
            options,
            cache: EmbeddingCache::new(),
            counters: EnrichmentCounters::default(),
        }
    }

    pub async fn enrich(&self, mut product: Product, categories: &[String]) -> Product {
        self.counters.products.fetch_add(1, Ordering::Relaxed);

        self.ensure_description(&mut product).await;

        let mut properties = match self.ai.classify_properties(&product.content_text(), categories).await {
            Ok(value) => properties_from_json(&value, categories),
            Err(e) => {
                tracing::debug!(product_id = %product.id, error = %e, "Property classification failed; using defaults");
                self.counters.property_fallbacks.fetch_add(1, Ordering::Relaxed);
                ProductProperties::default()
            }
        };

        self.classify_visually(&product, &mut properties, categories).await;

        product.category = Some(properties.category.clone());
        product.demographics.insert(properties.demographic.clone());
        product.style_code = Some(properties.style.clone());
        if product.product_type.is_none() && properties.product_type != DEFAULT_PROPERTY {
            product.product_type = Some(properties.product_type.clone());
        }

        let characteristics = properties.characteristics.join(", ");
        product.embeddings = ProductEmbeddings {
            title: self.embedding(&product.title).await,
            content: self.embedding(&product.content_text()).await,
            product: self.embedding(&properties.product_type).await,
            characteristics: if characteristics.is_empty() { None } else { self.embedding(&characteristics).await },
            category: self.embedding(&properties.category).await,
            style: self.embedding(&properties.style).await,
        };
        for variant in &mut product.variants {
            if let Some(color) = variant.color.clone() {
                variant.embeddings.color = self.embedding(&color).await;
            }
            if let Some(size) = variant.size.clone() {
                variant.embeddings.size = self.embedding(&size).await;
            }
        }

        product.properties = Some(properties);
        product
    }

    async fn ensure_description(&self, product: &mut Product) {
        if product.has_description() {
            if product.description_source == DescriptionSource::None {
                product.description_source = DescriptionSource::Original;
            }
            return;
        }
        product.description.clear();
        product.description_source = DescriptionSource::None;
        if !self.options.generate_descriptions {
            return;
        }

        let attempts = [
            (DescriptionStrategy::SearchGrounded, DescriptionSource::GoogleSearch),
            (DescriptionStrategy::FromImage, DescriptionSource::AiImage),
        ];
        for (strategy, source) in attempts {
            match self.ai.generate_description(product, strategy).await {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    product.description = text;
                    product.description_source = source;
                    self.counters.descriptions_generated.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(product_id = %product.id, strategy = ?strategy, error = %e, "Description generation failed");
                }
            }
        }
        self.counters.description_failures.fetch_add(1, Ordering::Relaxed);
    }

    async fn classify_visually(&self, product: &Product, properties: &mut ProductProperties, categories: &[String]) {
        let triggered = self
            .options
            .visual_trigger_categories
            .iter()
            .any(|t| *t == label_key(&properties.category));
        let Some(image) = product.images.first() else {
            return;
        };
        if !triggered {
            return;
        }

        match self.ai.classify_image(image, categories).await {
            Ok(value) => {
                if let Some(color) = text_field(&value, "color").filter(|c| c != DEFAULT_PROPERTY) {
                    properties.color = color;
                }
                if let Some(category) = text_field(&value, "category").and_then(|c| match_category(&c, categories)) {
                    properties.category = category;
                }
                self.counters.visual_classified.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!(product_id = %product.id, error = %e, "Visual classification failed");
                self.counters.visual_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn embedding(&self, text: &str) -> Option<Vec<f32>> {
        if text.trim().is_empty() {
            return None;
        }
        let key = cache_key(text);
        if let Some(hit) = self.cache.get(&key).await {
            return Some(hit);
        }
        match self.ai.embed(text).await {
            Ok(vector) => {
                self.cache.insert(key, vector.clone()).await;
                Some(vector)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Embedding failed");
                self.counters.embedding_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn stats(&self) -> EnrichmentStats {
        let c = &self.counters;
        EnrichmentStats {
            products: c.products.load(Ordering::Relaxed),
            descriptions_generated: c.descriptions_generated.load(Ordering::Relaxed),
            description_failures: c.description_failures.load(Ordering::Relaxed),
            property_fallbacks: c.property_fallbacks.load(Ordering::Relaxed),
            embedding_failures: c.embedding_failures.load(Ordering::Relaxed),
            visual_classified: c.visual_classified.load(Ordering::Relaxed),
            visual_failures: c.visual_failures.load(Ordering::Relaxed),
            cache_hits: self.cache.hits(),
        }
    }
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

/// Candidate category whose label matches `raw`, keeping the candidate's spelling.
pub fn match_category(raw: &str, candidates: &[String]) -> Option<String> {
    let key = label_key(raw);
    candidates.iter().find(|c| label_key(c) == key).cloned()
}

/// Reads a classification reply into properties, falling back to defaults field by field.
pub fn properties_from_json(value: &Value, categories: &[String]) -> ProductProperties {
    let mut props = ProductProperties::default();
    if let Some(v) = text_field(value, "product_type") {
        props.product_type = v;
    }
    if let Some(v) = text_field(value, "color") {
        props.color = v;
    }
    if let Some(v) = text_field(value, "style") {
        props.style = v;
    }
    if let Some(v) = text_field(value, "demographic") {
        props.demographic = v;
    }
    if let Some(raw) = value.get("category").and_then(|v| v.as_str()).map(str::trim).filter(|s| !s.is_empty()) {
        props.category = match_category(raw, categories).unwrap_or_else(|| raw.to_string());
    }
    props.characteristics = match value.get("characteristics") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(joined)) => joined
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    };
    props
}
