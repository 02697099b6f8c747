use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::Config;
use crate::models::*;
use crate::providers::http::parse_retry_after;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionStrategy {
    /// Web-search grounded text generation from title, vendor and SKU.
    SearchGrounded,
    /// Vision model describing the first product image.
    FromImage,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn classify_properties(&self, text: &str, categories: &[String]) -> Result<Value>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn generate_description(&self, product: &Product, strategy: DescriptionStrategy) -> Result<Option<String>>;

    async fn classify_image(&self, image_url: &str, categories: &[String]) -> Result<Value>;
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Client for OpenAI-compatible chat completion and embedding endpoints.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    search_model: String,
    embedding_model: String,
}

impl OpenAiClient {
    pub fn new(
        api_key: &str,
        base_url: &str,
        chat_model: &str,
        search_model: &str,
        embedding_model: &str,
        timeout_ms: u64,
    ) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_model: chat_model.to_string(),
            search_model: search_model.to_string(),
            embedding_model: embedding_model.to_string(),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let api_key = cfg
            .openai_api_key
            .as_deref()
            .ok_or_else(|| CatalogError::Configuration("OPENAI_API_KEY is required".to_string()))?;
        Self::new(
            api_key,
            &cfg.openai_base_url,
            &cfg.ai_chat_model,
            &cfg.ai_search_model,
            &cfg.ai_embedding_model,
            cfg.http_timeout_ms,
        )
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self.client.post(&url).bearer_auth(&self.api_key).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);

            return Err(match status.as_u16() {
                429 => CatalogError::RateLimited { retry_after, message },
                401 | 403 => CatalogError::AuthRejected(format!("AI provider: {}", message)),
                code => CatalogError::HttpStatus { status: code, url, body: message },
            });
        }

        Ok(response.json().await?)
    }

    async fn chat(&self, model: &str, messages: Value, json_mode: bool, web_search: bool) -> Result<String> {
        let mut body = json!({ "model": model, "messages": messages });
        if json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        if web_search {
            body["web_search_options"] = json!({});
        }
        let response = self.post("chat/completions", &body).await?;
        response
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| CatalogError::Ai("completion carried no message content".to_string()))
    }
}

/// Parses a model reply that should be a JSON object, tolerating markdown fences.
pub fn parse_json_object(content: &str) -> Result<Value> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end().trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    let value: Value = serde_json::from_str(unfenced)
        .map_err(|e| CatalogError::Ai(format!("model reply is not valid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(CatalogError::Ai("model reply is not a JSON object".to_string()));
    }
    Ok(value)
}

fn description_or_none(text: String) -> Option<String> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(text.to_string())
    }
}

#[async_trait]
impl AiProvider for OpenAiClient {
    async fn classify_properties(&self, text: &str, categories: &[String]) -> Result<Value> {
        let messages = json!([
            {
                "role": "system",
                "content": "Classify the product. Reply with a JSON object with keys product_type, characteristics (array of short strings), color, demographic (woman, man, unisex or kid), category (prefer one of the candidate categories) and style."
            },
            {
                "role": "user",
                "content": format!("Candidate categories: {}\n\nProduct:\n{}", categories.join(", "), text)
            }
        ]);
        let content = self.chat(&self.chat_model, messages, true, false).await?;
        parse_json_object(&content)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({ "model": self.embedding_model, "input": text.replace('\n', " ") });
        let response = self.post("embeddings", &body).await?;
        let parsed: EmbeddingResponse = serde_json::from_value(response)?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CatalogError::Ai("embedding response carried no vector".to_string()))
    }

    async fn generate_description(&self, product: &Product, strategy: DescriptionStrategy) -> Result<Option<String>> {
        match strategy {
            DescriptionStrategy::SearchGrounded => {
                let mut facts = vec![format!("Title: {}", product.title)];
                if let Some(vendor) = &product.vendor {
                    facts.push(format!("Brand: {}", vendor));
                }
                if let Some(sku) = &product.sku {
                    facts.push(format!("SKU: {}", sku));
                }
                let messages = json!([{
                    "role": "user",
                    "content": format!(
                        "Write a factual product description of two to four sentences using what the web says about this product. Reply with the description only, or NONE if nothing reliable is found.\n{}",
                        facts.join("\n")
                    )
                }]);
                let text = self.chat(&self.search_model, messages, false, true).await?;
                Ok(description_or_none(text))
            }
            DescriptionStrategy::FromImage => {
                let Some(image) = product.images.first() else {
                    return Ok(None);
                };
                let messages = json!([{
                    "role": "user",
                    "content": [
                        { "type": "text", "text": format!("Write a factual product description of two to four sentences for \"{}\" based on this image. Reply with the description only.", product.title) },
                        { "type": "image_url", "image_url": { "url": image } }
                    ]
                }]);
                let text = self.chat(&self.chat_model, messages, false, false).await?;
                Ok(description_or_none(text))
            }
        }
    }

    async fn classify_image(&self, image_url: &str, categories: &[String]) -> Result<Value> {
        let messages = json!([{
            "role": "user",
            "content": [
                {
                    "type": "text",
                    "text": format!("Identify the dominant color and the best matching category ({}) of the product in this image. Reply with a JSON object with keys color and category.", categories.join(", "))
                },
                { "type": "image_url", "image_url": { "url": image_url } }
            ]
        }]);
        let content = self.chat(&self.chat_model, messages, true, false).await?;
        parse_json_object(&content)
    }
}
