use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{CatalogError, Result};
use crate::resilience::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub mongodb_uri: String,
    pub database_name: String,
    // Standalone dev servers have no replica set and reject transactions
    pub mongodb_use_transactions: bool,
    pub redis_url: String,
    pub progress_channel_prefix: String,
    pub http_timeout_ms: u64,
    pub http_user_agent: String,
    pub http_max_attempts: u32,
    pub http_retry_backoff_ms: u64,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub ai_chat_model: String,
    pub ai_search_model: String,
    pub ai_embedding_model: String,
    pub ai_max_requests_per_minute: usize,
    pub ai_max_attempts: u32,
    pub ai_retry_backoff_ms: u64,
    pub enrichment_workers: usize,
    pub generate_descriptions: bool,
    // Categories whose products also get image-based classification
    pub visual_trigger_categories: Vec<String>,
    pub persist_batch_size: usize,
    pub persist_fan_out: usize,
    pub tx_max_attempts: u32,
    pub tx_retry_backoff_ms: u64,
    pub checkpoint_dir: String,
    pub checkpoint_max_age_hours: u64,
    pub enable_scheduler: bool,
    pub sync_cron: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let port: u16 = get("PORT").and_then(|s| s.parse().ok()).unwrap_or(8091);
        let mongodb_uri = get("MONGODB_URI").unwrap_or_else(|| "mongodb://localhost:27017".to_string());
        let database_name = get("DATABASE_NAME").unwrap_or_else(|| "catalog".to_string());
        let mongodb_use_transactions: bool = get("MONGODB_USE_TRANSACTIONS").and_then(|s| s.parse().ok()).unwrap_or(true);
        let redis_url = get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string());
        let progress_channel_prefix = get("PROGRESS_CHANNEL_PREFIX").unwrap_or_else(|| "catalog-sync".to_string());
        let http_timeout_ms: u64 = get("HTTP_TIMEOUT_MS").and_then(|s| s.parse().ok()).unwrap_or(30000);
        let http_user_agent = get("HTTP_USER_AGENT").unwrap_or_else(|| "catalog-sync/1.0".to_string());
        let http_max_attempts: u32 = get("HTTP_MAX_ATTEMPTS").and_then(|s| s.parse().ok()).unwrap_or(5);
        let http_retry_backoff_ms: u64 = get("HTTP_RETRY_BACKOFF_MS").and_then(|s| s.parse().ok()).unwrap_or(500);
        let openai_api_key = get("OPENAI_API_KEY").filter(|s| !s.trim().is_empty());
        let openai_base_url = get("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let ai_chat_model = get("AI_CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        let ai_search_model = get("AI_SEARCH_MODEL").unwrap_or_else(|| "gpt-4o-mini-search-preview".to_string());
        let ai_embedding_model = get("AI_EMBEDDING_MODEL").unwrap_or_else(|| "text-embedding-3-small".to_string());
        let ai_max_requests_per_minute: usize = get("AI_MAX_REQUESTS_PER_MINUTE").and_then(|s| s.parse().ok()).unwrap_or(500);
        let ai_max_attempts: u32 = get("AI_MAX_ATTEMPTS").and_then(|s| s.parse().ok()).unwrap_or(6);
        let ai_retry_backoff_ms: u64 = get("AI_RETRY_BACKOFF_MS").and_then(|s| s.parse().ok()).unwrap_or(1000);
        let enrichment_workers: usize = get("ENRICHMENT_WORKERS").and_then(|s| s.parse().ok()).unwrap_or(5);
        let generate_descriptions: bool = get("GENERATE_DESCRIPTIONS").and_then(|s| s.parse().ok()).unwrap_or(true);
        let visual_trigger_categories = get("VISUAL_TRIGGER_CATEGORIES")
            .map(|s| {
                s.split(',')
                    .map(|c| c.trim().to_lowercase())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let persist_batch_size: usize = get("PERSIST_BATCH_SIZE").and_then(|s| s.parse().ok()).unwrap_or(25);
        let persist_fan_out: usize = get("PERSIST_FAN_OUT").and_then(|s| s.parse().ok()).unwrap_or(2);
        let tx_max_attempts: u32 = get("TX_MAX_ATTEMPTS").and_then(|s| s.parse().ok()).unwrap_or(5);
        let tx_retry_backoff_ms: u64 = get("TX_RETRY_BACKOFF_MS").and_then(|s| s.parse().ok()).unwrap_or(500);
        let checkpoint_dir = get("CHECKPOINT_DIR").unwrap_or_else(|| "./.sync-checkpoints".to_string());
        let checkpoint_max_age_hours: u64 = get("CHECKPOINT_MAX_AGE_HOURS").and_then(|s| s.parse().ok()).unwrap_or(24);
        let enable_scheduler: bool = get("ENABLE_SCHEDULER").and_then(|s| s.parse().ok()).unwrap_or(false);
        let sync_cron = get("SYNC_CRON").unwrap_or_else(|| "0 0 3 * * *".to_string());

        Self {
            port,
            mongodb_uri,
            database_name,
            mongodb_use_transactions,
            redis_url,
            progress_channel_prefix,
            http_timeout_ms,
            http_user_agent,
            http_max_attempts,
            http_retry_backoff_ms,
            openai_api_key,
            openai_base_url,
            ai_chat_model,
            ai_search_model,
            ai_embedding_model,
            ai_max_requests_per_minute,
            ai_max_attempts,
            ai_retry_backoff_ms,
            enrichment_workers,
            generate_descriptions,
            visual_trigger_categories,
            persist_batch_size,
            persist_fan_out,
            tx_max_attempts,
            tx_retry_backoff_ms,
            checkpoint_dir,
            checkpoint_max_age_hours,
            enable_scheduler,
            sync_cron,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let zero_checks = [
            ("ENRICHMENT_WORKERS", self.enrichment_workers),
            ("PERSIST_BATCH_SIZE", self.persist_batch_size),
            ("PERSIST_FAN_OUT", self.persist_fan_out),
            ("AI_MAX_REQUESTS_PER_MINUTE", self.ai_max_requests_per_minute),
        ];
        for (key, value) in zero_checks {
            if value == 0 {
                return Err(CatalogError::Configuration(format!("{} must be greater than zero", key)));
            }
        }
        if self.openai_api_key.is_none() {
            return Err(CatalogError::Configuration("OPENAI_API_KEY is required".to_string()));
        }
        Ok(())
    }

    pub fn http_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.http_max_attempts, Duration::from_millis(self.http_retry_backoff_ms))
    }

    pub fn ai_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.ai_max_attempts, Duration::from_millis(self.ai_retry_backoff_ms))
    }

    pub fn tx_retry_policy(&self) -> RetryPolicy {
        // Transaction backoff never drops below 500ms
        RetryPolicy::new(self.tx_max_attempts, Duration::from_millis(self.tx_retry_backoff_ms.max(500)))
    }

    pub fn checkpoint_max_age(&self) -> Duration {
        Duration::from_secs(self.checkpoint_max_age_hours * 3600)
    }

    pub fn progress_channel(&self, store_id: &str) -> String {
        format!("{}:{}", self.progress_channel_prefix, store_id)
    }
}
