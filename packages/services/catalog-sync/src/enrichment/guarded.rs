use serde_json::Value;
use std::sync::Arc;

use crate::clients::{AiProvider, DescriptionStrategy};
use crate::models::*;
use crate::resilience::{with_retry, RetryPolicy, SlidingWindowLimiter};

/// AI provider behind the shared rate limiter and the retry helper.
/// Every attempt, retries included, takes a limiter slot.
#[derive(Clone)]
pub struct GuardedAi {
    provider: Arc<dyn AiProvider>,
    limiter: Arc<SlidingWindowLimiter>,
    policy: RetryPolicy,
}

impl GuardedAi {
    pub fn new(provider: Arc<dyn AiProvider>, limiter: Arc<SlidingWindowLimiter>, policy: RetryPolicy) -> Self {
        Self { provider, limiter, policy }
    }

    pub async fn classify_properties(&self, text: &str, categories: &[String]) -> Result<Value> {
        with_retry(&self.policy, "ai_classify_properties", || async {
            self.limiter.acquire().await;
            self.provider.classify_properties(text, categories).await
        })
        .await
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        with_retry(&self.policy, "ai_embed", || async {
            self.limiter.acquire().await;
            self.provider.embed(text).await
        })
        .await
    }

    pub async fn generate_description(&self, product: &Product, strategy: DescriptionStrategy) -> Result<Option<String>> {
        with_retry(&self.policy, "ai_generate_description", || async {
            self.limiter.acquire().await;
            self.provider.generate_description(product, strategy).await
        })
        .await
    }

    pub async fn classify_image(&self, image_url: &str, categories: &[String]) -> Result<Value> {
        with_retry(&self.policy, "ai_classify_image", || async {
            self.limiter.acquire().await;
            self.provider.classify_image(image_url, categories).await
        })
        .await
    }
}
