use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Run-scoped embedding cache keyed by the digest of the normalized input text.
#[derive(Default)]
pub struct EmbeddingCache {
    entries: Mutex<HashMap<String, Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Trimmed, lower-cased, whitespace-collapsed text hashed with SHA-256.
pub fn cache_key(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<f32>> {
        let found = self.entries.lock().await.get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub async fn insert(&self, key: String, vector: Vec<f32>) {
        self.entries.lock().await.insert(key, vector);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_case_and_whitespace() {
        assert_eq!(cache_key("  Red   Linen\nShirt "), cache_key("red linen shirt"));
        assert_ne!(cache_key("red linen shirt"), cache_key("blue linen shirt"));
        assert_eq!(cache_key("x").len(), 64);
    }

    #[tokio::test]
    async fn counts_hits_and_misses() {
        let cache = EmbeddingCache::new();
        let key = cache_key("Dress");
        assert!(cache.get(&key).await.is_none());
        cache.insert(key.clone(), vec![0.1, 0.2]).await;
        assert_eq!(cache.get(&key).await, Some(vec![0.1, 0.2]));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }
}
