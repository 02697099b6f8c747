use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::models::*;
use crate::providers::PageCursor;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Durable resume point for one store. Times are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: u32,
    pub started_at: i64,
    pub saved_at: i64,
    #[serde(default)]
    pub count_processed: u64,
    #[serde(default)]
    pub total_products_seen: u64,
    #[serde(default)]
    pub count: u64,
    pub provider_state: PageCursor,
}

impl Checkpoint {
    pub fn new(started_at: i64, provider_state: PageCursor) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            started_at,
            saved_at: started_at,
            count_processed: 0,
            total_products_seen: 0,
            count: 0,
            provider_state,
        }
    }

    pub fn age(&self, now_ms: i64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.saved_at).max(0) as u64)
    }
}

/// Parses a stored record, migrating legacy (unversioned) records.
/// Returns `None` for records written by a newer version.
pub fn parse_checkpoint(raw: &str) -> Result<Option<Checkpoint>> {
    let mut value: Value = serde_json::from_str(raw)?;
    let Some(obj) = value.as_object_mut() else {
        return Err(CatalogError::Checkpoint("checkpoint is not a JSON object".to_string()));
    };

    match obj.get("version").and_then(Value::as_u64) {
        None => {
            let started_at = obj.get("startedAt").cloned().unwrap_or(Value::from(0));
            if !obj.contains_key("savedAt") {
                obj.insert("savedAt".to_string(), started_at);
            }
            if !obj.contains_key("providerState") {
                obj.insert("providerState".to_string(), Value::Object(Default::default()));
            }
            obj.insert("version".to_string(), Value::from(CHECKPOINT_VERSION));
        }
        Some(v) if v > CHECKPOINT_VERSION as u64 => {
            tracing::warn!(version = v, supported = CHECKPOINT_VERSION, "Checkpoint written by a newer version; ignoring it");
            return Ok(None);
        }
        Some(_) => {}
    }

    Ok(Some(serde_json::from_value(value)?))
}

/// Stores one JSON checkpoint per store under `dir`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_age: Duration,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self { dir: dir.into(), max_age }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, store_id: &str) -> PathBuf {
        let file: String = store_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }

    pub async fn save(&self, store_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(store_id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(checkpoint)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(
            store_id = %store_id,
            count_processed = checkpoint.count_processed,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Last saved checkpoint when it is present, readable and fresh.
    pub async fn load(&self, store_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(store_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint = match parse_checkpoint(&raw) {
            Ok(Some(cp)) => cp,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(store_id = %store_id, error = %e, "Unreadable checkpoint; starting fresh");
                return Ok(None);
            }
        };

        let age = checkpoint.age(Utc::now().timestamp_millis());
        if age > self.max_age {
            tracing::info!(store_id = %store_id, age_secs = age.as_secs(), "Discarding stale checkpoint");
            self.clear(store_id).await?;
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    pub async fn clear(&self, store_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(store_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(dir: &Path) -> CheckpointManager {
        CheckpointManager::new(dir, Duration::from_secs(24 * 3600))
    }

    #[test]
    fn legacy_record_is_migrated() {
        let raw = r#"{"startedAt": 1000, "countProcessed": 40, "totalProductsSeen": 45, "count": 42, "providerState": {"page": 3}}"#;
        let cp = parse_checkpoint(raw).unwrap().unwrap();
        assert_eq!(cp.version, CHECKPOINT_VERSION);
        assert_eq!(cp.saved_at, 1000);
        assert_eq!(cp.count_processed, 40);
        assert_eq!(cp.provider_state, PageCursor(json!({"page": 3})));
    }

    #[test]
    fn newer_version_is_skipped() {
        let raw = r#"{"version": 9, "startedAt": 1, "savedAt": 1, "providerState": {}}"#;
        assert!(parse_checkpoint(raw).unwrap().is_none());
    }

    #[test]
    fn writes_camel_case_fields() {
        let value = serde_json::to_value(Checkpoint::new(5, PageCursor(json!({"since_id": 0})))).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["savedAt"], 5);
        assert_eq!(value["providerState"]["since_id"], 0);
        assert!(value.get("countProcessed").is_some());
    }

    #[tokio::test]
    async fn save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let now = Utc::now().timestamp_millis();
        let mut cp = Checkpoint::new(now, PageCursor(json!({"page": 2})));
        cp.count_processed = 20;

        checkpoints.save("acme.myshopify.com", &cp).await.unwrap();
        assert!(checkpoints.path_for("acme.myshopify.com").exists());
        assert_eq!(checkpoints.load("acme.myshopify.com").await.unwrap(), Some(cp));

        checkpoints.clear("acme.myshopify.com").await.unwrap();
        assert!(checkpoints.load("acme.myshopify.com").await.unwrap().is_none());
        checkpoints.clear("acme.myshopify.com").await.unwrap();
    }

    #[tokio::test]
    async fn stale_checkpoint_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let old = Utc::now().timestamp_millis() - 25 * 3600 * 1000;
        checkpoints.save("s", &Checkpoint::new(old, PageCursor(json!({})))).await.unwrap();

        assert!(checkpoints.load("s").await.unwrap().is_none());
        assert!(!checkpoints.path_for("s").exists());
    }

    #[tokio::test]
    async fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        tokio::fs::write(checkpoints.path_for("s"), b"{not json").await.unwrap();
        assert!(checkpoints.load("s").await.unwrap().is_none());
    }
}
