use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::models::*;
use crate::progress::{ProgressBroadcaster, ProgressEvent};

/// Publishes progress events as JSON over Redis pub/sub.
#[derive(Clone)]
pub struct RedisProgressBroadcaster {
    conn: ConnectionManager,
}

impl RedisProgressBroadcaster {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CatalogError::Configuration(format!("Invalid Redis URL: {}", e)))?;

        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ProgressBroadcaster for RedisProgressBroadcaster {
    async fn publish(&self, channel: &str, event: &ProgressEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        tracing::debug!(channel = channel, receivers = receivers, "Published progress event");
        Ok(())
    }
}
