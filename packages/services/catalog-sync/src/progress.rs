use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{JobStatus, PipelineState, Result};

/// Message pushed to the per-store progress channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Progress {
        processed: u64,
        total: u64,
    },
    Status {
        status: JobStatus,
        state: PipelineState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[async_trait]
pub trait ProgressBroadcaster: Send + Sync {
    async fn publish(&self, channel: &str, event: &ProgressEvent) -> Result<()>;
}

/// Used by the one-shot CLI when Redis is not reachable.
pub struct NoopBroadcaster;

#[async_trait]
impl ProgressBroadcaster for NoopBroadcaster {
    async fn publish(&self, channel: &str, event: &ProgressEvent) -> Result<()> {
        tracing::debug!(channel = channel, event = ?event, "Progress event (not broadcast)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_type_tag() {
        let progress = serde_json::to_value(ProgressEvent::Progress { processed: 20, total: 45 }).unwrap();
        assert_eq!(progress, json!({"type": "progress", "processed": 20, "total": 45}));

        let status = serde_json::to_value(ProgressEvent::Status {
            status: JobStatus::Running,
            state: PipelineState::Enriching,
            message: None,
        })
        .unwrap();
        assert_eq!(status, json!({"type": "status", "status": "running", "state": "enriching"}));
    }
}
