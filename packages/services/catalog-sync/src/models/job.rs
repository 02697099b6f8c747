use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator position within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Fetching,
    Diffing,
    Enriching,
    Persisting,
    Checkpointing,
    Finalizing,
    Done,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Fetching => "fetching",
            PipelineState::Diffing => "diffing",
            PipelineState::Enriching => "enriching",
            PipelineState::Persisting => "persisting",
            PipelineState::Checkpointing => "checkpointing",
            PipelineState::Finalizing => "finalizing",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
            PipelineState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub store_id: String,
    pub status: JobStatus,
    pub state: PipelineState,
    pub force: bool,
    pub progress: u64,
    pub total: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn new(store_id: impl Into<String>, force: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            store_id: store_id.into(),
            status: JobStatus::Queued,
            state: PipelineState::Idle,
            force,
            progress: 0,
            total: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete_successfully(&mut self) {
        self.status = JobStatus::Completed;
        self.state = PipelineState::Done;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail_with_error(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.state = PipelineState::Failed;
        self.error = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.state = PipelineState::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => Some((c - s).num_milliseconds()),
            _ => None,
        }
    }
}

/// Read-only view returned by job control.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub store_id: String,
    pub status: JobStatus,
    pub state: PipelineState,
    pub progress: u64,
    pub total: u64,
    pub error: Option<String>,
}

impl From<&SyncJob> for JobStatusView {
    fn from(job: &SyncJob) -> Self {
        Self {
            job_id: job.id,
            store_id: job.store_id.clone(),
            status: job.status,
            state: job.state,
            progress: job.progress,
            total: job.total,
            error: job.error.clone(),
        }
    }
}
