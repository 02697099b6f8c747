use async_graphql::{Context, EmptySubscription, Object, Result as GraphQLResult, Schema, SimpleObject, ID};
use uuid::Uuid;

use crate::models::*;
use crate::sync::SyncJobs;

pub type CatalogSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

pub fn build_schema(jobs: SyncJobs) -> CatalogSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription).data(jobs).finish()
}

#[derive(SimpleObject, Debug, Clone)]
pub struct SyncJobStatus {
    pub job_id: ID,
    pub store_id: String,
    pub status: String,
    pub state: String,
    pub progress: u64,
    pub total: u64,
    pub error: Option<String>,
}

impl From<JobStatusView> for SyncJobStatus {
    fn from(view: JobStatusView) -> Self {
        Self {
            job_id: ID(view.job_id.to_string()),
            store_id: view.store_id,
            status: view.status.as_str().to_string(),
            state: view.state.as_str().to_string(),
            progress: view.progress,
            total: view.total,
            error: view.error,
        }
    }
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Running or most recent sync job for a store
    async fn sync_status(&self, ctx: &Context<'_>, store_id: String) -> GraphQLResult<Option<SyncJobStatus>> {
        let jobs = ctx.data::<SyncJobs>()?;
        Ok(jobs.get_status(&store_id).await.map(SyncJobStatus::from))
    }

    async fn sync_job(&self, ctx: &Context<'_>, job_id: ID) -> GraphQLResult<Option<SyncJobStatus>> {
        let jobs = ctx.data::<SyncJobs>()?;
        let job_id = Uuid::parse_str(&job_id)?;
        Ok(jobs.job_status(job_id).await.map(SyncJobStatus::from))
    }

    /// Health check
    async fn health(&self) -> GraphQLResult<String> {
        Ok("OK".to_string())
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Start a sync; `force` re-enriches products that already exist
    async fn start_sync(&self, ctx: &Context<'_>, store_id: String, force: Option<bool>) -> GraphQLResult<ID> {
        let jobs = ctx.data::<SyncJobs>()?;
        let job_id = jobs.start_sync(&store_id, force.unwrap_or(false)).await?;
        Ok(ID(job_id.to_string()))
    }

    async fn cancel_sync(&self, ctx: &Context<'_>, store_id: String) -> GraphQLResult<bool> {
        let jobs = ctx.data::<SyncJobs>()?;
        Ok(jobs.cancel(&store_id).await)
    }
}
