pub mod engine;
pub mod jobs;

pub use self::engine::{RunControl, SyncEngine, SyncOptions, SyncOutcome};
pub use self::jobs::{SyncJobs, FINISHED_JOBS_PER_STORE};
