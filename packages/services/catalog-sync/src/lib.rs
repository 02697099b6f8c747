pub mod checkpoint;
pub mod clients;
pub mod config;
pub mod enrichment;
pub mod models;
pub mod progress;
pub mod providers;
pub mod resilience;
pub mod schema;
pub mod storage;
pub mod sync;

// Convenient re-exports for tests and external callers
pub use config::Config;
pub use models::*;
pub use sync::{SyncEngine, SyncJobs, SyncOptions};
