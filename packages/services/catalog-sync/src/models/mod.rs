pub mod product;
pub mod store;
pub mod job;

pub use product::*;
pub use store::*;
pub use job::*;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("BSON serialization error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },

    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Authentication rejected by {0}")]
    AuthRejected(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("AI provider error: {0}")]
    Ai(String),

    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Sync cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, CatalogError>;
