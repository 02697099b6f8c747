use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::models::CatalogError;

// MongoDB server codes for WriteConflict and DuplicateKey
const WRITE_CONFLICT_CODE: i32 = 112;
// Two concurrent upserts of the same natural key race on the unique index
const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryClass {
    Fatal,
    Transient,
    RateLimited(Option<Duration>),
    LockConflict,
}

impl RetryClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RetryClass::Fatal)
    }
}

pub trait Retryable {
    fn retry_class(&self) -> RetryClass;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Exponential delay for the given zero-based failed attempt, plus jitter in `[0, base)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let jitter_ms = if base_ms > 0 { rand::thread_rng().gen_range(0..base_ms) } else { 0 };
        Duration::from_millis(exp_ms.saturating_add(jitter_ms)).min(self.max_delay)
    }

    fn delay_for(&self, class: &RetryClass, attempt: u32) -> Duration {
        match class {
            RetryClass::RateLimited(Some(hint)) => (*hint).min(self.max_delay),
            _ => self.backoff(attempt),
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or runs out of attempts.
/// The last error is returned as-is.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                let class = err.retry_class();
                if !class.is_retryable() {
                    return Err(err);
                }
                if attempt >= max_attempts {
                    tracing::warn!(op = op_name, attempts = attempt, error = %err, "Retries exhausted");
                    return Err(err);
                }
                let delay = policy.delay_for(&class, attempt - 1);
                tracing::warn!(
                    op = op_name,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    class = ?class,
                    error = %err,
                    "Retryable failure; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub fn classify_status(status: u16) -> RetryClass {
    match status {
        429 => RetryClass::RateLimited(None),
        408 | 500..=599 => RetryClass::Transient,
        _ => RetryClass::Fatal,
    }
}

fn classify_mongo(err: &mongodb::error::Error) -> RetryClass {
    use mongodb::error::{ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};

    if err.contains_label(TRANSIENT_TRANSACTION_ERROR) || err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) {
        return RetryClass::LockConflict;
    }
    match err.kind.as_ref() {
        ErrorKind::Command(c) if c.code == WRITE_CONFLICT_CODE || c.code == DUPLICATE_KEY_CODE => {
            RetryClass::LockConflict
        }
        ErrorKind::Write(WriteFailure::WriteError(w)) if w.code == WRITE_CONFLICT_CODE || w.code == DUPLICATE_KEY_CODE => {
            RetryClass::LockConflict
        }
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => {
            RetryClass::Transient
        }
        _ => RetryClass::Fatal,
    }
}

impl Retryable for CatalogError {
    fn retry_class(&self) -> RetryClass {
        match self {
            CatalogError::RateLimited { retry_after, .. } => RetryClass::RateLimited(*retry_after),
            CatalogError::LockConflict(_) => RetryClass::LockConflict,
            CatalogError::HttpStatus { status, .. } => classify_status(*status),
            CatalogError::Http(e) => {
                if let Some(status) = e.status() {
                    return classify_status(status.as_u16());
                }
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    RetryClass::Transient
                } else {
                    RetryClass::Fatal
                }
            }
            CatalogError::Database(e) => classify_mongo(e),
            CatalogError::Redis(e) => {
                if e.is_timeout() || e.is_connection_dropped() || e.is_io_error() {
                    RetryClass::Transient
                } else {
                    RetryClass::Fatal
                }
            }
            CatalogError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted => RetryClass::Transient,
                _ => RetryClass::Fatal,
            },
            _ => RetryClass::Fatal,
        }
    }
}
