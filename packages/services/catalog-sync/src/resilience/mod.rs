pub mod pool;
pub mod rate_limiter;
pub mod retry;

pub use pool::map_concurrent;
pub use rate_limiter::SlidingWindowLimiter;
pub use retry::{classify_status, with_retry, RetryClass, RetryPolicy, Retryable};
