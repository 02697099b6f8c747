use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const SAFETY_MARGIN: Duration = Duration::from_millis(50);

/// Sliding-window admission control. At most `max_per_window` acquisitions are
/// admitted in any trailing `window`.
pub struct SlidingWindowLimiter {
    max_per_window: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_per_window: usize) -> Self {
        Self::with_window(max_per_window, Duration::from_secs(60))
    }

    pub fn with_window(max_per_window: usize, window: Duration) -> Self {
        let max_per_window = max_per_window.max(1);
        Self {
            max_per_window,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(max_per_window)),
        }
    }

    pub fn max_per_window(&self) -> usize {
        self.max_per_window
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut admitted = self.admitted.lock().await;
                let now = Instant::now();
                while let Some(oldest) = admitted.front() {
                    if now.duration_since(*oldest) >= self.window {
                        admitted.pop_front();
                    } else {
                        break;
                    }
                }
                if admitted.len() < self.max_per_window {
                    admitted.push_back(now);
                    return;
                }
                match admitted.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now) + SAFETY_MARGIN,
                    None => SAFETY_MARGIN,
                }
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limit window full; waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Acquisitions still inside the trailing window.
    pub async fn in_window(&self) -> usize {
        let admitted = self.admitted.lock().await;
        let now = Instant::now();
        admitted.iter().filter(|t| now.duration_since(**t) < self.window).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn eleventh_call_waits_for_oldest_to_expire() {
        let limiter = SlidingWindowLimiter::new(10);
        let first = Instant::now();
        let mut admitted_at = Vec::new();
        for _ in 0..15 {
            limiter.acquire().await;
            admitted_at.push(first.elapsed());
        }
        assert!(admitted_at[9] < Duration::from_secs(1));
        assert!(admitted_at[10] >= Duration::from_secs(60));
        assert!(admitted_at[14] >= Duration::from_secs(60));
        assert_eq!(limiter.in_window().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_window() {
        let limiter = Arc::new(SlidingWindowLimiter::with_window(3, Duration::from_secs(10)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..7 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move {
                l.acquire().await;
                start.elapsed()
            }));
        }
        let mut times = Vec::new();
        for h in handles {
            times.push(h.await.unwrap());
        }
        times.sort();
        assert!(times[2] < Duration::from_secs(1));
        assert!(times[3] >= Duration::from_secs(10));
        assert!(times[6] >= Duration::from_secs(20));
    }
}
