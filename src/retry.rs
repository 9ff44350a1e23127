use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Bounded retry with a linearly growing delay: `base_delay * attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "Transient failure: {}. Retrying in {:?} ({}/{})",
                        e,
                        delay,
                        attempt,
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessingError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn transient(message: &str) -> ProcessingError {
        ProcessingError::Timeout(message.to_string())
    }

    #[test]
    fn test_delays_strictly_increase() {
        let policy = RetryPolicy::new(5, Duration::from_millis(250));
        let delays: Vec<Duration> = (1..5).map(|a| policy.delay_for(a)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert_eq!(delays[0], Duration::from_millis(250));
        assert_eq!(delays[3], Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_exhausts_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let result: Result<()> = policy
            .run(|_| {
                let calls = Arc::clone(&calls);
                let stamps = Arc::clone(&stamps);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    stamps.lock().unwrap().push(Instant::now());
                    Err(transient("upstream"))
                }
            })
            .await;

        assert!(matches!(result, Err(ProcessingError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stamps = stamps.lock().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 2);
        assert!(gaps[1] > gaps[0]);
        assert!(gaps[0] >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_returns_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_secs(10));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<()> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProcessingError::Auth {
                        status: 401,
                        message: "Invalid signature".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(ProcessingError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient() {
        let policy = RetryPolicy::default();
        let value = policy
            .run(|attempt| async move {
                if attempt < 2 {
                    Err(transient("flaky"))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }
}
