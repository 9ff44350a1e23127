use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crate::error::{ProcessingError, Result};
use crate::types::ImageJob;

/// Cooperative cancellation shared between a batch and whoever may stop it.
///
/// Cloning shares the flag. Each orchestrator owns its own token, so two
/// independent batches never see each other's cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }
        Ok(())
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Trip the flag now and clear it after `delay` so new batches can start.
    ///
    /// Must be called from within a tokio runtime.
    pub fn cancel_then_reset(&self, delay: Duration) -> tokio::task::JoinHandle<()> {
        self.cancel();
        let flag = Arc::clone(&self.flag);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            flag.store(false, Ordering::SeqCst);
            tracing::debug!("Cancellation flag cleared after {:?}", delay);
        })
    }
}

/// Release the handles of removed jobs on a deferred task.
///
/// The caller's clearing path returns immediately; the bytes are dropped after
/// the runtime has had a chance to run other work.
pub fn release_deferred(jobs: Vec<ImageJob>) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        let mut released = 0;
        for mut job in jobs {
            if job.release_handles() {
                released += 1;
            }
        }
        tracing::debug!(released, "Released transient image handles");
        released
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceImage;

    #[test]
    fn test_check_and_reset() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());

        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(ProcessingError::Cancelled)));

        token.reset();
        assert!(!shared.is_cancelled());
    }

    #[test]
    fn test_independent_tokens() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        a.cancel();
        assert!(!b.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_reset_clears_after_delay() {
        let token = CancellationToken::new();
        let handle = token.cancel_then_reset(Duration::from_millis(1000));
        assert!(token.is_cancelled());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(token.is_cancelled());

        handle.await.unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_release_deferred_counts_once() {
        let source = SourceImage::from_bytes("a.png", vec![0u8; 16], None);
        let mut already = ImageJob::new(source.clone(), "bria", None);
        already.release_handles();
        let fresh = ImageJob::new(source, "bria", None);

        let released = release_deferred(vec![already, fresh]).await.unwrap();
        assert_eq!(released, 1);
    }
}
