//! Remote quota checks for authenticated identities and the per-batch admin
//! exemption cache.

use std::sync::Mutex;

use crate::ledger::{Identity, RemoteQuota};

/// Remote source of truth for authenticated quotas.
///
/// Returns the identity's limit and current usage. A limit at or above
/// [`UNLIMITED_THRESHOLD`](crate::ledger::UNLIMITED_THRESHOLD) marks an admin.
pub trait QuotaAuthority: Send + Sync + 'static {
    fn check_quota(
        &self,
        user_id: &str,
        requested_ops: u32,
    ) -> impl std::future::Future<Output = anyhow::Result<RemoteQuota>> + Send;
}

/// Authority for deployments without a backend; every check fails.
///
/// Anonymous sessions never reach the authority, so this is enough for them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQuotaAuthority;

impl QuotaAuthority for NoQuotaAuthority {
    async fn check_quota(&self, user_id: &str, _requested_ops: u32) -> anyhow::Result<RemoteQuota> {
        anyhow::bail!("no quota authority configured for user {}", user_id)
    }
}

/// Result of the pre-reservation check for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exemption {
    /// Anonymous session: the local ledger decides.
    Local,
    /// Admin: no quota applies for the rest of the batch.
    Exempt,
    /// Authenticated with a finite remote quota.
    Limited(RemoteQuota),
}

impl Exemption {
    pub fn is_exempt(&self) -> bool {
        matches!(self, Exemption::Exempt)
    }
}

/// Remembers an admin verdict for the duration of one batch.
///
/// Only the exempt verdict is cached: a limited user's remaining quota moves
/// as jobs complete, so it is re-read for every job.
#[derive(Debug, Default)]
pub struct ExemptionCache {
    exempt_user: Mutex<Option<String>>,
}

impl ExemptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the cached verdict. Called at batch start.
    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.exempt_user.lock() {
            *cached = None;
        }
    }

    fn is_cached_exempt(&self, user_id: &str) -> bool {
        self.exempt_user
            .lock()
            .map(|cached| cached.as_deref() == Some(user_id))
            .unwrap_or(false)
    }

    /// Resolve the exemption for `identity`, consulting `authority` only when
    /// the answer is not already known for this batch.
    pub async fn resolve<A: QuotaAuthority>(
        &self,
        authority: &A,
        identity: &Identity,
        requested_ops: u32,
    ) -> anyhow::Result<Exemption> {
        let Some(user_id) = identity.user_id() else {
            return Ok(Exemption::Local);
        };
        if self.is_cached_exempt(user_id) {
            return Ok(Exemption::Exempt);
        }

        let quota = authority.check_quota(user_id, requested_ops).await?;
        if quota.is_unlimited() {
            tracing::debug!(user = user_id, "Identity is quota-exempt for this batch");
            if let Ok(mut cached) = self.exempt_user.lock() {
                *cached = Some(user_id.to_string());
            }
            return Ok(Exemption::Exempt);
        }
        Ok(Exemption::Limited(quota))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::UNLIMITED_THRESHOLD;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingAuthority {
        calls: AtomicU32,
        limit: u64,
    }

    impl QuotaAuthority for CountingAuthority {
        async fn check_quota(&self, _user_id: &str, _requested: u32) -> anyhow::Result<RemoteQuota> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteQuota {
                limit: self.limit,
                used: 10,
            })
        }
    }

    #[tokio::test]
    async fn test_anonymous_never_calls_authority() {
        let cache = ExemptionCache::new();
        let verdict = cache
            .resolve(&NoQuotaAuthority, &Identity::Anonymous, 1)
            .await
            .unwrap();
        assert_eq!(verdict, Exemption::Local);
    }

    #[tokio::test]
    async fn test_admin_cached_until_invalidated() {
        let authority = CountingAuthority {
            calls: AtomicU32::new(0),
            limit: UNLIMITED_THRESHOLD,
        };
        let cache = ExemptionCache::new();
        let admin = Identity::Authenticated("admin".into());

        for _ in 0..3 {
            assert!(cache.resolve(&authority, &admin, 1).await.unwrap().is_exempt());
        }
        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        assert!(cache.resolve(&authority, &admin, 1).await.unwrap().is_exempt());
        assert_eq!(authority.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_limited_user_checked_every_time() {
        let authority = CountingAuthority {
            calls: AtomicU32::new(0),
            limit: 50,
        };
        let cache = ExemptionCache::new();
        let user = Identity::Authenticated("u".into());

        let verdict = cache.resolve(&authority, &user, 2).await.unwrap();
        assert_eq!(verdict, Exemption::Limited(RemoteQuota { limit: 50, used: 10 }));
        cache.resolve(&authority, &user, 2).await.unwrap();
        assert_eq!(authority.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_authority_fails() {
        let cache = ExemptionCache::new();
        let user = Identity::Authenticated("u".into());
        assert!(cache.resolve(&NoQuotaAuthority, &user, 1).await.is_err());
    }
}
