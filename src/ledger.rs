use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessingError, Result};

/// Remote limits at or above this value mean "unlimited" (admin accounts).
pub const UNLIMITED_THRESHOLD: u64 = 999_999;

/// Who is spending quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "userId")]
pub enum Identity {
    Anonymous,
    Authenticated(String),
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::Authenticated(_))
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::Authenticated(id) => Some(id),
            Identity::Anonymous => None,
        }
    }
}

/// Remaining processing capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capacity {
    Unlimited,
    Limited(u32),
}

impl Capacity {
    /// `-1` for unlimited, otherwise the remaining count.
    pub fn as_sentinel(&self) -> i64 {
        match self {
            Capacity::Unlimited => -1,
            Capacity::Limited(n) => *n as i64,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Capacity::Limited(0))
    }

    pub fn allows(&self, cost: u32) -> bool {
        match self {
            Capacity::Unlimited => true,
            Capacity::Limited(n) => cost <= *n,
        }
    }
}

/// Snapshot returned by the remote quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteQuota {
    pub limit: u64,
    pub used: u64,
}

impl RemoteQuota {
    /// Snapshot for an admin account.
    pub const fn unlimited() -> Self {
        Self {
            limit: UNLIMITED_THRESHOLD,
            used: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit >= UNLIMITED_THRESHOLD
    }

    pub fn capacity(&self) -> Capacity {
        if self.is_unlimited() {
            Capacity::Unlimited
        } else {
            let left = self.limit.saturating_sub(self.used);
            Capacity::Limited(left.min(u32::MAX as u64) as u32)
        }
    }
}

/// Units pre-charged for one job. Consumed by [`QuotaLedger::rollback`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation must be rolled back or kept"]
pub struct Reservation {
    units: u32,
    epoch: u64,
}

impl Reservation {
    pub fn units(&self) -> u32 {
        self.units
    }

    /// Keep the charged units for good. Returns how many were kept.
    pub fn commit(self) -> u32 {
        self.units
    }
}

#[derive(Debug)]
struct LedgerState {
    identity: Identity,
    process_count: u32,
    remote: Option<RemoteQuota>,
    epoch: u64,
}

/// Session-scoped usage counter.
///
/// Anonymous identities are limited to `max_free_images` operations. For
/// authenticated identities the quota lives remotely; the ledger only keeps the
/// last observed [`RemoteQuota`] and never changes it.
///
/// Every mutation goes through one mutex, so a reservation, a rollback and a
/// reset never interleave.
#[derive(Debug)]
pub struct QuotaLedger {
    max_free_images: u32,
    state: Mutex<LedgerState>,
}

impl QuotaLedger {
    pub fn new(max_free_images: u32) -> Self {
        Self {
            max_free_images,
            state: Mutex::new(LedgerState {
                identity: Identity::Anonymous,
                process_count: 0,
                remote: None,
                epoch: 0,
            }),
        }
    }

    /// Start from a persisted count (clamped to the allowance).
    pub fn with_count(self, count: u32) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.process_count = count.min(self.max_free_images);
        }
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|e| ProcessingError::Other(format!("Quota ledger poisoned: {}", e)))
    }

    pub fn max_free_images(&self) -> u32 {
        self.max_free_images
    }

    pub fn process_count(&self) -> u32 {
        self.state.lock().map(|s| s.process_count).unwrap_or(0)
    }

    pub fn identity(&self) -> Identity {
        self.state
            .lock()
            .map(|s| s.identity.clone())
            .unwrap_or(Identity::Anonymous)
    }

    /// Switch identity (login / logout). Logging in clears the anonymous count.
    pub fn set_identity(&self, identity: Identity) {
        if let Ok(mut state) = self.state.lock() {
            if identity.is_authenticated() {
                state.process_count = 0;
            }
            state.identity = identity;
            state.remote = None;
            state.epoch += 1;
        }
    }

    /// Record the latest remote snapshot for an authenticated identity.
    pub fn observe_remote(&self, quota: RemoteQuota) {
        if let Ok(mut state) = self.state.lock() {
            if state.identity.is_authenticated() {
                state.remote = Some(quota);
            }
        }
    }

    pub fn can_process(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        match state.identity {
            Identity::Anonymous => state.process_count < self.max_free_images,
            Identity::Authenticated(_) => state
                .remote
                .map(|q| !q.capacity().is_exhausted())
                .unwrap_or(true),
        }
    }

    pub fn remaining_processes(&self) -> Capacity {
        let Ok(state) = self.state.lock() else {
            return Capacity::Limited(0);
        };
        match state.identity {
            Identity::Anonymous => {
                Capacity::Limited(self.max_free_images.saturating_sub(state.process_count))
            }
            Identity::Authenticated(_) => state
                .remote
                .map(|q| q.capacity())
                .unwrap_or(Capacity::Unlimited),
        }
    }

    /// Advance the anonymous counter by one unit.
    pub fn increment_count(&self) {
        if let Ok(mut state) = self.state.lock() {
            if !state.identity.is_authenticated() {
                state.process_count = (state.process_count + 1).min(self.max_free_images);
            }
        }
    }

    /// Set the anonymous counter back to zero. Outstanding reservations become no-ops.
    pub fn reset_count(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.process_count = 0;
            state.epoch += 1;
        }
    }

    /// Atomically check the allowance and pre-charge `cost` units.
    ///
    /// Authenticated identities get an empty reservation: their counter is
    /// owned remotely.
    pub fn reserve(&self, cost: u32) -> Result<Reservation> {
        let mut state = self.lock()?;
        if state.identity.is_authenticated() {
            if let Some(quota) = state.remote {
                if !quota.capacity().allows(cost) {
                    let remaining = match quota.capacity() {
                        Capacity::Limited(n) => n,
                        Capacity::Unlimited => u32::MAX,
                    };
                    return Err(ProcessingError::QuotaExceeded {
                        requested: cost,
                        remaining,
                    });
                }
            }
            return Ok(Reservation {
                units: 0,
                epoch: state.epoch,
            });
        }

        let remaining = self.max_free_images.saturating_sub(state.process_count);
        if cost > remaining {
            return Err(ProcessingError::QuotaExceeded {
                requested: cost,
                remaining,
            });
        }
        state.process_count += cost;
        Ok(Reservation {
            units: cost,
            epoch: state.epoch,
        })
    }

    /// Give back exactly what `reservation` charged, clamped at zero.
    ///
    /// A reservation taken before the last reset or identity switch is ignored.
    pub fn rollback(&self, reservation: Reservation) {
        if reservation.units == 0 {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            if state.epoch == reservation.epoch {
                state.process_count = state.process_count.saturating_sub(reservation.units);
            }
        }
    }
}
