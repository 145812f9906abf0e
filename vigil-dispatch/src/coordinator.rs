//! Operator dispatch coordination.
//!
//! Routes an account's pending alarm events to exactly one operator across
//! any number of workers. Mutual exclusion comes from a per-account
//! distributed lock; fairness from a shared monotonic counter, so a worker
//! crash or restart never resets the rotation.

use std::sync::Arc;
use std::time::Duration;

use vigil_core::config::DispatchConfig;
use vigil_core::models::{AccountClaim, DispatchPool};
use vigil_core::{CoordStore, DistributedLock, LockAcquisition, RoundRobinCounter};

use crate::error::Result;
use crate::traits::{AssignmentBroadcast, ClaimStore, OperatorDirectory};

/// Outcome of an assignment attempt. Everything here is a normal result,
/// not an error: losing a race reads as "someone else is handling it".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// A fresh claim was created for this operator
    Assigned { user_id: i64 },
    /// A non-expired claim already exists (race guard hit)
    AlreadyClaimed { user_id: i64 },
    /// Nobody is active, receiving, and unclaimed in the pool
    NoEligibleOperators,
    /// Another worker holds the per-account assignment lock
    LockBusy,
}

pub struct DispatchCoordinator {
    store: CoordStore,
    counter: RoundRobinCounter,
    directory: Arc<dyn OperatorDirectory>,
    claims: Arc<dyn ClaimStore>,
    broadcast: Arc<dyn AssignmentBroadcast>,
    config: DispatchConfig,
}

impl DispatchCoordinator {
    #[must_use]
    pub fn new(
        store: CoordStore,
        directory: Arc<dyn OperatorDirectory>,
        claims: Arc<dyn ClaimStore>,
        broadcast: Arc<dyn AssignmentBroadcast>,
        config: DispatchConfig,
    ) -> Self {
        let counter = RoundRobinCounter::new(store.clone());
        Self {
            store,
            counter,
            directory,
            claims,
            broadcast,
            config,
        }
    }

    fn lock_key(account_id: i64) -> String {
        format!("assign:{account_id}")
    }

    fn mirror_key(account_id: i64) -> String {
        format!("account_claim:{account_id}")
    }

    fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.claim_ttl_minutes)
    }

    /// Assign the account's pending events to one operator from `pool`.
    ///
    /// Re-entrant and idempotent: an existing claim is returned rather than
    /// replaced, so this is safe to call both at event ingestion and from a
    /// periodic sweep.
    pub async fn assign(&self, account_id: i64, pool: DispatchPool) -> Result<Assignment> {
        let lock = DistributedLock::acquire(
            &self.store,
            &Self::lock_key(account_id),
            Duration::from_secs(self.config.lock_hold_ttl_seconds),
            Duration::from_secs(self.config.lock_wait_seconds),
        )
        .await;

        match lock.acquisition() {
            LockAcquisition::Contended => {
                // Another worker is assigning this account right now
                lock.release().await;
                return Ok(Assignment::LockBusy);
            }
            LockAcquisition::StoreUnavailable => {
                tracing::warn!(
                    account_id,
                    "Coordination store unavailable, assigning single-worker best-effort"
                );
            }
            LockAcquisition::Acquired => {}
        }

        let result = self.assign_locked(account_id, pool).await;
        lock.release().await;
        result
    }

    async fn assign_locked(&self, account_id: i64, pool: DispatchPool) -> Result<Assignment> {
        // Race guard: re-check the durable record inside the lock. The
        // store mirror is a perishable cache and is never trusted here.
        if let Some(claim) = self.claims.active_claim(account_id).await? {
            if !claim.is_expired() {
                tracing::debug!(
                    account_id,
                    user_id = claim.user_id,
                    "Account already claimed"
                );
                return Ok(Assignment::AlreadyClaimed {
                    user_id: claim.user_id,
                });
            }
        }

        let eligible = self.directory.eligible_operators(pool).await?;
        if eligible.is_empty() {
            tracing::debug!(account_id, %pool, "No eligible operators");
            return Ok(Assignment::NoEligibleOperators);
        }

        let index = self.counter.next_index(pool.counter_key(), eligible.len()).await;
        let operator = &eligible[index];

        let claim = AccountClaim::new(account_id, operator.id, self.claim_ttl());
        self.claims.insert_claim(&claim).await?;

        // Mirror for fast cross-worker reads; expires with the claim
        let mirror_ttl = Duration::from_secs((self.config.claim_ttl_minutes as u64) * 60);
        self.store
            .set_json_with_ttl(&Self::mirror_key(account_id), &claim, mirror_ttl)
            .await;

        self.broadcast.notify_assignment(&claim, operator).await;

        tracing::info!(
            account_id,
            user_id = operator.id,
            username = %operator.username,
            %pool,
            "Account assigned"
        );
        Ok(Assignment::Assigned {
            user_id: operator.id,
        })
    }

    /// Manual release by the claim holder. Returns whether a claim held by
    /// `user_id` was removed.
    pub async fn release(&self, account_id: i64, user_id: i64) -> Result<bool> {
        let released = self.claims.release_claim(account_id, Some(user_id)).await?;
        if released {
            self.store.delete(&Self::mirror_key(account_id)).await;
            tracing::info!(account_id, user_id, "Claim released");
        }
        Ok(released)
    }

    /// Current claim holder, if any. Reads the store mirror first and falls
    /// back to the durable record.
    pub async fn claim_owner(&self, account_id: i64) -> Result<Option<i64>> {
        if let Some(claim) = self
            .store
            .get_json::<AccountClaim>(&Self::mirror_key(account_id))
            .await
        {
            if !claim.is_expired() {
                return Ok(Some(claim.user_id));
            }
        }

        Ok(self
            .claims
            .active_claim(account_id)
            .await?
            .filter(|claim| !claim.is_expired())
            .map(|claim| claim.user_id))
    }

    /// Release every expired claim. Per-claim failures are logged and the
    /// sweep continues; returns how many claims were released.
    pub async fn sweep_expired(&self) -> usize {
        let expired = match self.claims.expired_claims().await {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!("Failed to list expired claims: {e}");
                return 0;
            }
        };

        let mut released = 0;
        for claim in expired {
            match self.claims.release_claim(claim.account_id, None).await {
                Ok(true) => {
                    self.store.delete(&Self::mirror_key(claim.account_id)).await;
                    tracing::info!(
                        account_id = claim.account_id,
                        user_id = claim.user_id,
                        "Expired claim released"
                    );
                    released += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        account_id = claim.account_id,
                        "Failed to release expired claim: {e}"
                    );
                }
            }
        }
        released
    }
}
