//! Collaborator seams for dispatch.
//!
//! The relational store is the durable source of truth for operators and
//! claims; the coordination store only carries perishable mirrors. These
//! traits keep that boundary explicit; the HTTP/ingestion layer injects
//! its own implementations.

use async_trait::async_trait;

use vigil_core::models::{AccountClaim, DispatchPool, Operator};

use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OperatorDirectory: Send + Sync {
    /// Operators eligible for `pool`: active, receiving flag set, role
    /// matching the pool, and not already holding a claim. Ordering must be
    /// stable (e.g. by operator id) so the shared round-robin counter maps
    /// to the same slate on every worker.
    async fn eligible_operators(&self, pool: DispatchPool) -> Result<Vec<Operator>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// The claim currently recorded for an account, expired or not
    async fn active_claim(&self, account_id: i64) -> Result<Option<AccountClaim>>;

    /// Persist a claim, replacing any existing row for the same account
    async fn insert_claim(&self, claim: &AccountClaim) -> Result<()>;

    /// Delete the account's claim. With `user_id` set, only a claim held by
    /// that user is deleted. Returns whether a row was removed.
    async fn release_claim(&self, account_id: i64, user_id: Option<i64>) -> Result<bool>;

    /// Claims whose expiry has passed, for the periodic sweep
    async fn expired_claims(&self) -> Result<Vec<AccountClaim>>;
}

/// Fire-and-forget assignment notification (pub-sub collaborator).
/// Implementations swallow and log their own failures.
#[async_trait]
pub trait AssignmentBroadcast: Send + Sync {
    async fn notify_assignment(&self, claim: &AccountClaim, operator: &Operator);
}

/// Broadcast that only logs, the default until a pub-sub channel is wired
pub struct LogBroadcast;

#[async_trait]
impl AssignmentBroadcast for LogBroadcast {
    async fn notify_assignment(&self, claim: &AccountClaim, operator: &Operator) {
        tracing::info!(
            account_id = claim.account_id,
            user_id = operator.id,
            username = %operator.username,
            "Assignment notification"
        );
    }
}
