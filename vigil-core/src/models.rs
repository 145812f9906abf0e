//! Domain records shared across the coordination layer.
//!
//! Durable storage for these records belongs to the relational-store
//! collaborator; only the shapes needed for dispatch decisions and store
//! mirroring live here.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Role of a human operator, as recorded by the account system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorRole {
    Admin,
    Supervisor,
    Operator,
    EscalationOperator,
}

/// Dispatch pool an alarm event is routed through.
///
/// Supervisors and admins monitor but are never auto-assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPool {
    Operators,
    Escalation,
}

impl DispatchPool {
    /// Shared round-robin counter key for this pool
    #[must_use]
    pub fn counter_key(&self) -> &'static str {
        match self {
            Self::Operators => "dispatch_rr:operators",
            Self::Escalation => "dispatch_rr:escalation",
        }
    }

    /// Whether an operator with `role` is routed through this pool
    #[must_use]
    pub fn accepts(&self, role: OperatorRole) -> bool {
        matches!(
            (self, role),
            (Self::Operators, OperatorRole::Operator)
                | (Self::Escalation, OperatorRole::EscalationOperator)
        )
    }
}

impl std::fmt::Display for DispatchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operators => write!(f, "operators"),
            Self::Escalation => write!(f, "escalation"),
        }
    }
}

/// A human operator as seen by the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operator {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
    /// Operator opted in to receiving auto-assigned events
    pub is_receiving: bool,
    pub role: OperatorRole,
}

impl Operator {
    /// Eligibility for a pool, before the already-claimed check
    #[must_use]
    pub fn eligible_for(&self, pool: DispatchPool) -> bool {
        self.is_active && self.is_receiving && pool.accepts(self.role)
    }
}

/// Time-bounded assignment of one account's pending events to one operator.
///
/// At most one claim exists per account. The relational store holds the
/// durable record; a JSON copy is mirrored into the coordination store for
/// fast cross-worker checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountClaim {
    pub account_id: i64,
    pub user_id: i64,
    pub claimed_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccountClaim {
    #[must_use]
    pub fn new(account_id: i64, user_id: i64, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            account_id,
            user_id,
            claimed_at: now,
            last_activity: now,
            expires_at: now + ttl,
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Record activity on the claim without extending its expiry
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator(role: OperatorRole) -> Operator {
        Operator {
            id: 1,
            username: "op".to_string(),
            is_active: true,
            is_receiving: true,
            role,
        }
    }

    #[test]
    fn test_pool_accepts_matching_role_only() {
        assert!(DispatchPool::Operators.accepts(OperatorRole::Operator));
        assert!(!DispatchPool::Operators.accepts(OperatorRole::EscalationOperator));
        assert!(DispatchPool::Escalation.accepts(OperatorRole::EscalationOperator));
        assert!(!DispatchPool::Escalation.accepts(OperatorRole::Supervisor));
        assert!(!DispatchPool::Operators.accepts(OperatorRole::Admin));
    }

    #[test]
    fn test_eligibility_requires_active_and_receiving() {
        let mut op = operator(OperatorRole::Operator);
        assert!(op.eligible_for(DispatchPool::Operators));

        op.is_receiving = false;
        assert!(!op.eligible_for(DispatchPool::Operators));

        op.is_receiving = true;
        op.is_active = false;
        assert!(!op.eligible_for(DispatchPool::Operators));
    }

    #[test]
    fn test_claim_expiry() {
        let claim = AccountClaim::new(42, 7, Duration::minutes(30));
        assert!(!claim.is_expired());

        let expired = AccountClaim {
            expires_at: Utc::now() - Duration::seconds(1),
            ..claim
        };
        assert!(expired.is_expired());
    }

    #[test]
    fn test_claim_serialization_round_trip() {
        let claim = AccountClaim::new(42, 7, Duration::minutes(30));
        let json = serde_json::to_string(&claim).unwrap();
        let back: AccountClaim = serde_json::from_str(&json).unwrap();
        assert_eq!(back.account_id, 42);
        assert_eq!(back.user_id, 7);
    }
}
