//! Ledger invariants
//!
//! Runnable consistency checks over a subscription record. Run after any
//! mutation or webhook replay to verify the ledger is in a valid state.
//!
//! Checks only read, never write, and every violation carries enough
//! context to debug.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credits::Tier;
use crate::record::{SubscriptionRecord, SubscriptionStatus};

/// A single failed invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User affected
    pub user_id: Uuid,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Credits may be wrong; money-adjacent
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Run every invariant check against one record.
pub fn check_record(record: &SubscriptionRecord) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let user_id = record.user_id;

    // Balance identity: balance = lifetime_earned - lifetime_spent
    if record.points_balance != record.points_lifetime_earned - record.points_lifetime_spent {
        violations.push(InvariantViolation {
            invariant: "balance_identity".to_string(),
            user_id,
            description: format!(
                "points_balance {} != lifetime_earned {} - lifetime_spent {}",
                record.points_balance, record.points_lifetime_earned, record.points_lifetime_spent
            ),
            context: serde_json::json!({
                "points_balance": record.points_balance,
                "points_lifetime_earned": record.points_lifetime_earned,
                "points_lifetime_spent": record.points_lifetime_spent,
            }),
            severity: ViolationSeverity::Critical,
        });
    }

    // Counters never go negative
    if record.points_balance < 0
        || record.points_lifetime_earned < 0
        || record.points_lifetime_spent < 0
    {
        violations.push(InvariantViolation {
            invariant: "non_negative_points".to_string(),
            user_id,
            description: "a points counter is negative".to_string(),
            context: serde_json::json!({
                "points_balance": record.points_balance,
                "points_lifetime_earned": record.points_lifetime_earned,
                "points_lifetime_spent": record.points_lifetime_spent,
            }),
            severity: ViolationSeverity::Critical,
        });
    }

    // cancelled implies free tier and no gateway subscription
    if record.status == SubscriptionStatus::Cancelled
        && (record.tier != Tier::Free || record.external_subscription_id.is_some())
    {
        violations.push(InvariantViolation {
            invariant: "cancelled_is_free".to_string(),
            user_id,
            description: format!(
                "cancelled record has tier '{}' and subscription id {:?}",
                record.tier, record.external_subscription_id
            ),
            context: serde_json::json!({
                "tier": record.tier.as_str(),
                "external_subscription_id": record.external_subscription_id,
            }),
            severity: ViolationSeverity::High,
        });
    }

    // free tier carries no billing cycle
    if record.tier == Tier::Free && record.billing_cycle.is_some() {
        violations.push(InvariantViolation {
            invariant: "free_has_no_cycle".to_string(),
            user_id,
            description: "free-tier record has a billing cycle".to_string(),
            context: serde_json::json!({
                "billing_cycle": record.billing_cycle.map(|c| c.as_str()),
            }),
            severity: ViolationSeverity::Medium,
        });
    }

    // history is chronological
    if record
        .upgrade_history
        .windows(2)
        .any(|w| w[0].upgraded_at > w[1].upgraded_at)
    {
        violations.push(InvariantViolation {
            invariant: "history_chronological".to_string(),
            user_id,
            description: "upgrade_history is out of chronological order".to_string(),
            context: serde_json::json!({ "entries": record.upgrade_history.len() }),
            severity: ViolationSeverity::High,
        });
    }

    // history epochs never exceed the record's current instance epoch
    if record
        .upgrade_history
        .iter()
        .any(|e| e.instance_epoch > record.instance_epoch)
    {
        violations.push(InvariantViolation {
            invariant: "history_epoch_bound".to_string(),
            user_id,
            description: "a history entry belongs to a future subscription instance".to_string(),
            context: serde_json::json!({ "instance_epoch": record.instance_epoch }),
            severity: ViolationSeverity::High,
        });
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_passes_all_checks() {
        let r = SubscriptionRecord::new_free(Uuid::new_v4());
        assert!(check_record(&r).is_empty());
    }

    #[test]
    fn broken_balance_identity_is_critical() {
        let mut r = SubscriptionRecord::new_free(Uuid::new_v4());
        r.points_balance += 1;
        let violations = check_record(&r);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "balance_identity");
        assert_eq!(violations[0].severity, ViolationSeverity::Critical);
    }

    #[test]
    fn cancelled_paid_record_is_flagged() {
        let mut r = SubscriptionRecord::new_free(Uuid::new_v4());
        r.status = SubscriptionStatus::Cancelled;
        r.tier = Tier::Pro;
        r.billing_cycle = Some(crate::credits::BillingCycle::Monthly);
        let names: Vec<_> = check_record(&r).into_iter().map(|v| v.invariant).collect();
        assert!(names.contains(&"cancelled_is_free".to_string()));
    }

    #[test]
    fn severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }
}
