//! Subscription record
//!
//! One record per user, owned exclusively by the reconciliation engine and
//! mutated only through it. The record carries its own audit trail
//! (`upgrade_history`) which doubles as the idempotency guard for credit
//! grants: a grant with the same (to_tier, billing_cycle, upgrade_type) for
//! the current subscription instance is applied at most once.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{signup_bonus, BillingCycle, Tier};
use crate::error::{LedgerError, LedgerResult};

/// Subscription lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Paused,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "paused" => Ok(SubscriptionStatus::Paused),
            "cancelled" | "canceled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(LedgerError::Database(format!("unknown status: {other}"))),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a credit grant / tier change came about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeType {
    /// First grant for a confirmed paid subscription
    InitialGrant,
    /// Upgrade applied mid-trial with a payment method on file
    TrialUpgrade,
    /// Upgrade applied immediately with gateway proration
    ImmediateProration,
}

impl UpgradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeType::InitialGrant => "initial_grant",
            UpgradeType::TrialUpgrade => "trial_upgrade",
            UpgradeType::ImmediateProration => "immediate_proration",
        }
    }
}

/// One entry in the append-only upgrade history.
///
/// Insertion order is chronological and is the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeHistoryEntry {
    pub from_tier: Tier,
    pub to_tier: Tier,
    #[serde(with = "time::serde::rfc3339")]
    pub upgraded_at: OffsetDateTime,
    pub upgrade_type: UpgradeType,
    pub billing_cycle: BillingCycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proration_amount_cents: Option<i64>,
    /// Subscription instance this entry belongs to (see
    /// [`SubscriptionRecord::instance_epoch`]).
    pub instance_epoch: u32,
}

/// Durable subscription state for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub tier: Tier,
    pub previous_tier: Option<Tier>,
    pub status: SubscriptionStatus,
    pub billing_cycle: Option<BillingCycle>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    pub has_payment_method: bool,
    pub cancel_at_period_end: bool,
    pub points_balance: i64,
    pub points_lifetime_earned: i64,
    pub points_lifetime_spent: i64,
    pub upgrade_history: Vec<UpgradeHistoryEntry>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_proration_date: Option<OffsetDateTime>,
    pub proration_amount_cents: Option<i64>,
    /// Counter bumped on every cancelled->free reset and on every
    /// external_subscription_id change. Scopes the grant idempotency guard
    /// to the current subscription instance.
    pub instance_epoch: u32,
    /// Non-authoritative bookkeeping only; never read for control flow.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SubscriptionRecord {
    /// Fresh free-tier record, seeded with the signup bonus.
    pub fn new_free(user_id: Uuid) -> Self {
        let bonus = signup_bonus();
        Self {
            user_id,
            tier: Tier::Free,
            previous_tier: None,
            status: SubscriptionStatus::Active,
            billing_cycle: None,
            external_customer_id: None,
            external_subscription_id: None,
            current_period_start: None,
            current_period_end: None,
            trial_ends_at: None,
            has_payment_method: false,
            cancel_at_period_end: false,
            points_balance: bonus,
            points_lifetime_earned: bonus,
            points_lifetime_spent: 0,
            upgrade_history: Vec::new(),
            last_proration_date: None,
            proration_amount_cents: None,
            instance_epoch: 0,
            metadata: HashMap::new(),
        }
    }

    /// Whether a grant with this shape was already applied for the current
    /// subscription instance. This is what makes replayed or duplicate
    /// webhook deliveries safe.
    pub fn has_grant(&self, to_tier: Tier, cycle: BillingCycle, upgrade_type: UpgradeType) -> bool {
        self.upgrade_history.iter().any(|e| {
            e.instance_epoch == self.instance_epoch
                && e.to_tier == to_tier
                && e.billing_cycle == cycle
                && e.upgrade_type == upgrade_type
        })
    }

    /// Add `amount` points and append the matching history entry.
    ///
    /// Rejects negative amounts; the engine never claws back credits.
    pub fn grant_credits(
        &mut self,
        amount: i64,
        entry: UpgradeHistoryEntry,
    ) -> LedgerResult<()> {
        if amount < 0 {
            return Err(LedgerError::BalanceViolation(format!(
                "refusing negative grant of {amount} points"
            )));
        }
        self.points_balance += amount;
        self.points_lifetime_earned += amount;
        self.upgrade_history.push(entry);
        Ok(())
    }

    /// Attach gateway handles. A changed subscription id starts a new
    /// subscription instance.
    pub fn attach_gateway_ids(
        &mut self,
        customer_id: Option<String>,
        subscription_id: Option<String>,
    ) {
        if let Some(cid) = customer_id {
            self.external_customer_id = Some(cid);
        }
        if let Some(sid) = subscription_id {
            if self.external_subscription_id.as_deref() != Some(sid.as_str()) {
                if self.external_subscription_id.is_some() {
                    self.instance_epoch += 1;
                }
                self.external_subscription_id = Some(sid);
            }
        }
    }

    /// Reset to free after a cancellation. Status becomes `cancelled`;
    /// points are untouched; the instance epoch advances so a future
    /// checkout can grant again.
    pub fn cancel_to_free(&mut self, at: OffsetDateTime) {
        self.previous_tier = Some(self.tier);
        self.tier = Tier::Free;
        self.status = SubscriptionStatus::Cancelled;
        self.billing_cycle = None;
        self.external_subscription_id = None;
        self.has_payment_method = false;
        self.cancel_at_period_end = false;
        self.trial_ends_at = None;
        self.instance_epoch += 1;
        self.metadata.insert(
            "cancelled_at".to_string(),
            serde_json::json!(at
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default()),
        );
    }

    /// Write a metadata timestamp under `key`.
    pub fn note(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }
}

/// A record paired with its optimistic-concurrency token.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: i64,
    pub record: T,
}
