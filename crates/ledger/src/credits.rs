//! Credit grant table
//!
//! Pure lookup from (tier, billing cycle) to the number of points granted
//! when that plan is paid for. Yearly plans grant 12x the monthly amount
//! up front. The current balance never influences a grant.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// Monthly grant for the Pro plan.
pub const PRO_MONTHLY_CREDITS: i64 = 800;
/// Monthly grant for the Pro+ plan.
pub const PRO_PLUS_MONTHLY_CREDITS: i64 = 1600;
/// One-time bonus seeded into every newly created account record.
pub const SIGNUP_BONUS_CREDITS: i64 = 100;

/// Subscription plan level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    ProPlus,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::ProPlus => "pro_plus",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Tier::Free)
    }

    /// Ordering used to distinguish upgrades from downgrades.
    pub fn rank(&self) -> u8 {
        match self {
            Tier::Free => 0,
            Tier::Pro => 1,
            Tier::ProPlus => 2,
        }
    }

    /// Recognize a tier from a gateway plan/price identifier.
    ///
    /// Price ids embed the tier name (e.g. "price_pro_plus_monthly").
    /// "pro_plus" must be checked before "pro" since the latter is a prefix.
    pub fn from_plan_id(plan_id: &str) -> Option<Tier> {
        let p = plan_id.to_ascii_lowercase();
        if p.contains("pro_plus") || p.contains("proplus") {
            Some(Tier::ProPlus)
        } else if p.contains("pro") {
            Some(Tier::Pro)
        } else if p.contains("free") {
            Some(Tier::Free)
        } else {
            None
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "pro_plus" => Ok(Tier::ProPlus),
            other => Err(LedgerError::UnknownPlan(other.to_string())),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing recurrence for a paid tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    /// Recognize the cycle from a gateway plan/price identifier.
    pub fn from_plan_id(plan_id: &str) -> Option<BillingCycle> {
        let p = plan_id.to_ascii_lowercase();
        if p.contains("yearly") || p.contains("annual") {
            Some(BillingCycle::Yearly)
        } else if p.contains("monthly") {
            Some(BillingCycle::Monthly)
        } else {
            None
        }
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            other => Err(LedgerError::UnknownPlan(other.to_string())),
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Points granted when (tier, cycle) is paid for.
///
/// Total over every valid paid pair; the free tier grants nothing through
/// this path and is an `UnknownPlan` error.
pub fn credits_for(tier: Tier, cycle: BillingCycle) -> LedgerResult<i64> {
    let monthly = match tier {
        Tier::Pro => PRO_MONTHLY_CREDITS,
        Tier::ProPlus => PRO_PLUS_MONTHLY_CREDITS,
        Tier::Free => return Err(LedgerError::UnknownPlan("free".to_string())),
    };
    Ok(match cycle {
        BillingCycle::Monthly => monthly,
        BillingCycle::Yearly => monthly * 12,
    })
}

/// Bonus granted when an account record is first created.
pub fn signup_bonus() -> i64 {
    SIGNUP_BONUS_CREDITS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monthly_grants() {
        assert_eq!(credits_for(Tier::Pro, BillingCycle::Monthly).unwrap(), 800);
        assert_eq!(
            credits_for(Tier::ProPlus, BillingCycle::Monthly).unwrap(),
            1600
        );
    }

    #[test]
    fn yearly_is_twelve_times_monthly() {
        for tier in [Tier::Pro, Tier::ProPlus] {
            let monthly = credits_for(tier, BillingCycle::Monthly).unwrap();
            let yearly = credits_for(tier, BillingCycle::Yearly).unwrap();
            assert_eq!(yearly, monthly * 12, "yearly must be 12x monthly for {tier}");
        }
    }

    #[test]
    fn free_tier_is_rejected() {
        let err = credits_for(Tier::Free, BillingCycle::Monthly).unwrap_err();
        assert_eq!(err.kind(), "UnknownPlan");
    }

    #[test]
    fn grants_are_deterministic() {
        for tier in [Tier::Pro, Tier::ProPlus] {
            for cycle in [BillingCycle::Monthly, BillingCycle::Yearly] {
                let a = credits_for(tier, cycle).unwrap();
                let b = credits_for(tier, cycle).unwrap();
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn plan_id_recognizes_pro_plus_before_pro() {
        assert_eq!(Tier::from_plan_id("price_pro_plus_monthly"), Some(Tier::ProPlus));
        assert_eq!(Tier::from_plan_id("price_pro_yearly"), Some(Tier::Pro));
        assert_eq!(Tier::from_plan_id("price_custom"), None);
    }

    #[test]
    fn plan_id_recognizes_cycle() {
        assert_eq!(
            BillingCycle::from_plan_id("price_pro_annual"),
            Some(BillingCycle::Yearly)
        );
        assert_eq!(
            BillingCycle::from_plan_id("price_pro_monthly"),
            Some(BillingCycle::Monthly)
        );
        assert_eq!(BillingCycle::from_plan_id("price_pro"), None);
    }
}
