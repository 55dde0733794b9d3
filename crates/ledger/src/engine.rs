//! Reconciliation engine
//!
//! Applies a normalized webhook event to a subscription record, producing a
//! new record plus side effects. The transition function is pure and
//! replayable: the service wraps it in a read / compute / compare-and-swap
//! loop, so a version conflict simply recomputes from a fresh read. Credit
//! grants are guarded by the upgrade history (see
//! [`SubscriptionRecord::has_grant`]), which is what makes duplicate or
//! out-of-order deliveries safe without locking.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_retry::strategy::ExponentialBackoff;
use uuid::Uuid;

use crate::credits::{credits_for, BillingCycle, Tier};
use crate::error::{LedgerError, LedgerResult};
use crate::events::{EventEnvelope, NormalizedEvent, SubscriptionFields};
use crate::record::{SubscriptionRecord, SubscriptionStatus, UpgradeHistoryEntry, UpgradeType};
use crate::store::{CasOutcome, PaymentKind, PaymentLogEntry, SubscriptionStore};

/// Bounded CAS retries before surfacing `TransientConflict`.
const CAS_MAX_RETRIES: usize = 5;

/// Provisional period length used until the provider reports the
/// authoritative period bounds.
const PROVISIONAL_PERIOD_DAYS: i64 = 30;

/// Side effect of applying an event, beyond the record itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    CreditsGranted {
        amount: i64,
        to_tier: Tier,
        upgrade_type: UpgradeType,
    },
    PaymentLogged {
        kind: PaymentKind,
        amount_cents: i64,
    },
    Ignored {
        reason: String,
    },
}

/// New record plus the side effects the caller must carry out.
#[derive(Debug, Clone)]
pub struct Transition {
    pub record: SubscriptionRecord,
    pub effects: Vec<Effect>,
}

fn set_tier(record: &mut SubscriptionRecord, new_tier: Tier) {
    if record.tier != new_tier {
        record.previous_tier = Some(record.tier);
        record.tier = new_tier;
    }
}

fn rfc3339(ts: OffsetDateTime) -> serde_json::Value {
    serde_json::json!(ts
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default())
}

/// Grant `credits_for(tier, cycle)` unless an identical grant already exists
/// for the current subscription instance.
fn guarded_grant(
    record: &mut SubscriptionRecord,
    effects: &mut Vec<Effect>,
    to_tier: Tier,
    cycle: BillingCycle,
    upgrade_type: UpgradeType,
    proration_amount_cents: Option<i64>,
    now: OffsetDateTime,
) -> LedgerResult<()> {
    if record.has_grant(to_tier, cycle, upgrade_type) {
        effects.push(Effect::Ignored {
            reason: format!(
                "duplicate {} grant for {}/{} skipped",
                upgrade_type.as_str(),
                to_tier,
                cycle
            ),
        });
        return Ok(());
    }
    let amount = credits_for(to_tier, cycle)?;
    let from_tier = record.previous_tier.unwrap_or(record.tier);
    record.grant_credits(
        amount,
        UpgradeHistoryEntry {
            from_tier,
            to_tier,
            upgraded_at: now,
            upgrade_type,
            billing_cycle: cycle,
            proration_amount_cents,
            instance_epoch: record.instance_epoch,
        },
    )?;
    effects.push(Effect::CreditsGranted {
        amount,
        to_tier,
        upgrade_type,
    });
    Ok(())
}

fn apply_subscription_fields(record: &mut SubscriptionRecord, f: &SubscriptionFields) {
    if let Some(start) = f.current_period_start {
        record.current_period_start = Some(start);
    }
    if let Some(end) = f.current_period_end {
        record.current_period_end = Some(end);
    }
    if let Some(cycle) = f.billing_cycle {
        record.billing_cycle = Some(cycle);
    }
}

/// Pure transition: `(old record, event) -> new record + effects`.
///
/// Never performs I/O; callers may re-run it after a version conflict.
pub fn apply_event(
    record: &SubscriptionRecord,
    event: &NormalizedEvent,
    now: OffsetDateTime,
) -> LedgerResult<Transition> {
    let mut record = record.clone();
    let mut effects = Vec::new();

    match event {
        NormalizedEvent::CheckoutComplete {
            tier,
            billing_cycle,
            trial_end,
            external_customer_id,
        } => {
            record.attach_gateway_ids(external_customer_id.clone(), None);
            set_tier(&mut record, *tier);
            if let Some(cycle) = billing_cycle {
                record.billing_cycle = Some(*cycle);
            }
            record.current_period_start = Some(now);
            match trial_end {
                Some(end) if *end > now => {
                    record.status = SubscriptionStatus::Trialing;
                    record.trial_ends_at = Some(*end);
                    record.current_period_end = Some(*end);
                }
                _ => {
                    record.status = SubscriptionStatus::Active;
                    // Provisional until the provider reports the real period.
                    record.current_period_end =
                        Some(now + time::Duration::days(PROVISIONAL_PERIOD_DAYS));
                }
            }
            // No grant here: credits come from the follow-up
            // subscription_created once the cycle is confirmed. Granting in
            // both places would double-pay when both events arrive.
        }

        NormalizedEvent::SubscriptionCreated(f) => {
            record.attach_gateway_ids(
                f.external_customer_id.clone(),
                f.external_subscription_id.clone(),
            );
            apply_subscription_fields(&mut record, f);
            if let Some(tier) = f.tier {
                set_tier(&mut record, tier);
            }
            match f.status.as_deref() {
                Some("trialing") => {
                    record.status = SubscriptionStatus::Trialing;
                    if let Some(end) = f.trial_end {
                        record.trial_ends_at = Some(end);
                        record.note("trial_end", rfc3339(end));
                    }
                    if let Some(start) = f.trial_start {
                        record.note("trial_start", rfc3339(start));
                    }
                    // No money has moved during an unpaid trial: no grant.
                }
                Some("active") | Some("paid") | None => {
                    record.status = SubscriptionStatus::Active;
                    if record.tier.is_paid() {
                        let to_tier = record.tier;
                        let cycle = f
                            .billing_cycle
                            .or(record.billing_cycle)
                            .unwrap_or(BillingCycle::Monthly);
                        guarded_grant(
                            &mut record,
                            &mut effects,
                            to_tier,
                            cycle,
                            UpgradeType::InitialGrant,
                            None,
                            now,
                        )?;
                    }
                }
                Some(other) => {
                    effects.push(Effect::Ignored {
                        reason: format!("subscription_created with status '{other}'"),
                    });
                }
            }
        }

        NormalizedEvent::SubscriptionUpdate(f) | NormalizedEvent::SubscriptionDeleted(f) => {
            let deleted = matches!(event, NormalizedEvent::SubscriptionDeleted(_));
            let status = if deleted {
                "cancelled"
            } else {
                f.status.as_deref().unwrap_or("active")
            };
            match status {
                "cancelled" | "canceled" | "expired" => {
                    record.cancel_to_free(now);
                }
                "past_due" => {
                    record.status = SubscriptionStatus::PastDue;
                    record.note("requires_payment_update", serde_json::json!(true));
                    // Tier and balance are untouched; no clawback.
                }
                "paused" => {
                    record.status = SubscriptionStatus::Paused;
                }
                other => {
                    apply_subscription_fields(&mut record, f);
                    record.attach_gateway_ids(
                        f.external_customer_id.clone(),
                        f.external_subscription_id.clone(),
                    );
                    if f.cancel_at_period_end {
                        // Still usable until period end; just flag it.
                        record.cancel_at_period_end = true;
                        record.note("cancelled_at", rfc3339(now));
                    } else {
                        record.cancel_at_period_end = false;
                    }
                    match other {
                        "active" | "paid" => record.status = SubscriptionStatus::Active,
                        "trialing" => {
                            // Trials end via trial_ended, not via a
                            // mid-trial update.
                            record.status = SubscriptionStatus::Trialing;
                            if let Some(end) = f.trial_end {
                                record.trial_ends_at = Some(end);
                            }
                        }
                        unknown => {
                            // Statuses this build does not know keep the
                            // local status as-is rather than guessing.
                            effects.push(Effect::Ignored {
                                reason: format!(
                                    "subscription_update with status '{unknown}'"
                                ),
                            });
                        }
                    }
                    if let Some(tier) = f.tier {
                        if tier != record.tier {
                            // Authoritative tier correction from the
                            // provider; grants stay idempotent on history.
                            set_tier(&mut record, tier);
                        }
                    }
                }
            }
        }

        NormalizedEvent::SubscriptionTrialWillEnd { trial_end } => {
            if let Some(end) = trial_end {
                record.note("trial_will_end_at", rfc3339(*end));
            } else {
                record.note("trial_will_end_at", rfc3339(now));
            }
        }

        NormalizedEvent::SubscriptionTrialEnded => {
            if record.status == SubscriptionStatus::Trialing {
                record.status = SubscriptionStatus::Active;
            }
            record.trial_ends_at = None;
            // Any trial-period grant already happened; no re-grant.
        }

        NormalizedEvent::PaymentSuccess { amount_cents } => {
            record.has_payment_method = true;
            record.note("last_payment_at", rfc3339(now));
            effects.push(Effect::PaymentLogged {
                kind: PaymentKind::Payment,
                amount_cents: *amount_cents,
            });
        }

        NormalizedEvent::PaymentFailed { .. } => {
            if record.tier.is_paid() {
                record.status = SubscriptionStatus::PastDue;
            }
            record.note("payment_failed_at", rfc3339(now));
            record.note("requires_payment_update", serde_json::json!(true));
        }

        NormalizedEvent::SubscriptionPaused => {
            record.status = SubscriptionStatus::Paused;
        }

        NormalizedEvent::RefundCreated { amount_cents } => {
            // Business decision: refunds never claw back granted credits;
            // they are logged for manual review.
            effects.push(Effect::PaymentLogged {
                kind: PaymentKind::Refund,
                amount_cents: *amount_cents,
            });
        }

        NormalizedEvent::DisputeCreated { amount_cents } => {
            effects.push(Effect::PaymentLogged {
                kind: PaymentKind::Dispute,
                amount_cents: *amount_cents,
            });
        }

        NormalizedEvent::Unrecognized { kind } => {
            effects.push(Effect::Ignored {
                reason: format!("unrecognized event kind '{kind}'"),
            });
        }
    }

    Ok(Transition { record, effects })
}

/// Wraps the pure transition in the persistence discipline:
/// read, compute, compare-and-swap, retry on conflict with backoff.
pub struct ReconciliationService {
    store: Arc<dyn SubscriptionStore>,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    /// Route and apply a normalized envelope. Resolves the user id from the
    /// payload metadata or, failing that, a customer-id lookup.
    pub async fn process(&self, envelope: &EventEnvelope) -> LedgerResult<SubscriptionRecord> {
        if let NormalizedEvent::Unrecognized { kind } = &envelope.event {
            tracing::warn!(
                event_id = %envelope.event_id,
                kind = %kind,
                "Ignoring unrecognized webhook event"
            );
            return Err(LedgerError::Database(
                "unrecognized events are handled at the ingestion layer".to_string(),
            ));
        }

        let user_id = match envelope.user_id {
            Some(user_id) => user_id,
            None => {
                let customer = envelope.external_customer_id.as_deref().ok_or_else(|| {
                    LedgerError::NotFound("event carries no user or customer id".to_string())
                })?;
                self.store
                    .find_user_by_customer(customer)
                    .await?
                    .ok_or_else(|| LedgerError::NotFound(format!("customer {customer}")))?
            }
        };

        self.apply(user_id, &envelope.event, Some(&envelope.event_id))
            .await
    }

    /// Apply one event to one user's record with bounded CAS retries.
    pub async fn apply(
        &self,
        user_id: Uuid,
        event: &NormalizedEvent,
        event_id: Option<&str>,
    ) -> LedgerResult<SubscriptionRecord> {
        let mut delays = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_millis(250))
            .take(CAS_MAX_RETRIES);

        loop {
            let versioned = self
                .store
                .get(user_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(user_id.to_string()))?;

            let transition = apply_event(&versioned.record, event, OffsetDateTime::now_utc())?;

            match self
                .store
                .compare_and_swap(user_id, versioned.version, transition.record.clone())
                .await?
            {
                CasOutcome::Committed(version) => {
                    self.run_effects(user_id, event_id, &transition.effects)
                        .await?;
                    tracing::info!(
                        user_id = %user_id,
                        event = %event.kind(),
                        version = version,
                        tier = %transition.record.tier,
                        status = %transition.record.status,
                        "Reconciled subscription record"
                    );
                    return Ok(transition.record);
                }
                CasOutcome::Conflict => match delays.next() {
                    Some(delay) => {
                        tracing::debug!(
                            user_id = %user_id,
                            event = %event.kind(),
                            "Version conflict, recomputing transition"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(LedgerError::TransientConflict),
                },
            }
        }
    }

    async fn run_effects(
        &self,
        user_id: Uuid,
        event_id: Option<&str>,
        effects: &[Effect],
    ) -> LedgerResult<()> {
        for effect in effects {
            match effect {
                Effect::PaymentLogged { kind, amount_cents } => {
                    let Some(event_id) = event_id else { continue };
                    self.store
                        .append_payment(PaymentLogEntry {
                            event_id: event_id.to_string(),
                            user_id,
                            kind: *kind,
                            amount_cents: *amount_cents,
                            recorded_at: OffsetDateTime::now_utc(),
                        })
                        .await?;
                }
                Effect::CreditsGranted {
                    amount,
                    to_tier,
                    upgrade_type,
                } => {
                    tracing::info!(
                        user_id = %user_id,
                        amount = amount,
                        to_tier = %to_tier,
                        upgrade_type = upgrade_type.as_str(),
                        "Credits granted"
                    );
                }
                Effect::Ignored { reason } => {
                    tracing::debug!(user_id = %user_id, reason = %reason, "Event effect skipped");
                }
            }
        }
        Ok(())
    }
}
