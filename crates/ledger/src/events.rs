//! Webhook event normalization
//!
//! Maps the payment provider's loosely-typed event payloads into a small
//! closed vocabulary so the state machine never inspects provider-specific
//! shapes. Unknown event kinds normalize to [`NormalizedEvent::Unrecognized`]
//! and are logged, never failed: ingestion must not 500 on an event kind we
//! intentionally ignore.
//!
//! Signature verification (HMAC-SHA256 over the raw payload) happens at the
//! ingestion boundary before normalization is invoked.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{BillingCycle, Tier};
use crate::error::{LedgerError, LedgerResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a webhook signature timestamp (seconds).
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Subscription fields shared by several event kinds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionFields {
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub status: Option<String>,
    pub tier: Option<Tier>,
    pub billing_cycle: Option<BillingCycle>,
    pub cancel_at_period_end: bool,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
}

/// Internal event vocabulary the reconciliation engine consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    CheckoutComplete {
        tier: Tier,
        billing_cycle: Option<BillingCycle>,
        trial_end: Option<OffsetDateTime>,
        external_customer_id: Option<String>,
    },
    SubscriptionCreated(SubscriptionFields),
    SubscriptionUpdate(SubscriptionFields),
    SubscriptionTrialWillEnd {
        trial_end: Option<OffsetDateTime>,
    },
    SubscriptionTrialEnded,
    SubscriptionDeleted(SubscriptionFields),
    PaymentSuccess {
        amount_cents: i64,
    },
    PaymentFailed {
        amount_cents: i64,
    },
    SubscriptionPaused,
    RefundCreated {
        amount_cents: i64,
    },
    DisputeCreated {
        amount_cents: i64,
    },
    /// Event kind we do not handle; processed as a logged no-op.
    Unrecognized {
        kind: String,
    },
}

impl NormalizedEvent {
    pub fn kind(&self) -> &str {
        match self {
            NormalizedEvent::CheckoutComplete { .. } => "checkout_complete",
            NormalizedEvent::SubscriptionCreated(_) => "subscription_created",
            NormalizedEvent::SubscriptionUpdate(_) => "subscription_update",
            NormalizedEvent::SubscriptionTrialWillEnd { .. } => "subscription_trial_will_end",
            NormalizedEvent::SubscriptionTrialEnded => "subscription_trial_ended",
            NormalizedEvent::SubscriptionDeleted(_) => "subscription_deleted",
            NormalizedEvent::PaymentSuccess { .. } => "payment_success",
            NormalizedEvent::PaymentFailed { .. } => "payment_failed",
            NormalizedEvent::SubscriptionPaused => "subscription_paused",
            NormalizedEvent::RefundCreated { .. } => "refund_created",
            NormalizedEvent::DisputeCreated { .. } => "dispute_created",
            NormalizedEvent::Unrecognized { kind } => kind,
        }
    }
}

/// A normalized event plus the identifiers needed to route it.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Provider event id; the ingestion idempotency key.
    pub event_id: String,
    /// Raw provider event type string.
    pub provider_kind: String,
    /// User id if the payload metadata carried one; otherwise resolved
    /// later by customer-id lookup.
    pub user_id: Option<Uuid>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub event: NormalizedEvent,
}

fn str_field<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn ts_field(obj: &Value, key: &str) -> Option<OffsetDateTime> {
    obj.get(key)
        .and_then(Value::as_i64)
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
}

fn amount_field(obj: &Value) -> i64 {
    ["amount_paid", "amount_due", "amount", "amount_refunded"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_i64))
        .unwrap_or(0)
}

fn plan_id_of(obj: &Value) -> Option<&str> {
    obj.get("plan")
        .and_then(|p| p.get("id"))
        .and_then(Value::as_str)
        .or_else(|| {
            obj.get("price")
                .and_then(|p| p.get("id"))
                .and_then(Value::as_str)
        })
        .or_else(|| str_field(obj, "plan_id"))
}

fn subscription_fields(obj: &Value) -> SubscriptionFields {
    let plan_id = plan_id_of(obj);
    SubscriptionFields {
        external_subscription_id: str_field(obj, "id").map(str::to_string),
        external_customer_id: str_field(obj, "customer").map(str::to_string),
        status: str_field(obj, "status").map(str::to_string),
        tier: plan_id.and_then(Tier::from_plan_id),
        billing_cycle: plan_id.and_then(BillingCycle::from_plan_id),
        cancel_at_period_end: obj
            .get("cancel_at_period_end")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        trial_start: ts_field(obj, "trial_start"),
        trial_end: ts_field(obj, "trial_end"),
        current_period_start: ts_field(obj, "current_period_start"),
        current_period_end: ts_field(obj, "current_period_end"),
    }
}

/// Normalize a verified provider payload.
///
/// Expects the provider envelope `{ "id", "type", "data": { "object": .. } }`.
/// Fails only on a structurally unusable payload (missing id/type); an
/// unknown `type` is not an error.
pub fn normalize(payload: &Value) -> LedgerResult<EventEnvelope> {
    let event_id = str_field(payload, "id")
        .ok_or_else(|| LedgerError::Database("webhook payload missing event id".to_string()))?
        .to_string();
    let provider_kind = str_field(payload, "type")
        .ok_or_else(|| LedgerError::Database("webhook payload missing event type".to_string()))?
        .to_string();

    let obj = payload
        .pointer("/data/object")
        .cloned()
        .unwrap_or(Value::Null);

    let user_id = obj
        .pointer("/metadata/user_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());

    let event = match provider_kind.as_str() {
        "checkout.session.completed" => {
            let plan_id = plan_id_of(&obj)
                .or_else(|| obj.pointer("/metadata/plan_id").and_then(Value::as_str));
            let tier = plan_id
                .and_then(Tier::from_plan_id)
                .ok_or_else(|| LedgerError::UnknownPlan(plan_id.unwrap_or("(none)").to_string()))?;
            NormalizedEvent::CheckoutComplete {
                tier,
                billing_cycle: plan_id.and_then(BillingCycle::from_plan_id),
                trial_end: ts_field(&obj, "trial_end"),
                external_customer_id: str_field(&obj, "customer").map(str::to_string),
            }
        }
        "customer.subscription.created" => {
            NormalizedEvent::SubscriptionCreated(subscription_fields(&obj))
        }
        "customer.subscription.updated" => {
            NormalizedEvent::SubscriptionUpdate(subscription_fields(&obj))
        }
        "customer.subscription.deleted" => {
            NormalizedEvent::SubscriptionDeleted(subscription_fields(&obj))
        }
        "customer.subscription.trial_will_end" => NormalizedEvent::SubscriptionTrialWillEnd {
            trial_end: ts_field(&obj, "trial_end"),
        },
        "customer.subscription.trial_ended" | "billing.subscription.trial_ended" => {
            NormalizedEvent::SubscriptionTrialEnded
        }
        "customer.subscription.paused" => NormalizedEvent::SubscriptionPaused,
        "invoice.paid" => NormalizedEvent::PaymentSuccess {
            amount_cents: amount_field(&obj),
        },
        "invoice.payment_failed" => NormalizedEvent::PaymentFailed {
            amount_cents: amount_field(&obj),
        },
        "charge.refunded" => NormalizedEvent::RefundCreated {
            amount_cents: amount_field(&obj),
        },
        "charge.dispute.created" => NormalizedEvent::DisputeCreated {
            amount_cents: amount_field(&obj),
        },
        other => {
            tracing::warn!(
                event_type = %other,
                event_id = %event_id,
                "Unrecognized webhook event kind - ignoring"
            );
            NormalizedEvent::Unrecognized {
                kind: other.to_string(),
            }
        }
    };

    Ok(EventEnvelope {
        event_id,
        provider_kind,
        user_id,
        external_customer_id: str_field(&obj, "customer").map(str::to_string),
        external_subscription_id: match &event {
            NormalizedEvent::SubscriptionCreated(f)
            | NormalizedEvent::SubscriptionUpdate(f)
            | NormalizedEvent::SubscriptionDeleted(f) => f.external_subscription_id.clone(),
            _ => str_field(&obj, "subscription").map(str::to_string),
        },
        event,
    })
}

/// Verify the webhook signature header against the raw payload.
///
/// Header format: `t=<unix ts>,v1=<hex hmac>`. Signed payload is
/// `"{timestamp}.{payload}"`; timestamps older than 5 minutes are rejected.
pub fn verify_signature(payload: &str, signature: &str, secret: &str) -> LedgerResult<()> {
    verify_signature_at(payload, signature, secret, OffsetDateTime::now_utc())
}

/// Same as [`verify_signature`] with an injected clock for tests.
pub fn verify_signature_at(
    payload: &str,
    signature: &str,
    secret: &str,
    now: OffsetDateTime,
) -> LedgerResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        LedgerError::SignatureInvalid
    })?;
    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::warn!("Missing v1 signature in signature header");
        LedgerError::SignatureInvalid
    })?;

    if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now.unix_timestamp(),
            "Webhook signature timestamp outside tolerance"
        );
        return Err(LedgerError::SignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| LedgerError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(LedgerError::SignatureInvalid);
    }

    Ok(())
}

/// Build a signature header for `payload` at `timestamp`. Used by tests and
/// local tooling to produce deliveries the endpoint will accept.
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> String {
    let signed_payload = format!("{}.{}", timestamp, payload);
    #[allow(clippy::expect_used)] // HMAC accepts keys of any length
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(signed_payload.as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, object: Value) -> Value {
        json!({
            "id": "evt_test_1",
            "type": kind,
            "created": 1_700_000_000,
            "data": { "object": object }
        })
    }

    #[test]
    fn subscription_created_maps_fields() {
        let payload = envelope(
            "customer.subscription.created",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "cancel_at_period_end": false,
                "current_period_start": 1_700_000_000,
                "current_period_end": 1_702_592_000,
                "plan": { "id": "price_pro_plus_yearly" },
                "metadata": { "user_id": "7f3b0000-0000-0000-0000-000000000001" }
            }),
        );
        let env = normalize(&payload).unwrap();
        assert_eq!(env.event_id, "evt_test_1");
        assert!(env.user_id.is_some());
        match env.event {
            NormalizedEvent::SubscriptionCreated(f) => {
                assert_eq!(f.tier, Some(Tier::ProPlus));
                assert_eq!(f.billing_cycle, Some(BillingCycle::Yearly));
                assert_eq!(f.status.as_deref(), Some("active"));
                assert_eq!(f.external_subscription_id.as_deref(), Some("sub_1"));
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn checkout_complete_with_trial() {
        let payload = envelope(
            "checkout.session.completed",
            json!({
                "customer": "cus_2",
                "trial_end": 1_702_592_000,
                "metadata": { "plan_id": "price_pro_monthly" }
            }),
        );
        let env = normalize(&payload).unwrap();
        match env.event {
            NormalizedEvent::CheckoutComplete {
                tier,
                billing_cycle,
                trial_end,
                ..
            } => {
                assert_eq!(tier, Tier::Pro);
                assert_eq!(billing_cycle, Some(BillingCycle::Monthly));
                assert!(trial_end.is_some());
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn payment_events_extract_amount() {
        let paid = envelope("invoice.paid", json!({ "amount_paid": 2900, "customer": "cus_3" }));
        match normalize(&paid).unwrap().event {
            NormalizedEvent::PaymentSuccess { amount_cents } => assert_eq!(amount_cents, 2900),
            other => panic!("wrong event: {other:?}"),
        }

        let refunded = envelope("charge.refunded", json!({ "amount_refunded": 500 }));
        match normalize(&refunded).unwrap().event {
            NormalizedEvent::RefundCreated { amount_cents } => assert_eq!(amount_cents, 500),
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_passthrough_not_error() {
        let payload = envelope("customer.tax_id.created", json!({}));
        let env = normalize(&payload).unwrap();
        assert!(matches!(env.event, NormalizedEvent::Unrecognized { ref kind } if kind == "customer.tax_id.created"));
    }

    #[test]
    fn missing_event_id_is_an_error() {
        let payload = json!({ "type": "invoice.paid", "data": { "object": {} } });
        assert!(normalize(&payload).is_err());
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_test";
        let now = OffsetDateTime::now_utc();
        let header = sign_payload(payload, secret, now.unix_timestamp());
        verify_signature_at(payload, &header, secret, now).unwrap();
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let secret = "whsec_test";
        let now = OffsetDateTime::now_utc();
        let header = sign_payload(r#"{"id":"evt_1"}"#, secret, now.unix_timestamp());
        let err =
            verify_signature_at(r#"{"id":"evt_2"}"#, &header, secret, now).unwrap_err();
        assert_eq!(err.kind(), "SignatureInvalid");
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_test";
        let now = OffsetDateTime::now_utc();
        let header = sign_payload(payload, secret, now.unix_timestamp() - 301);
        let err = verify_signature_at(payload, &header, secret, now).unwrap_err();
        assert_eq!(err.kind(), "SignatureInvalid");

        // 300s old is still within tolerance
        let header = sign_payload(payload, secret, now.unix_timestamp() - 300);
        verify_signature_at(payload, &header, secret, now).unwrap();
    }

    #[test]
    fn malformed_header_is_rejected() {
        let err = verify_signature("{}", "not-a-header", "secret").unwrap_err();
        assert_eq!(err.kind(), "SignatureInvalid");
    }
}
