//! Payment provider webhook ingestion
//!
//! Order of operations matters here: verify the signature over the raw
//! body, parse, atomically claim the event id, then normalize and hand the
//! envelope to the reconciliation engine. Duplicate deliveries lose the
//! claim and are acknowledged without reprocessing. Once the signature
//! checks out the sender is the provider, so every later failure answers
//! 5xx to trigger redelivery instead of dropping the event.

use axum::{extract::State, http::HeaderMap, Json};
use framely_ledger::{normalize, verify_signature, LedgerError, NormalizedEvent};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "x-payment-signature";

pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Ledger(LedgerError::SignatureInvalid))?;

    verify_signature(&body, signature, &state.config.webhook_secret)?;

    let payload: Value = serde_json::from_str(&body)
        .map_err(|e| ApiError::Processing(format!("malformed webhook body: {e}")))?;
    let event_id = payload
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Processing("webhook body has no event id".to_string()))?
        .to_string();
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    // Claim processing rights; a duplicate delivery gets acknowledged here.
    if !state.store.claim_event(&event_id, &event_type).await? {
        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Duplicate webhook delivery, already processed"
        );
        return Ok(Json(json!({ "received": true, "duplicate": true })));
    }

    // The claim is held from here on, so a failed normalization leaves an
    // audit row and the event stays re-claimable when redelivered.
    let envelope = match normalize(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "Webhook normalization failed"
            );
            state
                .store
                .finish_event(&event_id, "error", Some(&e.to_string()))
                .await?;
            return Err(e.into());
        }
    };

    if let NormalizedEvent::Unrecognized { kind } = &envelope.event {
        state
            .store
            .finish_event(&envelope.event_id, "ignored", None)
            .await?;
        return Ok(Json(json!({ "received": true, "ignored": kind })));
    }

    match state.reconciliation.process(&envelope).await {
        Ok(record) => {
            state
                .store
                .finish_event(&envelope.event_id, "success", None)
                .await?;
            Ok(Json(json!({
                "received": true,
                "tier": record.tier,
                "status": record.status,
            })))
        }
        // No record for this user/customer: acknowledge so the provider
        // stops retrying a delivery that can never succeed.
        Err(LedgerError::NotFound(what)) => {
            tracing::warn!(
                event_id = %envelope.event_id,
                event_type = %envelope.provider_kind,
                what = %what,
                "Webhook event has no matching subscription record, skipping"
            );
            state
                .store
                .finish_event(&envelope.event_id, "skipped", Some(&what))
                .await?;
            Ok(Json(json!({ "received": true, "skipped": true })))
        }
        Err(e) => {
            tracing::error!(
                event_id = %envelope.event_id,
                event_type = %envelope.provider_kind,
                error = %e,
                "Webhook processing failed"
            );
            state
                .store
                .finish_event(&envelope.event_id, "error", Some(&e.to_string()))
                .await?;
            Err(e.into())
        }
    }
}
