//! User-facing billing endpoints

use axum::{extract::State, Json};
use framely_ledger::{LedgerError, Tier, UpgradeOutcome};
use serde::Deserialize;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    /// Raw tier name so an unknown value gets the stable `InvalidTarget`
    /// body instead of a deserialization rejection.
    pub target_tier: String,
}

/// POST /billing/upgrade
///
/// Either applies the tier change immediately (trial reprice or gateway
/// proration) or returns a checkout URL the client must redirect to.
pub async fn upgrade(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<UpgradeRequest>,
) -> ApiResult<Json<UpgradeOutcome>> {
    let target_tier = request
        .target_tier
        .parse::<Tier>()
        .map_err(|_| LedgerError::InvalidTarget(request.target_tier.clone()))?;
    tracing::info!(
        user_id = %user.user_id,
        target_tier = %target_tier,
        "Upgrade requested"
    );
    let outcome = state.upgrades.upgrade(user.user_id, target_tier).await?;
    Ok(Json(outcome))
}
