//! Payment gateway seam
//!
//! The provider is an opaque capability: create a checkout session, change a
//! plan with immediate proration. The core never depends on the provider's
//! own data model beyond these shapes. Webhook signature verification lives
//! with the normalizer ([`crate::events`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credits::{BillingCycle, Tier};
use crate::error::{LedgerError, LedgerResult};

/// A hosted checkout session the user must complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub url: String,
}

/// Result of an in-place plan change with immediate proration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanChange {
    /// Prorated amount charged for the remainder of the period, in cents.
    /// Sign convention follows the provider: positive means a charge.
    pub proration_amount_cents: i64,
}

/// Parameters for creating a checkout session.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutParams {
    pub user_id: Uuid,
    pub target_tier: Tier,
    pub billing_cycle: BillingCycle,
    pub success_url: String,
    pub cancel_url: String,
    /// The plan the user is on today, for the provider's upgrade UX.
    pub current_tier: Tier,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(&self, params: CheckoutParams)
        -> LedgerResult<CheckoutSession>;

    async fn change_plan_with_proration(
        &self,
        external_subscription_id: &str,
        target_tier: Tier,
        billing_cycle: BillingCycle,
    ) -> LedgerResult<PlanChange>;
}

/// HTTP gateway client against the provider's REST API.
pub struct RestGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct PlanChangeResponse {
    proration_amount_cents: i64,
}

impl RestGateway {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn map_send_error(e: reqwest::Error) -> LedgerError {
        if e.is_timeout() {
            LedgerError::GatewayTimeout
        } else {
            LedgerError::GatewayRejected(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> LedgerResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = %status, body = %body, "Gateway rejected request");
        Err(LedgerError::GatewayRejected(format!("{status}: {body}")))
    }
}

#[async_trait]
impl PaymentGateway for RestGateway {
    async fn create_checkout_session(
        &self,
        params: CheckoutParams,
    ) -> LedgerResult<CheckoutSession> {
        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "client_reference_id": params.user_id,
                "plan": format!("price_{}_{}", params.target_tier.as_str(), params.billing_cycle.as_str()),
                "success_url": params.success_url,
                "cancel_url": params.cancel_url,
                "current_plan": params.current_tier.as_str(),
                "metadata": { "user_id": params.user_id },
            }))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let response = Self::check_status(response).await?;
        let session: CheckoutSessionResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::GatewayRejected(format!("bad checkout response: {e}")))?;
        Ok(CheckoutSession { url: session.url })
    }

    async fn change_plan_with_proration(
        &self,
        external_subscription_id: &str,
        target_tier: Tier,
        billing_cycle: BillingCycle,
    ) -> LedgerResult<PlanChange> {
        let response = self
            .client
            .post(format!(
                "{}/v1/subscriptions/{}/change_plan",
                self.base_url, external_subscription_id
            ))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "plan": format!("price_{}_{}", target_tier.as_str(), billing_cycle.as_str()),
                "proration_behavior": "always_invoice",
            }))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let response = Self::check_status(response).await?;
        let change: PlanChangeResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::GatewayRejected(format!("bad plan change response: {e}")))?;
        Ok(PlanChange {
            proration_amount_cents: change.proration_amount_cents,
        })
    }
}
