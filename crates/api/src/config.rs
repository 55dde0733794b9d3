//! Server configuration loaded from the environment

use std::time::Duration;

/// Runtime configuration. Everything comes from environment variables so the
/// same binary runs locally, in CI and in production.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// HMAC secret shared with the payment provider for webhook signatures.
    pub webhook_secret: String,
    /// Secret for verifying user JWTs on authenticated endpoints.
    pub jwt_secret: String,
    pub gateway_base_url: String,
    pub gateway_api_key: String,
    pub gateway_timeout: Duration,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let gateway_timeout_secs: u64 = std::env::var("GATEWAY_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid GATEWAY_TIMEOUT_SECS: {e}"))?;

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            webhook_secret: required("WEBHOOK_SECRET")?,
            jwt_secret: required("JWT_SECRET")?,
            gateway_base_url: required("GATEWAY_BASE_URL")?,
            gateway_api_key: required("GATEWAY_API_KEY")?,
            gateway_timeout: Duration::from_secs(gateway_timeout_secs),
            checkout_success_url: std::env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing/success".to_string()),
            checkout_cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing".to_string()),
        })
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("{name} must be set"))
}
