//! Ledger error taxonomy
//!
//! Error kinds are grouped by retry semantics:
//! - validation errors: no side effects, retry with different input
//! - precondition errors: record is in a state that does not support the
//!   operation; caller should redirect to a different flow
//! - gateway errors: the local record is guaranteed untouched
//! - `TransientConflict`: optimistic-concurrency retries exhausted; safe to
//!   retry the whole request

use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    // Validation
    #[error("invalid upgrade target: {0}")]
    InvalidTarget(String),

    #[error("already subscribed to the requested plan")]
    AlreadyOnPlan,

    #[error("downgrades must go through cancellation")]
    DowngradeNotSupported,

    // Preconditions
    #[error("no gateway subscription on file for this account")]
    NoGatewaySubscription,

    #[error("subscription state does not allow an in-place upgrade")]
    UpgradeNotAvailable,

    // Gateway
    #[error("payment gateway timed out")]
    GatewayTimeout,

    #[error("payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    // Persistence
    #[error("record was modified concurrently; retries exhausted")]
    TransientConflict,

    #[error("subscription record not found for {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    // Webhook boundary
    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    #[error("credit mutation would violate balance invariant: {0}")]
    BalanceViolation(String),
}

impl LedgerError {
    /// Stable wire identifier for API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::InvalidTarget(_) => "InvalidTarget",
            LedgerError::AlreadyOnPlan => "AlreadyOnPlan",
            LedgerError::DowngradeNotSupported => "DowngradeNotSupported",
            LedgerError::NoGatewaySubscription => "NoGatewaySubscription",
            LedgerError::UpgradeNotAvailable => "UpgradeNotAvailable",
            LedgerError::GatewayTimeout => "GatewayTimeout",
            LedgerError::GatewayRejected(_) => "GatewayRejected",
            LedgerError::TransientConflict => "TransientConflict",
            LedgerError::NotFound(_) => "NotFound",
            LedgerError::Database(_) => "Database",
            LedgerError::SignatureInvalid => "SignatureInvalid",
            LedgerError::UnknownPlan(_) => "UnknownPlan",
            LedgerError::BalanceViolation(_) => "BalanceViolation",
        }
    }

    /// Whether the caller may safely retry the whole operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::GatewayTimeout
                | LedgerError::GatewayRejected(_)
                | LedgerError::TransientConflict
                | LedgerError::Database(_)
        )
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(LedgerError::AlreadyOnPlan.kind(), "AlreadyOnPlan");
        assert_eq!(LedgerError::GatewayTimeout.kind(), "GatewayTimeout");
        assert_eq!(LedgerError::TransientConflict.kind(), "TransientConflict");
    }

    #[test]
    fn gateway_and_conflict_errors_are_retryable() {
        assert!(LedgerError::GatewayTimeout.is_retryable());
        assert!(LedgerError::TransientConflict.is_retryable());
        assert!(!LedgerError::AlreadyOnPlan.is_retryable());
        assert!(!LedgerError::DowngradeNotSupported.is_retryable());
    }
}
