// Ledger crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Framely Subscription Ledger
//!
//! Reconciliation engine for subscription tiers and the AI-credit ("points")
//! ledger. The payment provider's webhook stream is the source of truth for
//! subscription state; this crate turns those events into durable record
//! updates that stay correct under duplicate delivery, out-of-order delivery
//! and concurrent writers.
//!
//! ## What lives here
//!
//! - **Credit grant table**: tier x billing-cycle credit amounts
//! - **Subscription records**: versioned per-user state with optimistic
//!   concurrency
//! - **Event normalization**: provider webhook payloads mapped to a closed
//!   internal vocabulary, with HMAC signature verification
//! - **Reconciliation engine**: pure transition function + CAS retry loop
//! - **Upgrade orchestrator**: user-initiated tier changes (trial reprice,
//!   immediate proration, hosted checkout)
//! - **Invariant checks**: balance identity and record-consistency audits

pub mod credits;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod record;
pub mod store;
pub mod upgrade;

// Credits
pub use credits::{
    credits_for, signup_bonus, BillingCycle, Tier, PRO_MONTHLY_CREDITS, PRO_PLUS_MONTHLY_CREDITS,
    SIGNUP_BONUS_CREDITS,
};

// Error
pub use error::{LedgerError, LedgerResult};

// Records
pub use record::{
    SubscriptionRecord, SubscriptionStatus, UpgradeHistoryEntry, UpgradeType, Versioned,
};

// Events
pub use events::{
    normalize, sign_payload, verify_signature, EventEnvelope, NormalizedEvent, SubscriptionFields,
};

// Engine
pub use engine::{apply_event, Effect, ReconciliationService, Transition};

// Upgrade
pub use upgrade::{CheckoutUrls, UpgradeOrchestrator, UpgradeOutcome};

// Store
pub use store::{
    CasOutcome, MemoryStore, PaymentKind, PaymentLogEntry, PgStore, SubscriptionStore,
};

// Gateway
pub use gateway::{CheckoutParams, CheckoutSession, PaymentGateway, PlanChange, RestGateway};

// Invariants
pub use invariants::{check_record, InvariantViolation, ViolationSeverity};
