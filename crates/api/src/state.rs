//! Application state

use std::sync::Arc;

use framely_ledger::{
    CheckoutUrls, PaymentGateway, PgStore, ReconciliationService, RestGateway, SubscriptionStore,
    UpgradeOrchestrator,
};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state. Store and gateway are trait objects so handler
/// tests can swap in in-memory doubles.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn SubscriptionStore>,
    pub reconciliation: Arc<ReconciliationService>,
    pub upgrades: Arc<UpgradeOrchestrator>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let store: Arc<dyn SubscriptionStore> = Arc::new(PgStore::new(pool));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(RestGateway::new(
            config.gateway_base_url.clone(),
            config.gateway_api_key.clone(),
        ));
        Self::with_backends(config, store, gateway)
    }

    /// Wire up services over explicit backends. Tests use this with the
    /// in-memory store and a stub gateway.
    pub fn with_backends(
        config: Config,
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let reconciliation = Arc::new(ReconciliationService::new(store.clone()));
        let upgrades = Arc::new(UpgradeOrchestrator::new(
            store.clone(),
            gateway,
            config.gateway_timeout,
            CheckoutUrls {
                success_url: config.checkout_success_url.clone(),
                cancel_url: config.checkout_cancel_url.clone(),
            },
        ));
        Self {
            config,
            store,
            reconciliation,
            upgrades,
        }
    }
}
