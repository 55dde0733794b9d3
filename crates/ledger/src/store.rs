//! Subscription record store
//!
//! Durable, keyed-by-user storage with optimistic concurrency control.
//! Multiple webhook deliveries and a user-initiated upgrade can race on the
//! same record, so plain overwrites are not acceptable: every write is a
//! compare-and-swap on the version read beforehand.
//!
//! `PgStore` is the production implementation. `MemoryStore` backs tests and
//! local runs without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::record::{SubscriptionRecord, Versioned};

/// Outcome of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Write committed; carries the new version.
    Committed(i64),
    /// Another writer got there first; re-read and recompute.
    Conflict,
}

/// Kind of entry in the append-only payment log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Payment,
    Refund,
    Dispute,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Payment => "payment",
            PaymentKind::Refund => "refund",
            PaymentKind::Dispute => "dispute",
        }
    }
}

/// Append-only payment log entry, deduplicated on the provider event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentLogEntry {
    pub event_id: String,
    pub user_id: Uuid,
    pub kind: PaymentKind,
    pub amount_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Storage contract for the reconciliation engine.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Point lookup by user id.
    async fn get(&self, user_id: Uuid) -> LedgerResult<Option<Versioned<SubscriptionRecord>>>;

    /// Insert a brand-new record at version 1. Fails if one already exists.
    async fn insert(&self, record: SubscriptionRecord) -> LedgerResult<Versioned<SubscriptionRecord>>;

    /// Write `record` only if the stored version is still `expected_version`.
    async fn compare_and_swap(
        &self,
        user_id: Uuid,
        expected_version: i64,
        record: SubscriptionRecord,
    ) -> LedgerResult<CasOutcome>;

    /// Resolve a user from a gateway customer id.
    async fn find_user_by_customer(&self, external_customer_id: &str) -> LedgerResult<Option<Uuid>>;

    /// Atomically claim a provider event id for processing. Returns false if
    /// the event was already claimed (duplicate delivery).
    async fn claim_event(&self, event_id: &str, event_type: &str) -> LedgerResult<bool>;

    /// Record the processing outcome of a claimed event for audit.
    async fn finish_event(
        &self,
        event_id: &str,
        result: &str,
        error: Option<&str>,
    ) -> LedgerResult<()>;

    /// Append to the payment log; a duplicate event id is a silent no-op.
    async fn append_payment(&self, entry: PaymentLogEntry) -> LedgerResult<()>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    version: i64,
    record: serde_json::Value,
}

/// Postgres-backed store. The record is stored as jsonb alongside the
/// version column the CAS keys on and the customer id used for webhook
/// resolution.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(row: RecordRow) -> LedgerResult<Versioned<SubscriptionRecord>> {
        let record: SubscriptionRecord = serde_json::from_value(row.record)
            .map_err(|e| LedgerError::Database(format!("corrupt record json: {e}")))?;
        Ok(Versioned {
            version: row.version,
            record,
        })
    }

    fn encode(record: &SubscriptionRecord) -> LedgerResult<serde_json::Value> {
        serde_json::to_value(record)
            .map_err(|e| LedgerError::Database(format!("record serialization failed: {e}")))
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn get(&self, user_id: Uuid) -> LedgerResult<Option<Versioned<SubscriptionRecord>>> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT version, record FROM subscription_records WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::decode).transpose()
    }

    async fn insert(
        &self,
        record: SubscriptionRecord,
    ) -> LedgerResult<Versioned<SubscriptionRecord>> {
        let json = Self::encode(&record)?;
        sqlx::query(
            r#"
            INSERT INTO subscription_records (user_id, version, external_customer_id, record, updated_at)
            VALUES ($1, 1, $2, $3, NOW())
            "#,
        )
        .bind(record.user_id)
        .bind(&record.external_customer_id)
        .bind(&json)
        .execute(&self.pool)
        .await?;
        Ok(Versioned { version: 1, record })
    }

    async fn compare_and_swap(
        &self,
        user_id: Uuid,
        expected_version: i64,
        record: SubscriptionRecord,
    ) -> LedgerResult<CasOutcome> {
        let json = Self::encode(&record)?;
        let rows_affected = sqlx::query(
            r#"
            UPDATE subscription_records SET
                version = version + 1,
                external_customer_id = $3,
                record = $4,
                updated_at = NOW()
            WHERE user_id = $1 AND version = $2
            "#,
        )
        .bind(user_id)
        .bind(expected_version)
        .bind(&record.external_customer_id)
        .bind(&json)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            Ok(CasOutcome::Conflict)
        } else {
            Ok(CasOutcome::Committed(expected_version + 1))
        }
    }

    async fn find_user_by_customer(
        &self,
        external_customer_id: &str,
    ) -> LedgerResult<Option<Uuid>> {
        let user_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM subscription_records WHERE external_customer_id = $1",
        )
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }

    async fn claim_event(&self, event_id: &str, event_type: &str) -> LedgerResult<bool> {
        // Only one concurrent delivery can claim processing rights for an
        // event id. An event whose last attempt errored is re-claimable so
        // the provider's redelivery actually reprocesses it.
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_events (event_id, event_type, processing_result, created_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE
                SET processing_result = 'processing', error_message = NULL, processed_at = NULL
                WHERE webhook_events.processing_result = 'error'
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: &str,
        error: Option<&str>,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2, error_message = $3, processed_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_payment(&self, entry: PaymentLogEntry) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_log (event_id, user_id, kind, amount_cents, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&entry.event_id)
        .bind(entry.user_id)
        .bind(entry.kind.as_str())
        .bind(entry.amount_cents)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    records: HashMap<Uuid, (i64, SubscriptionRecord)>,
    events: HashMap<String, (String, Option<String>)>,
    payments: Vec<PaymentLogEntry>,
}

/// In-memory store for tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: all payment log entries recorded so far.
    pub async fn payments(&self) -> Vec<PaymentLogEntry> {
        self.inner.read().await.payments.clone()
    }

    /// Test helper: recorded outcome for an event id, if finished.
    pub async fn event_outcome(&self, event_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .events
            .get(event_id)
            .and_then(|(_, outcome)| outcome.clone())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get(&self, user_id: Uuid) -> LedgerResult<Option<Versioned<SubscriptionRecord>>> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .get(&user_id)
            .map(|(version, record)| Versioned {
                version: *version,
                record: record.clone(),
            }))
    }

    async fn insert(
        &self,
        record: SubscriptionRecord,
    ) -> LedgerResult<Versioned<SubscriptionRecord>> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.user_id) {
            return Err(LedgerError::Database(format!(
                "record already exists for {}",
                record.user_id
            )));
        }
        inner.records.insert(record.user_id, (1, record.clone()));
        Ok(Versioned { version: 1, record })
    }

    async fn compare_and_swap(
        &self,
        user_id: Uuid,
        expected_version: i64,
        record: SubscriptionRecord,
    ) -> LedgerResult<CasOutcome> {
        let mut inner = self.inner.write().await;
        match inner.records.get_mut(&user_id) {
            Some((version, stored)) if *version == expected_version => {
                *version += 1;
                *stored = record;
                Ok(CasOutcome::Committed(expected_version + 1))
            }
            Some(_) => Ok(CasOutcome::Conflict),
            None => Err(LedgerError::NotFound(user_id.to_string())),
        }
    }

    async fn find_user_by_customer(
        &self,
        external_customer_id: &str,
    ) -> LedgerResult<Option<Uuid>> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .iter()
            .find(|(_, (_, r))| {
                r.external_customer_id.as_deref() == Some(external_customer_id)
            })
            .map(|(user_id, _)| *user_id))
    }

    async fn claim_event(&self, event_id: &str, event_type: &str) -> LedgerResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.events.get(event_id) {
            // Errored attempts are re-claimable on redelivery.
            Some((_, Some(outcome))) if outcome.starts_with("error") => {}
            Some(_) => return Ok(false),
            None => {}
        }
        inner
            .events
            .insert(event_id.to_string(), (event_type.to_string(), None));
        Ok(true)
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: &str,
        error: Option<&str>,
    ) -> LedgerResult<()> {
        let mut inner = self.inner.write().await;
        if let Some((_, outcome)) = inner.events.get_mut(event_id) {
            *outcome = Some(match error {
                Some(e) => format!("{result}: {e}"),
                None => result.to_string(),
            });
        }
        Ok(())
    }

    async fn append_payment(&self, entry: PaymentLogEntry) -> LedgerResult<()> {
        let mut inner = self.inner.write().await;
        if inner.payments.iter().any(|p| p.event_id == entry.event_id) {
            return Ok(());
        }
        inner.payments.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_commits_on_matching_version_only() {
        let store = MemoryStore::new();
        let record = SubscriptionRecord::new_free(Uuid::new_v4());
        let user_id = record.user_id;
        store.insert(record.clone()).await.unwrap();

        let outcome = store
            .compare_and_swap(user_id, 1, record.clone())
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Committed(2));

        // Stale version now conflicts.
        let outcome = store.compare_and_swap(user_id, 1, record).await.unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
    }

    #[tokio::test]
    async fn event_claim_is_first_writer_wins() {
        let store = MemoryStore::new();
        assert!(store.claim_event("evt_1", "invoice.paid").await.unwrap());
        assert!(!store.claim_event("evt_1", "invoice.paid").await.unwrap());
        assert!(store.claim_event("evt_2", "invoice.paid").await.unwrap());
    }

    #[tokio::test]
    async fn errored_event_is_reclaimable_on_redelivery() {
        let store = MemoryStore::new();
        assert!(store.claim_event("evt_1", "invoice.paid").await.unwrap());
        store
            .finish_event("evt_1", "error", Some("db unavailable"))
            .await
            .unwrap();

        // Redelivery reprocesses instead of being swallowed as a duplicate.
        assert!(store.claim_event("evt_1", "invoice.paid").await.unwrap());
        store.finish_event("evt_1", "success", None).await.unwrap();
        assert!(!store.claim_event("evt_1", "invoice.paid").await.unwrap());
    }

    #[tokio::test]
    async fn payment_log_dedupes_on_event_id() {
        let store = MemoryStore::new();
        let entry = PaymentLogEntry {
            event_id: "evt_pay".to_string(),
            user_id: Uuid::new_v4(),
            kind: PaymentKind::Payment,
            amount_cents: 2900,
            recorded_at: OffsetDateTime::now_utc(),
        };
        store.append_payment(entry.clone()).await.unwrap();
        store.append_payment(entry).await.unwrap();
        assert_eq!(store.payments().await.len(), 1);
    }

    #[tokio::test]
    async fn customer_lookup_resolves_user() {
        let store = MemoryStore::new();
        let mut record = SubscriptionRecord::new_free(Uuid::new_v4());
        record.external_customer_id = Some("cus_42".to_string());
        let user_id = record.user_id;
        store.insert(record).await.unwrap();

        assert_eq!(
            store.find_user_by_customer("cus_42").await.unwrap(),
            Some(user_id)
        );
        assert_eq!(store.find_user_by_customer("cus_none").await.unwrap(), None);
    }
}
