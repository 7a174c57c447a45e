//! Entity persistence interfaces.
//!
//! Repository traits decouple the state machine and handlers from the
//! backing store. The Postgres implementations are the production path; the
//! in-memory implementations back the concurrency and idempotency tests with
//! genuine compare-and-swap semantics.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{AuditEntry, ClaimOutcome};
use crate::error::BillingResult;
use crate::model::{Invoice, Payment, Subscription};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgAuditStore, PgInvoiceStore, PgPaymentStore, PgSubscriptionStore, PgUserDirectory};

/// Subscription persistence.
///
/// `update_with_version_check` is the only mutation path: the write matches
/// zero rows when a concurrent writer advanced the version first, and the
/// caller re-reads and retries.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert(&self, sub: &Subscription) -> BillingResult<()>;

    async fn get(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn get_by_remote_id(&self, remote_id: &str) -> BillingResult<Option<Subscription>>;

    /// The user's subscription in a billable state (active/trialing/past_due),
    /// if any. At most one exists by invariant.
    async fn find_billable_for_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Persist `sub` if the stored version still equals `expected_version`,
    /// advancing the version by one. Returns false when a concurrent writer
    /// won.
    async fn update_with_version_check(
        &self,
        sub: &Subscription,
        expected_version: i64,
    ) -> BillingResult<bool>;

    /// Past-due subscriptions whose grace window elapsed at or before `now`.
    async fn list_grace_expired(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;
}

/// Payment persistence. Upserts are keyed by the unique remote payment
/// intent id so redelivered creation events cannot duplicate rows.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get_by_remote_intent_id(&self, remote_id: &str) -> BillingResult<Option<Payment>>;

    /// Insert unless a row with the same remote intent id exists; returns the
    /// row that won (the inserted one or the pre-existing one).
    async fn insert_if_absent(&self, payment: &Payment) -> BillingResult<Payment>;

    async fn update(&self, payment: &Payment) -> BillingResult<()>;
}

/// Invoice persistence, upsert-by-remote-id.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get_by_remote_id(&self, remote_id: &str) -> BillingResult<Option<Invoice>>;

    async fn upsert(&self, invoice: &Invoice) -> BillingResult<()>;
}

/// Audit trail plus the event dedup ledger.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> BillingResult<()>;

    /// Atomically claim exclusive processing rights for a remote event id.
    ///
    /// A fresh id is claimed outright. An id whose previous processing ended
    /// in error is re-claimable (the provider redelivers until we succeed),
    /// as is one stuck in `processing` longer than `stale_after` (a crashed
    /// or timed-out handler never marked a terminal result).
    async fn claim_event(
        &self,
        remote_event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
        stale_after: time::Duration,
    ) -> BillingResult<ClaimOutcome>;

    async fn mark_event_processed(&self, remote_event_id: &str) -> BillingResult<()>;

    async fn mark_event_failed(&self, remote_event_id: &str, error: &str) -> BillingResult<()>;

    async fn entries_for_event(&self, remote_event_id: &str) -> BillingResult<Vec<AuditEntry>>;

    async fn entries_for_subscription(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<AuditEntry>>;
}

/// Lookup of local users by their provider customer id.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_remote_customer_id(
        &self,
        remote_customer_id: &str,
    ) -> BillingResult<Option<Uuid>>;
}
