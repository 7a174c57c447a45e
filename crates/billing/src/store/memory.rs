//! In-memory store implementations.
//!
//! Single-mutex maps with real compare-and-swap semantics on the version
//! column, so concurrent-writer tests exercise the same conflict behavior
//! the Postgres implementations produce.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{AuditEntry, ClaimOutcome};
use crate::error::{BillingError, BillingResult};
use crate::model::{Invoice, Payment, Subscription};

use super::{AuditStore, InvoiceStore, PaymentStore, SubscriptionStore, UserDirectory};

#[derive(Debug, Clone)]
struct EventClaim {
    event_type: String,
    result: &'static str,
    started_at: OffsetDateTime,
    error_message: Option<String>,
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<Uuid, Subscription>,
    payments: HashMap<Uuid, Payment>,
    invoices: HashMap<String, Invoice>,
    audit: Vec<AuditEntry>,
    claims: HashMap<String, EventClaim>,
    customers: HashMap<String, Uuid>,
}

/// In-memory backing store implementing every repository trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user's provider customer id for directory lookups.
    pub fn register_customer(&self, remote_customer_id: &str, user_id: Uuid) {
        self.lock().customers.insert(remote_customer_id.to_string(), user_id);
    }

    /// All audit entries appended so far, in order.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit.clone()
    }

    /// Recorded dedup state for a remote event id:
    /// `(event_type, processing_result, error_message)`.
    pub fn claim_state(&self, remote_event_id: &str) -> Option<(String, String, Option<String>)> {
        self.lock().claims.get(remote_event_id).map(|claim| {
            (
                claim.event_type.clone(),
                claim.result.to_string(),
                claim.error_message.clone(),
            )
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another test thread panicked mid-write;
        // the data is still the best available view.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn insert(&self, sub: &Subscription) -> BillingResult<()> {
        let mut inner = self.lock();
        if inner
            .subscriptions
            .values()
            .any(|s| s.remote_subscription_id == sub.remote_subscription_id)
        {
            return Err(BillingError::Database(format!(
                "duplicate key: remote_subscription_id {}",
                sub.remote_subscription_id
            )));
        }
        if sub.status.is_billable()
            && inner
                .subscriptions
                .values()
                .any(|s| s.user_id == sub.user_id && s.status.is_billable())
        {
            return Err(BillingError::Database(format!(
                "duplicate key: billable subscription for user {}",
                sub.user_id
            )));
        }
        inner.subscriptions.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.lock().subscriptions.get(&id).cloned())
    }

    async fn get_by_remote_id(&self, remote_id: &str) -> BillingResult<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|s| s.remote_subscription_id == remote_id)
            .cloned())
    }

    async fn find_billable_for_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.status.is_billable())
            .cloned())
    }

    async fn update_with_version_check(
        &self,
        sub: &Subscription,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let mut inner = self.lock();
        match inner.subscriptions.get_mut(&sub.id) {
            Some(stored) if stored.version == expected_version => {
                let mut updated = sub.clone();
                updated.version = expected_version + 1;
                *stored = updated;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::UnknownEntity {
                entity: "subscription",
                id: sub.id.to_string(),
            }),
        }
    }

    async fn list_grace_expired(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let inner = self.lock();
        let mut expired: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|s| {
                s.status == crate::model::SubscriptionStatus::PastDue
                    && s.grace_period_end.is_some_and(|end| end <= now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|s| s.grace_period_end);
        expired.truncate(limit as usize);
        Ok(expired)
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn get_by_remote_intent_id(&self, remote_id: &str) -> BillingResult<Option<Payment>> {
        Ok(self
            .lock()
            .payments
            .values()
            .find(|p| p.remote_payment_intent_id == remote_id)
            .cloned())
    }

    async fn insert_if_absent(&self, payment: &Payment) -> BillingResult<Payment> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .payments
            .values()
            .find(|p| p.remote_payment_intent_id == payment.remote_payment_intent_id)
        {
            return Ok(existing.clone());
        }
        inner.payments.insert(payment.id, payment.clone());
        Ok(payment.clone())
    }

    async fn update(&self, payment: &Payment) -> BillingResult<()> {
        let mut inner = self.lock();
        match inner.payments.get_mut(&payment.id) {
            Some(stored) => {
                *stored = payment.clone();
                Ok(())
            }
            None => Err(BillingError::UnknownEntity {
                entity: "payment",
                id: payment.id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn get_by_remote_id(&self, remote_id: &str) -> BillingResult<Option<Invoice>> {
        Ok(self.lock().invoices.get(remote_id).cloned())
    }

    async fn upsert(&self, invoice: &Invoice) -> BillingResult<()> {
        self.lock()
            .invoices
            .insert(invoice.remote_invoice_id.clone(), invoice.clone());
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, entry: &AuditEntry) -> BillingResult<()> {
        self.lock().audit.push(entry.clone());
        Ok(())
    }

    async fn claim_event(
        &self,
        remote_event_id: &str,
        event_type: &str,
        _event_timestamp: OffsetDateTime,
        stale_after: time::Duration,
    ) -> BillingResult<ClaimOutcome> {
        let mut inner = self.lock();
        let now = OffsetDateTime::now_utc();
        match inner.claims.get_mut(remote_event_id) {
            None => {
                inner.claims.insert(
                    remote_event_id.to_string(),
                    EventClaim {
                        event_type: event_type.to_string(),
                        result: "processing",
                        started_at: now,
                        error_message: None,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
            Some(claim) => match claim.result {
                "success" => Ok(ClaimOutcome::AlreadyProcessed),
                "error" => {
                    claim.result = "processing";
                    claim.started_at = now;
                    Ok(ClaimOutcome::Claimed)
                }
                _ if now - claim.started_at > stale_after => {
                    claim.started_at = now;
                    claim.error_message = Some("recovered from stuck state".to_string());
                    Ok(ClaimOutcome::Claimed)
                }
                _ => Ok(ClaimOutcome::InFlight),
            },
        }
    }

    async fn mark_event_processed(&self, remote_event_id: &str) -> BillingResult<()> {
        if let Some(claim) = self.lock().claims.get_mut(remote_event_id) {
            claim.result = "success";
            claim.error_message = None;
        }
        Ok(())
    }

    async fn mark_event_failed(&self, remote_event_id: &str, error: &str) -> BillingResult<()> {
        if let Some(claim) = self.lock().claims.get_mut(remote_event_id) {
            claim.result = "error";
            claim.error_message = Some(error.to_string());
        }
        Ok(())
    }

    async fn entries_for_event(&self, remote_event_id: &str) -> BillingResult<Vec<AuditEntry>> {
        Ok(self
            .lock()
            .audit
            .iter()
            .filter(|e| e.remote_event_id.as_deref() == Some(remote_event_id))
            .cloned()
            .collect())
    }

    async fn entries_for_subscription(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self
            .lock()
            .audit
            .iter()
            .filter(|e| e.subscription_id == Some(subscription_id))
            .cloned()
            .collect();
        entries.truncate(limit as usize);
        Ok(entries)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_by_remote_customer_id(
        &self,
        remote_customer_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        Ok(self.lock().customers.get(remote_customer_id).copied())
    }
}
