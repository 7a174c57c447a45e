//! Append-only audit trail.
//!
//! Every state change in the billing core lands here, together with the raw
//! remote event ids needed to reconstruct processing after the fact. Entries
//! are immutable; the dedup claim rows used for event idempotency live in
//! the same store because they are part of the same forensic record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::context::BillingContext;
use crate::store::AuditStore;

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    // Event pipeline
    EventReceived,
    EventProcessed,
    EventFailed,
    EventIgnored,

    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionTransitioned,
    SubscriptionReconciled,
    GracePeriodExpired,
    TierChanged,

    // Money movement mirrors
    PaymentRecorded,
    InvoiceSynced,

    // Collaborator lifecycle
    CustomerSynced,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::EventReceived => "EVENT_RECEIVED",
            AuditAction::EventProcessed => "EVENT_PROCESSED",
            AuditAction::EventFailed => "EVENT_FAILED",
            AuditAction::EventIgnored => "EVENT_IGNORED",
            AuditAction::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            AuditAction::SubscriptionTransitioned => "SUBSCRIPTION_TRANSITIONED",
            AuditAction::SubscriptionReconciled => "SUBSCRIPTION_RECONCILED",
            AuditAction::GracePeriodExpired => "GRACE_PERIOD_EXPIRED",
            AuditAction::TierChanged => "TIER_CHANGED",
            AuditAction::PaymentRecorded => "PAYMENT_RECORDED",
            AuditAction::InvoiceSynced => "INVOICE_SYNCED",
            AuditAction::CustomerSynced => "CUSTOMER_SYNCED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "EVENT_RECEIVED" => Some(AuditAction::EventReceived),
            "EVENT_PROCESSED" => Some(AuditAction::EventProcessed),
            "EVENT_FAILED" => Some(AuditAction::EventFailed),
            "EVENT_IGNORED" => Some(AuditAction::EventIgnored),
            "SUBSCRIPTION_CREATED" => Some(AuditAction::SubscriptionCreated),
            "SUBSCRIPTION_TRANSITIONED" => Some(AuditAction::SubscriptionTransitioned),
            "SUBSCRIPTION_RECONCILED" => Some(AuditAction::SubscriptionReconciled),
            "GRACE_PERIOD_EXPIRED" => Some(AuditAction::GracePeriodExpired),
            "TIER_CHANGED" => Some(AuditAction::TierChanged),
            "PAYMENT_RECORDED" => Some(AuditAction::PaymentRecorded),
            "INVOICE_SYNCED" => Some(AuditAction::InvoiceSynced),
            "CUSTOMER_SYNCED" => Some(AuditAction::CustomerSynced),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who triggered the recorded change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    User,
    Admin,
    System,
    Provider,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Admin => "admin",
            ActorType::System => "system",
            ActorType::Provider => "provider",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ActorType::User),
            "admin" => Some(ActorType::Admin),
            "system" => Some(ActorType::System),
            "provider" => Some(ActorType::Provider),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub actor: ActorType,
    pub remote_event_id: Option<String>,
    pub user_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub detail: serde_json::Value,
    pub correlation_id: Uuid,
    pub created_at: OffsetDateTime,
}

/// Builder for audit entries.
pub struct AuditEntryBuilder {
    entry: AuditEntry,
}

impl AuditEntryBuilder {
    pub fn new(ctx: &BillingContext, action: AuditAction) -> Self {
        Self {
            entry: AuditEntry {
                id: Uuid::new_v4(),
                action,
                actor: ActorType::System,
                remote_event_id: None,
                user_id: None,
                subscription_id: None,
                payment_id: None,
                invoice_id: None,
                before: None,
                after: None,
                detail: serde_json::json!({}),
                correlation_id: ctx.correlation_id,
                created_at: ctx.now,
            },
        }
    }

    pub fn actor(mut self, actor: ActorType) -> Self {
        self.entry.actor = actor;
        self
    }

    pub fn remote_event(mut self, event_id: impl Into<String>) -> Self {
        self.entry.remote_event_id = Some(event_id.into());
        self
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.entry.user_id = Some(user_id);
        self
    }

    pub fn subscription(mut self, subscription_id: Uuid) -> Self {
        self.entry.subscription_id = Some(subscription_id);
        self
    }

    pub fn payment(mut self, payment_id: Uuid) -> Self {
        self.entry.payment_id = Some(payment_id);
        self
    }

    pub fn invoice(mut self, invoice_id: Uuid) -> Self {
        self.entry.invoice_id = Some(invoice_id);
        self
    }

    pub fn before(mut self, snapshot: serde_json::Value) -> Self {
        self.entry.before = Some(snapshot);
        self
    }

    pub fn after(mut self, snapshot: serde_json::Value) -> Self {
        self.entry.after = Some(snapshot);
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.entry.detail = detail;
        self
    }

    pub fn build(self) -> AuditEntry {
        self.entry
    }
}

/// Outcome of an atomic dedup claim for a remote event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller holds exclusive processing rights.
    Claimed,
    /// A previous delivery already completed successfully.
    AlreadyProcessed,
    /// Another worker is processing this event right now.
    InFlight,
}

/// Audit log writer.
///
/// `append` never propagates a failure to the caller: losing an audit entry
/// must not roll back a billing-state transition a user is waiting on. A
/// failed write is reported on the error channel and retried once on a
/// detached task.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Append an entry, absorbing write failures.
    pub async fn append(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append(&entry).await {
            tracing::error!(
                action = %entry.action,
                remote_event_id = ?entry.remote_event_id,
                correlation_id = %entry.correlation_id,
                error = %e,
                "Audit append failed, scheduling async retry"
            );

            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                if let Err(retry_err) = store.append(&entry).await {
                    tracing::error!(
                        action = %entry.action,
                        remote_event_id = ?entry.remote_event_id,
                        correlation_id = %entry.correlation_id,
                        error = %retry_err,
                        "CRITICAL: audit entry lost after retry; manual reconstruction \
                         from provider_events may be required"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_labels_are_stable() {
        assert_eq!(AuditAction::EventReceived.as_str(), "EVENT_RECEIVED");
        assert_eq!(
            AuditAction::SubscriptionTransitioned.as_str(),
            "SUBSCRIPTION_TRANSITIONED"
        );
        assert_eq!(ActorType::Provider.as_str(), "provider");
    }

    #[test]
    fn test_builder_sets_weak_references() {
        let ctx = BillingContext::new();
        let sub_id = Uuid::new_v4();
        let entry = AuditEntryBuilder::new(&ctx, AuditAction::SubscriptionTransitioned)
            .actor(ActorType::Provider)
            .remote_event("evt_1")
            .subscription(sub_id)
            .before(serde_json::json!({"status": "active"}))
            .after(serde_json::json!({"status": "past_due"}))
            .build();

        assert_eq!(entry.actor, ActorType::Provider);
        assert_eq!(entry.remote_event_id.as_deref(), Some("evt_1"));
        assert_eq!(entry.subscription_id, Some(sub_id));
        assert_eq!(entry.correlation_id, ctx.correlation_id);
        assert!(entry.before.is_some() && entry.after.is_some());
    }
}
