//! Provider event routing.
//!
//! Maps verified events onto handlers through an enum-keyed dispatch table
//! and enforces at-most-once side effects under at-least-once delivery: a
//! handler only runs after atomically claiming the remote event id in the
//! dedup ledger. Claims whose processing errored are re-claimable on
//! redelivery; claims stuck in-flight past the recovery window are treated
//! as crashed and reprocessed.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use time::OffsetDateTime;

use crate::audit::{ActorType, AuditAction, AuditEntryBuilder, AuditLog, ClaimOutcome};
use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::invoices::InvoiceService;
use crate::model::InvoiceStatus;
use crate::payments::{PaymentOutcome, PaymentRecorder};
use crate::provider::{EventEnvelope, RemoteInvoice, RemotePaymentIntent, RemoteSubscription};
use crate::reconcile::ReconciliationService;
use crate::state_machine::Trigger;
use crate::subscriptions::SubscriptionService;

/// Seconds a handler may run before the delivery is abandoned for retry.
const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 30;

/// Minutes after which a stuck `processing` claim is considered crashed.
const DEFAULT_CLAIM_RECOVERY_MINUTES: i64 = 30;

/// Known provider event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    SubscriptionTrialWillEnd,
    InvoiceCreated,
    InvoiceUpdated,
    InvoicePaid,
    InvoicePaymentFailed,
    CustomerCreated,
    CustomerUpdated,
    CustomerDeleted,
    CheckoutCompleted,
    /// Accepted and recorded, but not handled (forward compatibility).
    Unknown,
}

impl EventKind {
    pub fn from_type_str(kind: &str) -> Self {
        match kind {
            "payment.succeeded" => EventKind::PaymentSucceeded,
            "payment.failed" => EventKind::PaymentFailed,
            "subscription.created" => EventKind::SubscriptionCreated,
            "subscription.updated" => EventKind::SubscriptionUpdated,
            "subscription.deleted" => EventKind::SubscriptionDeleted,
            "subscription.trial_will_end" => EventKind::SubscriptionTrialWillEnd,
            "invoice.created" => EventKind::InvoiceCreated,
            "invoice.updated" => EventKind::InvoiceUpdated,
            "invoice.paid" => EventKind::InvoicePaid,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "customer.created" => EventKind::CustomerCreated,
            "customer.updated" => EventKind::CustomerUpdated,
            "customer.deleted" => EventKind::CustomerDeleted,
            "checkout.completed" => EventKind::CheckoutCompleted,
            _ => EventKind::Unknown,
        }
    }
}

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handler ran and committed.
    Processed,
    /// A previous delivery already completed; no side effects re-ran.
    AlreadyProcessed,
    /// Another worker holds the claim right now.
    InFlight,
    /// Referential failure: recorded and closed out to stop redelivery loops.
    ProcessedWithWarning,
    /// Unknown event kind, accepted as a no-op.
    Ignored,
}

/// Checkout session payload; only the linkage fields matter here.
#[derive(Debug, serde::Deserialize)]
struct CheckoutSessionPayload {
    #[allow(dead_code)]
    id: String,
    #[serde(default)]
    subscription: Option<String>,
}

pub struct EventRouter {
    audit: AuditLog,
    reconciliation: Arc<ReconciliationService>,
    payments: Arc<PaymentRecorder>,
    invoices: Arc<InvoiceService>,
    subscriptions: Arc<SubscriptionService>,
    handler_timeout: std::time::Duration,
    claim_recovery: time::Duration,
}

impl EventRouter {
    pub fn new(
        audit: AuditLog,
        reconciliation: Arc<ReconciliationService>,
        payments: Arc<PaymentRecorder>,
        invoices: Arc<InvoiceService>,
        subscriptions: Arc<SubscriptionService>,
    ) -> Self {
        Self {
            audit,
            reconciliation,
            payments,
            invoices,
            subscriptions,
            handler_timeout: std::time::Duration::from_secs(DEFAULT_HANDLER_TIMEOUT_SECS),
            claim_recovery: time::Duration::minutes(DEFAULT_CLAIM_RECOVERY_MINUTES),
        }
    }

    pub fn with_handler_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Route a verified event.
    ///
    /// Transient handler failures surface as errors so the transport can
    /// signal the provider to redeliver; everything else resolves to a
    /// 2xx-class outcome.
    pub async fn route(
        &self,
        ctx: &BillingContext,
        envelope: &EventEnvelope,
    ) -> BillingResult<RouteOutcome> {
        let event_timestamp =
            OffsetDateTime::from_unix_timestamp(envelope.created).unwrap_or(ctx.now);

        let claim = self
            .audit
            .store()
            .claim_event(
                &envelope.id,
                &envelope.kind,
                event_timestamp,
                self.claim_recovery,
            )
            .await?;

        match claim {
            ClaimOutcome::AlreadyProcessed => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.kind,
                    "Duplicate delivery, already processed"
                );
                return Ok(RouteOutcome::AlreadyProcessed);
            }
            ClaimOutcome::InFlight => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.kind,
                    "Event is being processed by another worker"
                );
                return Ok(RouteOutcome::InFlight);
            }
            ClaimOutcome::Claimed => {}
        }

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.kind,
            "Processing provider event (claimed exclusive rights)"
        );

        let result = match tokio::time::timeout(self.handler_timeout, self.dispatch(ctx, envelope))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BillingError::HandlerTimeout(self.handler_timeout.as_secs())),
        };

        match result {
            Ok(outcome) => {
                self.audit.store().mark_event_processed(&envelope.id).await?;
                Ok(outcome)
            }
            Err(e @ BillingError::UnknownEntity { .. }) => {
                // Referential dead end: the event names an entity neither we
                // nor the provider can resolve. Redelivery cannot fix it, so
                // the event is closed out with a warning and the operator is
                // alerted.
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.kind,
                    error = %e,
                    "Referential failure processing event; closing out with warning"
                );
                self.audit
                    .append(
                        AuditEntryBuilder::new(ctx, AuditAction::EventFailed)
                            .actor(ActorType::Provider)
                            .remote_event(&envelope.id)
                            .detail(serde_json::json!({
                                "event_type": envelope.kind,
                                "error": e.to_string(),
                                "disposition": "processed_with_warning",
                            }))
                            .build(),
                    )
                    .await;
                self.audit.store().mark_event_processed(&envelope.id).await?;
                Ok(RouteOutcome::ProcessedWithWarning)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.kind,
                    error = %e,
                    "Event handler failed"
                );
                self.audit
                    .append(
                        AuditEntryBuilder::new(ctx, AuditAction::EventFailed)
                            .actor(ActorType::Provider)
                            .remote_event(&envelope.id)
                            .detail(serde_json::json!({
                                "event_type": envelope.kind,
                                "error": e.to_string(),
                            }))
                            .build(),
                    )
                    .await;
                self.audit
                    .store()
                    .mark_event_failed(&envelope.id, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        ctx: &BillingContext,
        envelope: &EventEnvelope,
    ) -> BillingResult<RouteOutcome> {
        let event_id = envelope.id.as_str();

        match EventKind::from_type_str(&envelope.kind) {
            EventKind::PaymentSucceeded => {
                let intent: RemotePaymentIntent = decode_object(envelope)?;
                self.payments
                    .record_outcome(
                        ctx,
                        &intent.id,
                        PaymentOutcome::Succeeded,
                        intent.subscription.as_deref(),
                        Some(event_id),
                    )
                    .await?;
            }
            EventKind::PaymentFailed => {
                let intent: RemotePaymentIntent = decode_object(envelope)?;
                self.payments
                    .record_outcome(
                        ctx,
                        &intent.id,
                        PaymentOutcome::Failed {
                            code: intent.failure_code.clone(),
                            message: intent.failure_message.clone(),
                        },
                        intent.subscription.as_deref(),
                        Some(event_id),
                    )
                    .await?;
            }

            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                // The payload may be stale relative to the remote object; it
                // is only trusted for the remote id. Reconciliation fetches
                // the canonical state.
                let sub: RemoteSubscription = decode_object(envelope)?;
                self.reconciliation
                    .reconcile(ctx, &sub.id, Some(event_id))
                    .await?;
            }
            EventKind::SubscriptionDeleted => {
                let sub: RemoteSubscription = decode_object(envelope)?;
                match self
                    .subscriptions
                    .apply_trigger_by_remote_id(
                        ctx,
                        &sub.id,
                        Trigger::CancelRequested,
                        Some(event_id),
                    )
                    .await
                {
                    Ok(_) => {}
                    // Deletion of a subscription we never saw: pull it so the
                    // terminal state lands in local history.
                    Err(BillingError::UnknownEntity { .. }) => {
                        self.reconciliation
                            .reconcile(ctx, &sub.id, Some(event_id))
                            .await?;
                    }
                    // The row is already terminal; a provider-reported
                    // deletion is then a duplicate fact, not a violation.
                    Err(BillingError::InvalidTransition { .. }) => {
                        tracing::info!(
                            remote_subscription_id = %sub.id,
                            "Deletion event for already-terminal subscription"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            EventKind::SubscriptionTrialWillEnd => {
                let sub: RemoteSubscription = decode_object(envelope)?;
                tracing::info!(
                    remote_subscription_id = %sub.id,
                    trial_end = ?sub.trial_end,
                    "Trial ending soon"
                );
                // Dunning/notification content is a collaborator concern;
                // only the fact is recorded here.
                self.audit
                    .append(
                        AuditEntryBuilder::new(ctx, AuditAction::EventIgnored)
                            .actor(ActorType::Provider)
                            .remote_event(event_id)
                            .detail(serde_json::json!({
                                "event_type": envelope.kind,
                                "remote_subscription_id": sub.id,
                                "trial_end": sub.trial_end,
                            }))
                            .build(),
                    )
                    .await;
            }

            EventKind::InvoiceCreated => {
                let invoice: RemoteInvoice = decode_object(envelope)?;
                let status = observed_invoice_status(&invoice, InvoiceStatus::Draft);
                self.invoices
                    .sync_remote(ctx, &invoice, status, Some(event_id))
                    .await?;
            }
            EventKind::InvoiceUpdated => {
                let invoice: RemoteInvoice = decode_object(envelope)?;
                let status = observed_invoice_status(&invoice, InvoiceStatus::Open);
                self.invoices
                    .sync_remote(ctx, &invoice, status, Some(event_id))
                    .await?;
            }
            EventKind::InvoicePaid => {
                let invoice: RemoteInvoice = decode_object(envelope)?;
                self.invoices
                    .sync_remote(ctx, &invoice, InvoiceStatus::Paid, Some(event_id))
                    .await?;
            }
            EventKind::InvoicePaymentFailed => {
                let invoice: RemoteInvoice = decode_object(envelope)?;
                self.invoices
                    .sync_remote(ctx, &invoice, InvoiceStatus::Uncollectible, Some(event_id))
                    .await?;
            }

            EventKind::CustomerCreated | EventKind::CustomerUpdated | EventKind::CustomerDeleted => {
                // Customer provisioning lives outside this subsystem; the
                // fact is audited for traceability only.
                self.audit
                    .append(
                        AuditEntryBuilder::new(ctx, AuditAction::CustomerSynced)
                            .actor(ActorType::Provider)
                            .remote_event(event_id)
                            .detail(serde_json::json!({ "event_type": envelope.kind }))
                            .build(),
                    )
                    .await;
            }

            EventKind::CheckoutCompleted => {
                let session: CheckoutSessionPayload = decode_object(envelope)?;
                match &session.subscription {
                    Some(remote_sub_id) => {
                        self.reconciliation
                            .reconcile(ctx, remote_sub_id, Some(event_id))
                            .await?;
                    }
                    None => {
                        tracing::info!(
                            event_id = %event_id,
                            "Checkout completed without a subscription, nothing to sync"
                        );
                    }
                }
            }

            EventKind::Unknown => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %envelope.kind,
                    "Unhandled provider event type, accepting as no-op"
                );
                self.audit
                    .append(
                        AuditEntryBuilder::new(ctx, AuditAction::EventIgnored)
                            .actor(ActorType::Provider)
                            .remote_event(event_id)
                            .detail(serde_json::json!({ "event_type": envelope.kind }))
                            .build(),
                    )
                    .await;
                return Ok(RouteOutcome::Ignored);
            }
        }

        Ok(RouteOutcome::Processed)
    }
}

fn decode_object<T: DeserializeOwned>(envelope: &EventEnvelope) -> BillingResult<T> {
    serde_json::from_value(envelope.data.object.clone()).map_err(|e| {
        BillingError::EventPayloadInvalid(format!("{} payload: {e}", envelope.kind))
    })
}

fn observed_invoice_status(invoice: &RemoteInvoice, fallback: InvoiceStatus) -> InvoiceStatus {
    invoice
        .status
        .as_deref()
        .and_then(InvoiceStatus::from_str)
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_dispatch_table() {
        assert_eq!(
            EventKind::from_type_str("payment.succeeded"),
            EventKind::PaymentSucceeded
        );
        assert_eq!(
            EventKind::from_type_str("subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(
            EventKind::from_type_str("invoice.payment_failed"),
            EventKind::InvoicePaymentFailed
        );
        assert_eq!(
            EventKind::from_type_str("plan.created"),
            EventKind::Unknown
        );
    }

    #[test]
    fn test_observed_invoice_status_fallback() {
        let mut invoice = RemoteInvoice {
            id: "rin_1".into(),
            ..Default::default()
        };
        assert_eq!(
            observed_invoice_status(&invoice, InvoiceStatus::Draft),
            InvoiceStatus::Draft
        );

        invoice.status = Some("paid".into());
        assert_eq!(
            observed_invoice_status(&invoice, InvoiceStatus::Draft),
            InvoiceStatus::Paid
        );

        invoice.status = Some("mystery".into());
        assert_eq!(
            observed_invoice_status(&invoice, InvoiceStatus::Open),
            InvoiceStatus::Open
        );
    }
}
