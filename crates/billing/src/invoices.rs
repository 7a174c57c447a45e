//! Invoice mirroring.
//!
//! Local invoices track the provider's invoice lifecycle for history and
//! grace accounting. Status movement is one-directional; amount fields are
//! last-writer-wins.

use std::sync::Arc;

use uuid::Uuid;

use crate::audit::{ActorType, AuditAction, AuditEntryBuilder, AuditLog};
use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::model::{Invoice, InvoiceStatus};
use crate::provider::RemoteInvoice;
use crate::store::{InvoiceStore, SubscriptionStore, UserDirectory};

pub struct InvoiceService {
    invoices: Arc<dyn InvoiceStore>,
    subs: Arc<dyn SubscriptionStore>,
    users: Arc<dyn UserDirectory>,
    audit: AuditLog,
}

impl InvoiceService {
    pub fn new(
        invoices: Arc<dyn InvoiceStore>,
        subs: Arc<dyn SubscriptionStore>,
        users: Arc<dyn UserDirectory>,
        audit: AuditLog,
    ) -> Self {
        Self {
            invoices,
            subs,
            users,
            audit,
        }
    }

    pub async fn get_by_remote_id(&self, remote_id: &str) -> BillingResult<Option<Invoice>> {
        self.invoices.get_by_remote_id(remote_id).await
    }

    /// Mirror a remote invoice at the given observed status.
    ///
    /// Returns the stored row, or the unchanged existing row when the
    /// observed status would regress a terminal one (out-of-order delivery).
    pub async fn sync_remote(
        &self,
        ctx: &BillingContext,
        remote: &RemoteInvoice,
        observed_status: InvoiceStatus,
        remote_event_id: Option<&str>,
    ) -> BillingResult<Invoice> {
        let existing = self.invoices.get_by_remote_id(&remote.id).await?;

        if let Some(current) = &existing {
            if current.status != observed_status
                && !current.status.can_advance_to(observed_status)
            {
                tracing::debug!(
                    invoice_id = %current.id,
                    from = %current.status,
                    to = %observed_status,
                    "Ignoring invoice status regression"
                );
                return Ok(current.clone());
            }
        }

        let subscription = match &remote.subscription {
            Some(remote_sub_id) => self.subs.get_by_remote_id(remote_sub_id).await?,
            None => None,
        };

        let user_id = match (&existing, &subscription) {
            (Some(inv), _) => inv.user_id,
            (None, Some(sub)) => sub.user_id,
            (None, None) => {
                let customer = remote.customer.as_deref().ok_or(BillingError::UnknownEntity {
                    entity: "customer",
                    id: remote.id.clone(),
                })?;
                self.users
                    .find_by_remote_customer_id(customer)
                    .await?
                    .ok_or(BillingError::UnknownEntity {
                        entity: "user",
                        id: customer.to_string(),
                    })?
            }
        };

        let invoice = Invoice {
            id: existing.as_ref().map(|i| i.id).unwrap_or_else(Uuid::new_v4),
            user_id,
            subscription_id: existing
                .as_ref()
                .and_then(|i| i.subscription_id)
                .or(subscription.as_ref().map(|s| s.id)),
            remote_invoice_id: remote.id.clone(),
            status: observed_status,
            amount_cents: remote.amount_due,
            amount_paid_cents: remote.amount_paid,
            amount_remaining_cents: remote.amount_remaining,
            period_start: remote
                .period_start
                .and_then(|t| time::OffsetDateTime::from_unix_timestamp(t).ok()),
            period_end: remote
                .period_end
                .and_then(|t| time::OffsetDateTime::from_unix_timestamp(t).ok()),
            created_at: existing.as_ref().map(|i| i.created_at).unwrap_or(ctx.now),
            updated_at: ctx.now,
        };

        self.invoices.upsert(&invoice).await?;

        let status_changed = existing
            .as_ref()
            .map(|i| i.status != invoice.status)
            .unwrap_or(true);
        if status_changed {
            tracing::info!(
                invoice_id = %invoice.id,
                remote_invoice_id = %invoice.remote_invoice_id,
                status = %invoice.status,
                "Invoice synced"
            );

            let mut builder = AuditEntryBuilder::new(ctx, AuditAction::InvoiceSynced)
                .actor(ActorType::Provider)
                .user(user_id)
                .invoice(invoice.id)
                .before(
                    existing
                        .as_ref()
                        .map(|i| serde_json::json!({ "status": i.status.as_str() }))
                        .unwrap_or(serde_json::Value::Null),
                )
                .after(serde_json::json!({
                    "status": invoice.status.as_str(),
                    "amount_cents": invoice.amount_cents,
                    "amount_paid_cents": invoice.amount_paid_cents,
                }));
            if let Some(sub_id) = invoice.subscription_id {
                builder = builder.subscription(sub_id);
            }
            if let Some(event_id) = remote_event_id {
                builder = builder.remote_event(event_id);
            }
            self.audit.append(builder.build()).await;
        }

        Ok(invoice)
    }
}
