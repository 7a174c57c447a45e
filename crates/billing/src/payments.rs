//! Payment outcome recording.
//!
//! Payments are mirrored lazily: the first event that references an unknown
//! remote payment intent creates the local row from the provider's canonical
//! object, so a row exists even when the original "payment created"
//! notification was never delivered. Status only moves forward; regressions
//! from out-of-order delivery are ignored.

use std::sync::Arc;

use uuid::Uuid;

use crate::audit::{ActorType, AuditAction, AuditEntryBuilder, AuditLog};
use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::model::{Payment, PaymentStatus};
use crate::provider::ProviderClient;
use crate::state_machine::Trigger;
use crate::store::{PaymentStore, SubscriptionStore, UserDirectory};
use crate::subscriptions::SubscriptionService;

/// Reported outcome of a payment attempt.
#[derive(Debug, Clone)]
pub enum PaymentOutcome {
    Succeeded,
    Failed {
        code: Option<String>,
        message: Option<String>,
    },
}

impl PaymentOutcome {
    fn target_status(&self) -> PaymentStatus {
        match self {
            PaymentOutcome::Succeeded => PaymentStatus::Succeeded,
            PaymentOutcome::Failed { .. } => PaymentStatus::Failed,
        }
    }
}

pub struct PaymentRecorder {
    payments: Arc<dyn PaymentStore>,
    subs: Arc<dyn SubscriptionStore>,
    users: Arc<dyn UserDirectory>,
    provider: Arc<dyn ProviderClient>,
    subscriptions: Arc<SubscriptionService>,
    audit: AuditLog,
}

impl PaymentRecorder {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        subs: Arc<dyn SubscriptionStore>,
        users: Arc<dyn UserDirectory>,
        provider: Arc<dyn ProviderClient>,
        subscriptions: Arc<SubscriptionService>,
        audit: AuditLog,
    ) -> Self {
        Self {
            payments,
            subs,
            users,
            provider,
            subscriptions,
            audit,
        }
    }

    /// Record the outcome of a payment intent and drive the owning
    /// subscription's lifecycle accordingly.
    ///
    /// `subscription_hint` is the remote subscription id carried by the
    /// event, when present; it binds the payment to a subscription and
    /// selects the lifecycle trigger target.
    pub async fn record_outcome(
        &self,
        ctx: &BillingContext,
        remote_payment_intent_id: &str,
        outcome: PaymentOutcome,
        subscription_hint: Option<&str>,
        remote_event_id: Option<&str>,
    ) -> BillingResult<Payment> {
        let subscription = match subscription_hint {
            Some(remote_sub_id) => self.subs.get_by_remote_id(remote_sub_id).await?,
            None => None,
        };

        let mut payment = match self
            .payments
            .get_by_remote_intent_id(remote_payment_intent_id)
            .await?
        {
            Some(existing) => existing,
            None => {
                self.create_pending(ctx, remote_payment_intent_id, subscription.as_ref().map(|s| (s.id, s.user_id)))
                    .await?
            }
        };

        // Bind the subscription link if the creating event lacked it.
        if payment.subscription_id.is_none() {
            if let Some(sub) = &subscription {
                payment.subscription_id = Some(sub.id);
            }
        }

        let target = outcome.target_status();
        let advanced = if payment.status == target {
            tracing::debug!(
                payment_id = %payment.id,
                status = %target,
                "Duplicate payment outcome, nothing to advance"
            );
            false
        } else if payment.status.can_advance_to(target) {
            payment.status = target;
            match &outcome {
                PaymentOutcome::Succeeded => {
                    payment.paid_at = Some(ctx.now);
                    payment.failure_code = None;
                    payment.failure_message = None;
                }
                PaymentOutcome::Failed { code, message } => {
                    payment.failure_code = code.clone();
                    payment.failure_message = message.clone();
                }
            }
            payment.updated_at = ctx.now;
            self.payments.update(&payment).await?;
            true
        } else {
            tracing::debug!(
                payment_id = %payment.id,
                from = %payment.status,
                to = %target,
                "Out-of-order payment outcome ignored (status is forward-only)"
            );
            false
        };

        if advanced {
            if let Some(sub) = &subscription {
                let trigger = match outcome {
                    PaymentOutcome::Succeeded => Trigger::PaymentSucceeded,
                    PaymentOutcome::Failed { .. } => Trigger::PaymentFailed,
                };
                self.subscriptions
                    .apply_trigger_by_id(ctx, sub.id, trigger, remote_event_id)
                    .await?;
            } else {
                tracing::debug!(
                    payment_id = %payment.id,
                    "Payment has no subscription link, no lifecycle trigger"
                );
            }

            let mut builder = AuditEntryBuilder::new(ctx, AuditAction::PaymentRecorded)
                .actor(ActorType::Provider)
                .user(payment.user_id)
                .payment(payment.id)
                .after(serde_json::json!({
                    "status": payment.status.as_str(),
                    "amount_cents": payment.amount_cents,
                    "remote_payment_intent_id": payment.remote_payment_intent_id,
                }));
            if let Some(sub_id) = payment.subscription_id {
                builder = builder.subscription(sub_id);
            }
            if let Some(event_id) = remote_event_id {
                builder = builder.remote_event(event_id);
            }
            self.audit.append(builder.build()).await;
        }

        Ok(payment)
    }

    /// Create the missing local payment from the provider's canonical
    /// object. The unique remote id makes concurrent creation race-safe.
    async fn create_pending(
        &self,
        ctx: &BillingContext,
        remote_payment_intent_id: &str,
        linked: Option<(Uuid, Uuid)>,
    ) -> BillingResult<Payment> {
        let remote = self
            .provider
            .get_payment_intent(remote_payment_intent_id)
            .await?;

        let (subscription_id, user_id) = match linked {
            Some((sub_id, user_id)) => (Some(sub_id), user_id),
            None => {
                let customer = remote.customer.as_deref().ok_or(BillingError::UnknownEntity {
                    entity: "customer",
                    id: remote_payment_intent_id.to_string(),
                })?;
                let user_id = self
                    .users
                    .find_by_remote_customer_id(customer)
                    .await?
                    .ok_or(BillingError::UnknownEntity {
                        entity: "user",
                        id: customer.to_string(),
                    })?;
                (None, user_id)
            }
        };

        let payment = Payment {
            id: Uuid::new_v4(),
            user_id,
            subscription_id,
            amount_cents: remote.amount,
            currency: remote.currency.clone().unwrap_or_else(|| "usd".to_string()),
            status: PaymentStatus::Pending,
            remote_payment_intent_id: remote_payment_intent_id.to_string(),
            failure_code: None,
            failure_message: None,
            paid_at: None,
            refunded_at: None,
            canceled_at: None,
            created_at: ctx.now,
            updated_at: ctx.now,
        };

        let stored = self.payments.insert_if_absent(&payment).await?;

        tracing::info!(
            payment_id = %stored.id,
            remote_payment_intent_id = %remote_payment_intent_id,
            amount_cents = stored.amount_cents,
            "Payment created lazily from remote object"
        );

        Ok(stored)
    }
}
