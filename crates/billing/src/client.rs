//! Stripe client wrapper.
//!
//! Production implementation of [`ProviderClient`] over async-stripe. All
//! SDK types stop here: the rest of the crate sees only the provider-agnostic
//! snapshot types.

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, Invoice, PaymentIntent, Subscription, UpdateSubscription,
    UpdateSubscriptionItems,
};
use subledger_shared::SubscriptionTier;

use crate::error::{BillingError, BillingResult};
use crate::model::BillingInterval;
use crate::provider::{
    CheckoutParams, ProviderClient, RemoteCheckoutSession, RemoteInvoice, RemotePaymentIntent,
    RemoteSubscription,
};

/// Stripe configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
}

/// Price ids per paid tier and interval.
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub starter_monthly: Option<String>,
    pub starter_annual: Option<String>,
    pub pro_monthly: Option<String>,
    pub pro_annual: Option<String>,
    pub team_monthly: Option<String>,
    pub team_annual: Option<String>,
}

impl PriceIds {
    pub fn price_id_for(
        &self,
        tier: SubscriptionTier,
        interval: BillingInterval,
    ) -> Option<&String> {
        match (tier, interval) {
            (SubscriptionTier::Starter, BillingInterval::Month) => self.starter_monthly.as_ref(),
            (SubscriptionTier::Starter, BillingInterval::Year) => self.starter_annual.as_ref(),
            (SubscriptionTier::Pro, BillingInterval::Month) => self.pro_monthly.as_ref(),
            (SubscriptionTier::Pro, BillingInterval::Year) => self.pro_annual.as_ref(),
            (SubscriptionTier::Team, BillingInterval::Month) => self.team_monthly.as_ref(),
            (SubscriptionTier::Team, BillingInterval::Year) => self.team_annual.as_ref(),
            (SubscriptionTier::Free, _) => None,
        }
    }

    pub fn tier_for_price_id(&self, price_id: &str) -> Option<SubscriptionTier> {
        let matches = |candidate: &Option<String>| candidate.as_deref() == Some(price_id);
        if matches(&self.starter_monthly) || matches(&self.starter_annual) {
            Some(SubscriptionTier::Starter)
        } else if matches(&self.pro_monthly) || matches(&self.pro_annual) {
            Some(SubscriptionTier::Pro)
        } else if matches(&self.team_monthly) || matches(&self.team_annual) {
            Some(SubscriptionTier::Team)
        } else {
            None
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY must be set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET must be set".into()))?;

        let price = |name: &str| std::env::var(name).ok();
        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids: PriceIds {
                starter_monthly: price("STRIPE_PRICE_STARTER_MONTHLY"),
                starter_annual: price("STRIPE_PRICE_STARTER_ANNUAL"),
                pro_monthly: price("STRIPE_PRICE_PRO_MONTHLY"),
                pro_annual: price("STRIPE_PRICE_PRO_ANNUAL"),
                team_monthly: price("STRIPE_PRICE_TEAM_MONTHLY"),
                team_annual: price("STRIPE_PRICE_TEAM_ANNUAL"),
            },
        })
    }
}

/// Stripe-backed provider client.
#[derive(Clone)]
pub struct StripeProviderClient {
    client: stripe::Client,
    config: ProviderConfig,
}

impl StripeProviderClient {
    pub fn new(config: ProviderConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(ProviderConfig::from_env()?))
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn map_subscription(&self, sub: &Subscription) -> RemoteSubscription {
        let status = match sub.status {
            stripe::SubscriptionStatus::Incomplete => "incomplete",
            stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            stripe::SubscriptionStatus::Trialing => "trialing",
            stripe::SubscriptionStatus::Active => "active",
            stripe::SubscriptionStatus::PastDue => "past_due",
            stripe::SubscriptionStatus::Canceled => "canceled",
            stripe::SubscriptionStatus::Unpaid => "unpaid",
            stripe::SubscriptionStatus::Paused => "paused",
        };

        let customer = match &sub.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        let price = sub.items.data.first().and_then(|item| item.price.as_ref());

        let plan = sub
            .metadata
            .get("plan")
            .cloned()
            .or_else(|| {
                price
                    .map(|p| p.id.to_string())
                    .and_then(|id| self.config.price_ids.tier_for_price_id(&id))
                    .map(|t| t.as_str().to_string())
            })
            .or_else(|| price.and_then(|p| p.nickname.clone()));

        let interval = price
            .and_then(|p| p.recurring.as_ref())
            .map(|r| match r.interval {
                stripe::RecurringInterval::Year => "year".to_string(),
                _ => "month".to_string(),
            });

        RemoteSubscription {
            id: sub.id.to_string(),
            customer,
            status: status.to_string(),
            cancel_at_period_end: sub.cancel_at_period_end,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            trial_start: sub.trial_start,
            trial_end: sub.trial_end,
            canceled_at: sub.canceled_at,
            plan,
            interval,
            amount_cents: price.and_then(|p| p.unit_amount),
            currency: price.and_then(|p| p.currency.as_ref().map(|c| c.to_string())),
            metadata: sub.metadata.clone(),
        }
    }

    fn map_invoice(invoice: &Invoice) -> RemoteInvoice {
        let customer = invoice.customer.as_ref().map(|c| match c {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        });
        let subscription = invoice.subscription.as_ref().map(|s| match s {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(s) => s.id.to_string(),
        });
        let status = invoice.status.map(|s| {
            match s {
                stripe::InvoiceStatus::Draft => "draft",
                stripe::InvoiceStatus::Open => "open",
                stripe::InvoiceStatus::Paid => "paid",
                stripe::InvoiceStatus::Uncollectible => "uncollectible",
                stripe::InvoiceStatus::Void => "void",
            }
            .to_string()
        });

        RemoteInvoice {
            id: invoice.id.to_string(),
            customer,
            subscription,
            status,
            amount_due: invoice.amount_due.unwrap_or(0),
            amount_paid: invoice.amount_paid.unwrap_or(0),
            amount_remaining: invoice.amount_remaining.unwrap_or(0),
            period_start: invoice.period_start,
            period_end: invoice.period_end,
        }
    }

    fn map_payment_intent(intent: &PaymentIntent) -> RemotePaymentIntent {
        let status = match intent.status {
            stripe::PaymentIntentStatus::Succeeded => "succeeded",
            stripe::PaymentIntentStatus::Canceled => "canceled",
            stripe::PaymentIntentStatus::Processing => "processing",
            stripe::PaymentIntentStatus::RequiresPaymentMethod => "requires_payment_method",
            stripe::PaymentIntentStatus::RequiresConfirmation => "requires_confirmation",
            stripe::PaymentIntentStatus::RequiresAction => "requires_action",
            stripe::PaymentIntentStatus::RequiresCapture => "requires_capture",
        };

        let customer = intent.customer.as_ref().map(|c| match c {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        });

        RemotePaymentIntent {
            id: intent.id.to_string(),
            customer,
            amount: intent.amount,
            currency: Some(intent.currency.to_string()),
            status: status.to_string(),
            subscription: None,
            failure_code: None,
            failure_message: intent
                .last_payment_error
                .as_ref()
                .and_then(|e| e.message.clone()),
            metadata: HashMap::new(),
        }
    }
}

#[async_trait]
impl ProviderClient for StripeProviderClient {
    async fn get_subscription(&self, remote_id: &str) -> BillingResult<RemoteSubscription> {
        let sub_id = remote_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Provider(format!("invalid subscription id: {e}")))?;
        let sub = Subscription::retrieve(&self.client, &sub_id, &[]).await?;
        Ok(self.map_subscription(&sub))
    }

    async fn get_invoice(&self, remote_id: &str) -> BillingResult<RemoteInvoice> {
        let invoice_id = remote_id
            .parse::<stripe::InvoiceId>()
            .map_err(|e| BillingError::Provider(format!("invalid invoice id: {e}")))?;
        let invoice = Invoice::retrieve(&self.client, &invoice_id, &[]).await?;
        Ok(Self::map_invoice(&invoice))
    }

    async fn get_payment_intent(&self, remote_id: &str) -> BillingResult<RemotePaymentIntent> {
        let intent_id = remote_id
            .parse::<stripe::PaymentIntentId>()
            .map_err(|e| BillingError::Provider(format!("invalid payment intent id: {e}")))?;
        let intent = PaymentIntent::retrieve(&self.client, &intent_id, &[]).await?;
        Ok(Self::map_payment_intent(&intent))
    }

    async fn create_checkout_session(
        &self,
        params: CheckoutParams,
    ) -> BillingResult<RemoteCheckoutSession> {
        let price_id = self
            .config
            .price_ids
            .price_id_for(params.plan, params.interval)
            .ok_or_else(|| {
                BillingError::Config(format!(
                    "no price configured for {} {}",
                    params.plan,
                    params.interval.as_str()
                ))
            })?
            .clone();

        let mut create = CreateCheckoutSession::new();
        create.mode = Some(CheckoutSessionMode::Subscription);
        create.success_url = Some(&params.success_url);
        create.cancel_url = Some(&params.cancel_url);
        create.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }]);
        create.metadata = Some(HashMap::from([
            ("user_id".to_string(), params.user_id.to_string()),
            ("plan".to_string(), params.plan.as_str().to_string()),
        ]));

        let session = CheckoutSession::create(&self.client, create).await?;

        tracing::info!(
            session_id = %session.id,
            user_id = %params.user_id,
            plan = %params.plan,
            "Created checkout session"
        );

        Ok(RemoteCheckoutSession {
            id: session.id.to_string(),
            url: session.url.clone(),
        })
    }

    async fn cancel_subscription(
        &self,
        remote_id: &str,
        at_period_end: bool,
    ) -> BillingResult<RemoteSubscription> {
        let sub_id = remote_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Provider(format!("invalid subscription id: {e}")))?;

        let sub = if at_period_end {
            let mut update = UpdateSubscription::new();
            update.cancel_at_period_end = Some(true);
            Subscription::update(&self.client, &sub_id, update).await?
        } else {
            Subscription::cancel(&self.client, &sub_id, CancelSubscription::default()).await?
        };

        tracing::info!(
            subscription_id = %sub.id,
            at_period_end = at_period_end,
            "Cancelled subscription at provider"
        );

        Ok(self.map_subscription(&sub))
    }

    async fn change_plan(
        &self,
        remote_id: &str,
        new_plan: SubscriptionTier,
    ) -> BillingResult<RemoteSubscription> {
        let sub_id = remote_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Provider(format!("invalid subscription id: {e}")))?;

        let current = Subscription::retrieve(&self.client, &sub_id, &[]).await?;

        let interval = current
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .and_then(|p| p.recurring.as_ref())
            .map(|r| match r.interval {
                stripe::RecurringInterval::Year => BillingInterval::Year,
                _ => BillingInterval::Month,
            })
            .unwrap_or(BillingInterval::Month);

        let price_id = self
            .config
            .price_ids
            .price_id_for(new_plan, interval)
            .ok_or_else(|| {
                BillingError::Config(format!(
                    "no price configured for {} {}",
                    new_plan,
                    interval.as_str()
                ))
            })?
            .clone();

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::Provider(format!("subscription {remote_id} has no items"))
            })?;

        let mut update = UpdateSubscription::new();
        update.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item_id),
            price: Some(price_id),
            ..Default::default()
        }]);

        let updated = Subscription::update(&self.client, &sub_id, update).await?;

        tracing::info!(
            subscription_id = %updated.id,
            new_plan = %new_plan,
            "Changed subscription plan at provider"
        );

        Ok(self.map_subscription(&updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_ids() -> PriceIds {
        PriceIds {
            pro_monthly: Some("price_pro_m".to_string()),
            pro_annual: Some("price_pro_y".to_string()),
            team_monthly: Some("price_team_m".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_tier_for_price_id() {
        let ids = price_ids();
        assert_eq!(
            ids.tier_for_price_id("price_pro_m"),
            Some(SubscriptionTier::Pro)
        );
        assert_eq!(
            ids.tier_for_price_id("price_pro_y"),
            Some(SubscriptionTier::Pro)
        );
        assert_eq!(
            ids.tier_for_price_id("price_team_m"),
            Some(SubscriptionTier::Team)
        );
        assert_eq!(ids.tier_for_price_id("price_unknown"), None);
    }

    #[test]
    fn test_price_id_lookup() {
        let ids = price_ids();
        assert_eq!(
            ids.price_id_for(SubscriptionTier::Pro, BillingInterval::Month),
            Some(&"price_pro_m".to_string())
        );
        assert_eq!(
            ids.price_id_for(SubscriptionTier::Free, BillingInterval::Month),
            None
        );
        assert_eq!(
            ids.price_id_for(SubscriptionTier::Starter, BillingInterval::Month),
            None
        );
    }
}
