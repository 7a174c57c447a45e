//! Payment-provider interface.
//!
//! The provider is consumed as an opaque remote system: it emits signed
//! events and answers point queries. The domain speaks only to the
//! [`ProviderClient`] trait and the provider-agnostic snapshot types here;
//! the Stripe-backed production implementation lives in `client.rs`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BillingResult;

/// The decoded wire envelope of a provider notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Remote event id, the idempotency key for delivery.
    pub id: String,
    /// Event type string, e.g. `payment.succeeded`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix seconds at which the provider created the event.
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// The affected remote object, decoded per event kind.
    pub object: serde_json::Value,
}

/// Canonical remote view of a subscription.
///
/// Timestamps are unix seconds as the provider reports them; the
/// reconciliation engine converts on merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSubscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub current_period_start: i64,
    pub current_period_end: i64,
    #[serde(default)]
    pub trial_start: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    /// Plan code, e.g. `pro`.
    #[serde(default)]
    pub plan: Option<String>,
    /// Billing interval, `month` or `year`.
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub amount_cents: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Remote view of a payment intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemotePaymentIntent {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    pub status: String,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Remote view of an invoice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteInvoice {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_remaining: i64,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
}

/// Remote view of a customer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A checkout session created at the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

/// Parameters for starting a checkout.
#[derive(Debug, Clone)]
pub struct CheckoutParams {
    pub user_id: uuid::Uuid,
    pub plan: subledger_shared::SubscriptionTier,
    pub interval: crate::model::BillingInterval,
    pub success_url: String,
    pub cancel_url: String,
}

/// Point-query and command interface to the payment provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Fetch the canonical remote subscription object.
    async fn get_subscription(&self, remote_id: &str) -> BillingResult<RemoteSubscription>;

    async fn get_invoice(&self, remote_id: &str) -> BillingResult<RemoteInvoice>;

    async fn get_payment_intent(&self, remote_id: &str) -> BillingResult<RemotePaymentIntent>;

    async fn create_checkout_session(
        &self,
        params: CheckoutParams,
    ) -> BillingResult<RemoteCheckoutSession>;

    /// Cancel at the provider, either immediately or at period end.
    async fn cancel_subscription(
        &self,
        remote_id: &str,
        at_period_end: bool,
    ) -> BillingResult<RemoteSubscription>;

    /// Switch the subscription to a different plan price.
    async fn change_plan(
        &self,
        remote_id: &str,
        new_plan: subledger_shared::SubscriptionTier,
    ) -> BillingResult<RemoteSubscription>;
}
