// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Service constructors wire many collaborators
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subledger billing reconciliation core.
//!
//! Ingests asynchronous payment-provider notifications, reconciles them
//! against local subscription/payment state, and drives the subscription
//! lifecycle while producing an immutable audit trail.
//!
//! ## Features
//!
//! - **Webhook ingestion**: signature verification and envelope decoding
//! - **Event routing**: enum-keyed dispatch with atomic idempotency claims
//! - **Reconciliation**: remote state is the source of truth, merged under
//!   optimistic concurrency
//! - **Lifecycle state machine**: pure transition logic with explicit time
//! - **Payment recording**: lazy, forward-only payment mirroring
//! - **Grace-period sweep**: time-based expiry racing safely with events
//! - **Audit trail**: append-only record of every state change

pub mod audit;
pub mod client;
pub mod context;
pub mod entitlement;
pub mod error;
pub mod grace;
pub mod invariants;
pub mod invoices;
pub mod model;
pub mod payments;
pub mod provider;
pub mod reconcile;
pub mod router;
pub mod state_machine;
pub mod store;
pub mod subscriptions;
pub mod webhook;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

use sqlx::PgPool;

// Audit
pub use audit::{ActorType, AuditAction, AuditEntry, AuditEntryBuilder, AuditLog, ClaimOutcome};

// Client
pub use client::{PriceIds, ProviderConfig, StripeProviderClient};

// Context
pub use context::BillingContext;

// Entitlement
pub use entitlement::{EntitlementSink, MemoryEntitlementSink, PgEntitlementSink};

// Error
pub use error::{BillingError, BillingResult};

// Grace
pub use grace::GracePeriodMonitor;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::InvoiceService;

// Model
pub use model::{
    BillingInterval, Invoice, InvoiceStatus, Payment, PaymentStatus, Subscription,
    SubscriptionStatus,
};

// Payments
pub use payments::{PaymentOutcome, PaymentRecorder};

// Provider
pub use provider::{
    CheckoutParams, EventEnvelope, ProviderClient, RemoteCheckoutSession, RemoteCustomer,
    RemoteInvoice, RemotePaymentIntent, RemoteSubscription,
};

// Reconcile
pub use reconcile::ReconciliationService;

// Router
pub use router::{EventKind, EventRouter, RouteOutcome};

// State machine
pub use state_machine::{
    apply_trigger, effective_tier, AppliedTransition, LifecycleConfig, Trigger,
};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Store
pub use store::{
    AuditStore, InvoiceStore, MemoryStore, PaymentStore, SubscriptionStore, UserDirectory,
};

// Webhook
pub use webhook::{sign_payload, verify_signature, WebhookIngestor};

/// The repository trait objects a [`BillingService`] is wired over.
#[derive(Clone)]
pub struct BillingStores {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub audit: Arc<dyn AuditStore>,
    pub users: Arc<dyn UserDirectory>,
}

impl BillingStores {
    /// Postgres-backed stores over one pool.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            subscriptions: Arc::new(store::PgSubscriptionStore::new(pool.clone())),
            payments: Arc::new(store::PgPaymentStore::new(pool.clone())),
            invoices: Arc::new(store::PgInvoiceStore::new(pool.clone())),
            audit: Arc::new(store::PgAuditStore::new(pool.clone())),
            users: Arc::new(store::PgUserDirectory::new(pool)),
        }
    }

    /// One shared in-memory store behind every trait, for tests and local
    /// development.
    pub fn in_memory() -> (Self, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new());
        (
            Self {
                subscriptions: memory.clone(),
                payments: memory.clone(),
                invoices: memory.clone(),
                audit: memory.clone(),
                users: memory.clone(),
            },
            memory,
        )
    }
}

/// Main billing service wiring all components.
pub struct BillingService {
    pub subscriptions: Arc<subscriptions::SubscriptionService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub payments: Arc<PaymentRecorder>,
    pub invoices: Arc<InvoiceService>,
    pub grace: GracePeriodMonitor,
    pub webhooks: WebhookIngestor,
    pub audit: AuditLog,
}

impl BillingService {
    /// Wire a service over explicit collaborators.
    pub fn new(
        stores: BillingStores,
        provider: Arc<dyn ProviderClient>,
        entitlements: Arc<dyn EntitlementSink>,
        webhook_secret: String,
        config: LifecycleConfig,
    ) -> Self {
        let audit = AuditLog::new(stores.audit.clone());

        let subscriptions = Arc::new(subscriptions::SubscriptionService::new(
            stores.subscriptions.clone(),
            provider.clone(),
            entitlements.clone(),
            audit.clone(),
            config,
        ));

        let reconciliation = Arc::new(ReconciliationService::new(
            stores.subscriptions.clone(),
            stores.users.clone(),
            provider.clone(),
            entitlements,
            audit.clone(),
            config,
        ));

        let payments = Arc::new(PaymentRecorder::new(
            stores.payments.clone(),
            stores.subscriptions.clone(),
            stores.users.clone(),
            provider,
            subscriptions.clone(),
            audit.clone(),
        ));

        let invoices = Arc::new(InvoiceService::new(
            stores.invoices.clone(),
            stores.subscriptions.clone(),
            stores.users.clone(),
            audit.clone(),
        ));

        let router = Arc::new(EventRouter::new(
            audit.clone(),
            reconciliation.clone(),
            payments.clone(),
            invoices.clone(),
            subscriptions.clone(),
        ));

        let grace = GracePeriodMonitor::new(stores.subscriptions, subscriptions.clone());
        let webhooks = WebhookIngestor::new(webhook_secret, router, audit.clone());

        Self {
            subscriptions,
            reconciliation,
            payments,
            invoices,
            grace,
            webhooks,
            audit,
        }
    }

    /// Create a Postgres + Stripe service from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let provider = StripeProviderClient::from_env()?;
        let webhook_secret = provider.config().webhook_secret.clone();

        let grace_period_days = std::env::var("GRACE_PERIOD_DAYS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(LifecycleConfig::default().grace_period_days);

        let config = LifecycleConfig {
            grace_period_days,
            ..LifecycleConfig::default()
        };

        Ok(Self::new(
            BillingStores::postgres(pool.clone()),
            Arc::new(provider),
            Arc::new(PgEntitlementSink::new(pool)),
            webhook_secret,
            config,
        ))
    }
}
