//! Postgres store implementations.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use subledger_shared::SubscriptionTier;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditAction, AuditEntry, ClaimOutcome};
use crate::error::{BillingError, BillingResult};
use crate::model::{
    BillingInterval, Invoice, InvoiceStatus, Payment, PaymentStatus, Subscription,
    SubscriptionStatus,
};

use super::{AuditStore, InvoiceStore, PaymentStore, SubscriptionStore, UserDirectory};

fn decode_err(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::Decode(format!("unrecognized {column}: {value}").into())
}

impl<'r> sqlx::FromRow<'r, PgRow> for Subscription {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let plan: String = row.try_get("plan")?;
        let interval: String = row.try_get("billing_interval")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            status: SubscriptionStatus::from_str(&status)
                .ok_or_else(|| decode_err("status", &status))?,
            plan: SubscriptionTier::from_str(&plan).ok_or_else(|| decode_err("plan", &plan))?,
            interval: BillingInterval::from_str(&interval)
                .ok_or_else(|| decode_err("billing_interval", &interval))?,
            amount_cents: row.try_get("amount_cents")?,
            currency: row.try_get("currency")?,
            remote_subscription_id: row.try_get("remote_subscription_id")?,
            remote_customer_id: row.try_get("remote_customer_id")?,
            failed_payment_count: row.try_get("failed_payment_count")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            trial_start: row.try_get("trial_start")?,
            trial_end: row.try_get("trial_end")?,
            grace_period_end: row.try_get("grace_period_end")?,
            canceled_at: row.try_get("canceled_at")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Payment {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            subscription_id: row.try_get("subscription_id")?,
            amount_cents: row.try_get("amount_cents")?,
            currency: row.try_get("currency")?,
            status: PaymentStatus::from_str(&status).ok_or_else(|| decode_err("status", &status))?,
            remote_payment_intent_id: row.try_get("remote_payment_intent_id")?,
            failure_code: row.try_get("failure_code")?,
            failure_message: row.try_get("failure_message")?,
            paid_at: row.try_get("paid_at")?,
            refunded_at: row.try_get("refunded_at")?,
            canceled_at: row.try_get("canceled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Invoice {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            subscription_id: row.try_get("subscription_id")?,
            remote_invoice_id: row.try_get("remote_invoice_id")?,
            status: InvoiceStatus::from_str(&status).ok_or_else(|| decode_err("status", &status))?,
            amount_cents: row.try_get("amount_cents")?,
            amount_paid_cents: row.try_get("amount_paid_cents")?,
            amount_remaining_cents: row.try_get("amount_remaining_cents")?,
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for AuditEntry {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let action: String = row.try_get("action")?;
        let actor: String = row.try_get("actor_type")?;
        Ok(Self {
            id: row.try_get("id")?,
            action: AuditAction::from_str(&action).ok_or_else(|| decode_err("action", &action))?,
            actor: ActorType::from_str(&actor).ok_or_else(|| decode_err("actor_type", &actor))?,
            remote_event_id: row.try_get("remote_event_id")?,
            user_id: row.try_get("user_id")?,
            subscription_id: row.try_get("subscription_id")?,
            payment_id: row.try_get("payment_id")?,
            invoice_id: row.try_get("invoice_id")?,
            before: row.try_get("before_state")?,
            after: row.try_get("after_state")?,
            detail: row.try_get("detail")?,
            correlation_id: row.try_get("correlation_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Postgres-backed subscription store.
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn insert(&self, sub: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, status, plan, billing_interval, amount_cents, currency,
                remote_subscription_id, remote_customer_id, failed_payment_count,
                cancel_at_period_end, current_period_start, current_period_end,
                trial_start, trial_end, grace_period_end, canceled_at,
                version, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20
            )
            "#,
        )
        .bind(sub.id)
        .bind(sub.user_id)
        .bind(sub.status.as_str())
        .bind(sub.plan.as_str())
        .bind(sub.interval.as_str())
        .bind(sub.amount_cents)
        .bind(&sub.currency)
        .bind(&sub.remote_subscription_id)
        .bind(&sub.remote_customer_id)
        .bind(sub.failed_payment_count)
        .bind(sub.cancel_at_period_end)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .bind(sub.grace_period_end)
        .bind(sub.canceled_at)
        .bind(sub.version)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sub)
    }

    async fn get_by_remote_id(&self, remote_id: &str) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE remote_subscription_id = $1",
        )
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn find_billable_for_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1 AND status IN ('active', 'trialing', 'past_due')
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn update_with_version_check(
        &self,
        sub: &Subscription,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = $1,
                plan = $2,
                billing_interval = $3,
                amount_cents = $4,
                currency = $5,
                remote_customer_id = $6,
                failed_payment_count = $7,
                cancel_at_period_end = $8,
                current_period_start = $9,
                current_period_end = $10,
                trial_start = $11,
                trial_end = $12,
                grace_period_end = $13,
                canceled_at = $14,
                version = version + 1,
                updated_at = $15
            WHERE id = $16 AND version = $17
            "#,
        )
        .bind(sub.status.as_str())
        .bind(sub.plan.as_str())
        .bind(sub.interval.as_str())
        .bind(sub.amount_cents)
        .bind(&sub.currency)
        .bind(&sub.remote_customer_id)
        .bind(sub.failed_payment_count)
        .bind(sub.cancel_at_period_end)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .bind(sub.grace_period_end)
        .bind(sub.canceled_at)
        .bind(sub.updated_at)
        .bind(sub.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_grace_expired(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'past_due' AND grace_period_end <= $1
            ORDER BY grace_period_end ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }
}

/// Postgres-backed payment store.
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn get_by_remote_intent_id(&self, remote_id: &str) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE remote_payment_intent_id = $1",
        )
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn insert_if_absent(&self, payment: &Payment) -> BillingResult<Payment> {
        // The unique index on remote_payment_intent_id makes concurrent lazy
        // creation race-safe: the loser reads back the winner's row.
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, user_id, subscription_id, amount_cents, currency, status,
                remote_payment_intent_id, failure_code, failure_message,
                paid_at, refunded_at, canceled_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (remote_payment_intent_id) DO NOTHING
            "#,
        )
        .bind(payment.id)
        .bind(payment.user_id)
        .bind(payment.subscription_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(&payment.remote_payment_intent_id)
        .bind(&payment.failure_code)
        .bind(&payment.failure_message)
        .bind(payment.paid_at)
        .bind(payment.refunded_at)
        .bind(payment.canceled_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;

        let stored = self
            .get_by_remote_intent_id(&payment.remote_payment_intent_id)
            .await?
            .ok_or_else(|| BillingError::UnknownEntity {
                entity: "payment",
                id: payment.remote_payment_intent_id.clone(),
            })?;
        Ok(stored)
    }

    async fn update(&self, payment: &Payment) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE payments SET
                subscription_id = $1,
                amount_cents = $2,
                status = $3,
                failure_code = $4,
                failure_message = $5,
                paid_at = $6,
                refunded_at = $7,
                canceled_at = $8,
                updated_at = $9
            WHERE id = $10
            "#,
        )
        .bind(payment.subscription_id)
        .bind(payment.amount_cents)
        .bind(payment.status.as_str())
        .bind(&payment.failure_code)
        .bind(&payment.failure_message)
        .bind(payment.paid_at)
        .bind(payment.refunded_at)
        .bind(payment.canceled_at)
        .bind(payment.updated_at)
        .bind(payment.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Postgres-backed invoice store.
pub struct PgInvoiceStore {
    pool: PgPool,
}

impl PgInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvoiceStore for PgInvoiceStore {
    async fn get_by_remote_id(&self, remote_id: &str) -> BillingResult<Option<Invoice>> {
        let invoice =
            sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE remote_invoice_id = $1")
                .bind(remote_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(invoice)
    }

    async fn upsert(&self, invoice: &Invoice) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, user_id, subscription_id, remote_invoice_id, status,
                amount_cents, amount_paid_cents, amount_remaining_cents,
                period_start, period_end, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (remote_invoice_id) DO UPDATE SET
                subscription_id = EXCLUDED.subscription_id,
                status = EXCLUDED.status,
                amount_cents = EXCLUDED.amount_cents,
                amount_paid_cents = EXCLUDED.amount_paid_cents,
                amount_remaining_cents = EXCLUDED.amount_remaining_cents,
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.user_id)
        .bind(invoice.subscription_id)
        .bind(&invoice.remote_invoice_id)
        .bind(invoice.status.as_str())
        .bind(invoice.amount_cents)
        .bind(invoice.amount_paid_cents)
        .bind(invoice.amount_remaining_cents)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Postgres-backed audit store and event dedup ledger.
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, entry: &AuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, action, actor_type, remote_event_id, user_id,
                subscription_id, payment_id, invoice_id,
                before_state, after_state, detail, correlation_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(entry.action.as_str())
        .bind(entry.actor.as_str())
        .bind(&entry.remote_event_id)
        .bind(entry.user_id)
        .bind(entry.subscription_id)
        .bind(entry.payment_id)
        .bind(entry.invoice_id)
        .bind(&entry.before)
        .bind(&entry.after)
        .bind(&entry.detail)
        .bind(entry.correlation_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_event(
        &self,
        remote_event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
        stale_after: time::Duration,
    ) -> BillingResult<ClaimOutcome> {
        // INSERT...ON CONFLICT...RETURNING claims exclusive processing rights
        // atomically: only one concurrent delivery gets a row back. Claims
        // whose previous run errored are re-claimable (the provider keeps
        // redelivering until we succeed), as are claims stuck in
        // 'processing' past the recovery window.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO provider_events
                (remote_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (remote_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE provider_events.processing_result = 'error'
               OR (provider_events.processing_result = 'processing'
                   AND provider_events.processing_started_at < NOW() - make_interval(secs => $4))
            RETURNING id
            "#,
        )
        .bind(remote_event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(stale_after.as_seconds_f64())
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM provider_events WHERE remote_event_id = $1",
        )
        .bind(remote_event_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing.as_ref().map(|(s,)| s.as_str()) {
            Some("success") => Ok(ClaimOutcome::AlreadyProcessed),
            _ => Ok(ClaimOutcome::InFlight),
        }
    }

    async fn mark_event_processed(&self, remote_event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE provider_events
            SET processing_result = 'success', error_message = NULL
            WHERE remote_event_id = $1
            "#,
        )
        .bind(remote_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_event_failed(&self, remote_event_id: &str, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE provider_events
            SET processing_result = 'error', error_message = $2
            WHERE remote_event_id = $1
            "#,
        )
        .bind(remote_event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entries_for_event(&self, remote_event_id: &str) -> BillingResult<Vec<AuditEntry>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT * FROM audit_log
            WHERE remote_event_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(remote_event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn entries_for_subscription(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<AuditEntry>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT * FROM audit_log
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

/// Postgres-backed customer-to-user lookup.
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_remote_customer_id(
        &self,
        remote_customer_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let result: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE remote_customer_id = $1")
                .bind(remote_customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.map(|(id,)| id))
    }
}
