//! Remote-state reconciliation.
//!
//! The provider is the source of truth for subscription status, period
//! boundaries, and price. Event handlers never trust the event payload
//! beyond the remote id: this engine fetches the canonical object and merges
//! it field-by-field into the local row under the optimistic version check,
//! so a delayed or stale event can never regress local state behind a
//! fresher remote snapshot.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use uuid::Uuid;

use crate::audit::{ActorType, AuditAction, AuditEntryBuilder, AuditLog};
use crate::context::BillingContext;
use crate::entitlement::EntitlementSink;
use crate::error::{BillingError, BillingResult};
use crate::model::{BillingInterval, Subscription, SubscriptionStatus};
use crate::provider::{ProviderClient, RemoteSubscription};
use crate::state_machine::{effective_tier, LifecycleConfig};
use crate::store::{SubscriptionStore, UserDirectory};
use subledger_shared::SubscriptionTier;

const MAX_MERGE_RETRIES: usize = 3;

pub struct ReconciliationService {
    subs: Arc<dyn SubscriptionStore>,
    users: Arc<dyn UserDirectory>,
    provider: Arc<dyn ProviderClient>,
    entitlements: Arc<dyn EntitlementSink>,
    audit: AuditLog,
    config: LifecycleConfig,
}

impl ReconciliationService {
    pub fn new(
        subs: Arc<dyn SubscriptionStore>,
        users: Arc<dyn UserDirectory>,
        provider: Arc<dyn ProviderClient>,
        entitlements: Arc<dyn EntitlementSink>,
        audit: AuditLog,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            subs,
            users,
            provider,
            entitlements,
            audit,
            config,
        }
    }

    /// Pull the canonical remote subscription and merge it into the local
    /// record, creating the record on first sight. Returns the reconciled
    /// local snapshot.
    pub async fn reconcile(
        &self,
        ctx: &BillingContext,
        remote_subscription_id: &str,
        remote_event_id: Option<&str>,
    ) -> BillingResult<Subscription> {
        let remote = self.provider.get_subscription(remote_subscription_id).await?;

        let mut delays = ExponentialBackoff::from_millis(2)
            .factor(25)
            .map(jitter)
            .take(MAX_MERGE_RETRIES);

        loop {
            match self.subs.get_by_remote_id(remote_subscription_id).await? {
                None => {
                    match self.create_from_remote(ctx, &remote, remote_event_id).await {
                        Ok(created) => return Ok(created),
                        // A concurrent delivery created the row first; fall
                        // through to the merge path with a fresh read.
                        Err(BillingError::Database(msg)) if msg.contains("duplicate key") => {
                            tracing::debug!(
                                remote_subscription_id = %remote_subscription_id,
                                "Lost creation race, merging instead"
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                Some(local) => {
                    let merged = self.merge(ctx, &local, &remote);
                    if !Self::differs(&local, &merged) {
                        return Ok(local);
                    }

                    if self
                        .subs
                        .update_with_version_check(&merged, local.version)
                        .await?
                    {
                        self.finish_merge(ctx, &local, &merged, remote_event_id).await;
                        return self
                            .subs
                            .get(local.id)
                            .await?
                            .ok_or(BillingError::UnknownEntity {
                                entity: "subscription",
                                id: local.id.to_string(),
                            });
                    }

                    tracing::debug!(
                        subscription_id = %local.id,
                        version = local.version,
                        "Reconcile lost version race, re-reading"
                    );
                }
            }

            match delays.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(BillingError::RetriesExhausted(format!(
                        "reconcile {remote_subscription_id}"
                    )))
                }
            }
        }
    }

    /// Resolve the owning local user for a remote subscription.
    ///
    /// Checkout flows stamp `user_id` into the remote metadata; older
    /// subscriptions are resolved through the customer directory. Failing
    /// both is the referential error case of the error taxonomy.
    async fn resolve_user(&self, remote: &RemoteSubscription) -> BillingResult<Uuid> {
        if let Some(user_id) = remote
            .metadata
            .get("user_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
        {
            return Ok(user_id);
        }

        self.users
            .find_by_remote_customer_id(&remote.customer)
            .await?
            .ok_or(BillingError::UnknownEntity {
                entity: "user",
                id: remote.customer.clone(),
            })
    }

    async fn create_from_remote(
        &self,
        ctx: &BillingContext,
        remote: &RemoteSubscription,
        remote_event_id: Option<&str>,
    ) -> BillingResult<Subscription> {
        let user_id = self.resolve_user(remote).await?;
        let status = parse_remote_status(&remote.status)?;
        let plan = remote
            .plan
            .as_deref()
            .and_then(SubscriptionTier::from_str)
            .unwrap_or(SubscriptionTier::Free);

        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id,
            status,
            plan,
            interval: remote
                .interval
                .as_deref()
                .and_then(BillingInterval::from_str)
                .unwrap_or(BillingInterval::Month),
            amount_cents: remote.amount_cents.unwrap_or(0),
            currency: remote.currency.clone().unwrap_or_else(|| "usd".to_string()),
            remote_subscription_id: remote.id.clone(),
            remote_customer_id: remote.customer.clone(),
            failed_payment_count: 0,
            cancel_at_period_end: remote.cancel_at_period_end,
            current_period_start: unix_or(remote.current_period_start, ctx.now),
            current_period_end: unix_or(remote.current_period_end, ctx.now),
            trial_start: remote.trial_start.map(|t| unix_or(t, ctx.now)),
            trial_end: remote.trial_end.map(|t| unix_or(t, ctx.now)),
            grace_period_end: grace_for_status(status, None, ctx.now, &self.config),
            canceled_at: remote.canceled_at.map(|t| unix_or(t, ctx.now)),
            version: 1,
            created_at: ctx.now,
            updated_at: ctx.now,
        };

        self.subs.insert(&sub).await?;

        if let Err(e) = self
            .entitlements
            .set_user_tier(user_id, effective_tier(status, plan), ctx.now)
            .await
        {
            tracing::error!(user_id = %user_id, error = %e, "Failed to push tier after creation");
        }

        tracing::info!(
            subscription_id = %sub.id,
            user_id = %user_id,
            remote_subscription_id = %remote.id,
            status = %status,
            "Subscription created from remote state"
        );

        let mut builder = AuditEntryBuilder::new(ctx, AuditAction::SubscriptionCreated)
            .actor(ActorType::Provider)
            .user(user_id)
            .subscription(sub.id)
            .after(sub.snapshot());
        if let Some(event_id) = remote_event_id {
            builder = builder.remote_event(event_id);
        }
        self.audit.append(builder.build()).await;

        Ok(sub)
    }

    /// Field-level last-writer-wins merge: remote truth for status, periods,
    /// price, and cancellation; local-only failure tracking is normalized to
    /// match the merged status.
    fn merge(
        &self,
        ctx: &BillingContext,
        local: &Subscription,
        remote: &RemoteSubscription,
    ) -> Subscription {
        let mut merged = local.clone();

        if let Ok(status) = parse_remote_status(&remote.status) {
            merged.status = status;
        } else {
            tracing::warn!(
                subscription_id = %local.id,
                remote_status = %remote.status,
                "Unrecognized remote status, keeping local status"
            );
        }

        merged.cancel_at_period_end = remote.cancel_at_period_end;
        merged.current_period_start = unix_or(remote.current_period_start, ctx.now);
        merged.current_period_end = unix_or(remote.current_period_end, ctx.now);
        merged.trial_start = remote.trial_start.map(|t| unix_or(t, ctx.now));
        merged.trial_end = remote.trial_end.map(|t| unix_or(t, ctx.now));
        merged.canceled_at = remote.canceled_at.map(|t| unix_or(t, ctx.now));
        merged.remote_customer_id = remote.customer.clone();

        if let Some(plan) = remote.plan.as_deref().and_then(SubscriptionTier::from_str) {
            merged.plan = plan;
        }
        if let Some(interval) = remote.interval.as_deref().and_then(BillingInterval::from_str) {
            merged.interval = interval;
        }
        if let Some(amount) = remote.amount_cents {
            merged.amount_cents = amount;
        }
        if let Some(currency) = &remote.currency {
            merged.currency = currency.clone();
        }

        // Failure tracking is local-only state; re-anchor it to the merged
        // status so a reconcile to Active behaves like a recovery and a
        // reconcile to PastDue still gets swept if the failure event was
        // never delivered.
        match merged.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
                merged.failed_payment_count = 0;
                merged.grace_period_end = None;
            }
            SubscriptionStatus::PastDue => {
                merged.grace_period_end =
                    grace_for_status(merged.status, local.grace_period_end, ctx.now, &self.config);
            }
            _ => {}
        }

        merged.updated_at = ctx.now;
        merged
    }

    fn differs(local: &Subscription, merged: &Subscription) -> bool {
        local.status != merged.status
            || local.plan != merged.plan
            || local.interval != merged.interval
            || local.amount_cents != merged.amount_cents
            || local.currency != merged.currency
            || local.cancel_at_period_end != merged.cancel_at_period_end
            || local.current_period_start != merged.current_period_start
            || local.current_period_end != merged.current_period_end
            || local.trial_start != merged.trial_start
            || local.trial_end != merged.trial_end
            || local.canceled_at != merged.canceled_at
            || local.failed_payment_count != merged.failed_payment_count
            || local.grace_period_end != merged.grace_period_end
            || local.remote_customer_id != merged.remote_customer_id
    }

    async fn finish_merge(
        &self,
        ctx: &BillingContext,
        local: &Subscription,
        merged: &Subscription,
        remote_event_id: Option<&str>,
    ) {
        if let Err(e) = self
            .entitlements
            .set_user_tier(
                merged.user_id,
                effective_tier(merged.status, merged.plan),
                ctx.now,
            )
            .await
        {
            tracing::error!(
                user_id = %merged.user_id,
                error = %e,
                "Failed to push tier after reconcile"
            );
        }

        tracing::info!(
            subscription_id = %local.id,
            from = %local.status,
            to = %merged.status,
            "Subscription reconciled against remote state"
        );

        let mut builder = AuditEntryBuilder::new(ctx, AuditAction::SubscriptionReconciled)
            .actor(ActorType::Provider)
            .user(merged.user_id)
            .subscription(local.id)
            .before(local.snapshot())
            .after(merged.snapshot());
        if let Some(event_id) = remote_event_id {
            builder = builder.remote_event(event_id);
        }
        self.audit.append(builder.build()).await;
    }
}

fn parse_remote_status(raw: &str) -> BillingResult<SubscriptionStatus> {
    SubscriptionStatus::from_str(raw)
        .ok_or_else(|| BillingError::EventPayloadInvalid(format!("unknown status: {raw}")))
}

fn unix_or(ts: i64, fallback: OffsetDateTime) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or(fallback)
}

/// Grace window for a status: past-due rows keep an existing window or get a
/// fresh one; every other status clears it.
fn grace_for_status(
    status: SubscriptionStatus,
    existing: Option<OffsetDateTime>,
    now: OffsetDateTime,
    config: &LifecycleConfig,
) -> Option<OffsetDateTime> {
    match status {
        SubscriptionStatus::PastDue => {
            existing.or(Some(now + Duration::days(config.grace_period_days)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_status() {
        assert_eq!(
            parse_remote_status("active").unwrap(),
            SubscriptionStatus::Active
        );
        assert_eq!(
            parse_remote_status("incomplete_expired").unwrap(),
            SubscriptionStatus::IncompleteExpired
        );
        assert!(parse_remote_status("limbo").is_err());
    }

    #[test]
    fn test_grace_window_assignment() {
        let config = LifecycleConfig::default();
        let now = OffsetDateTime::from_unix_timestamp(1_720_000_000).unwrap();
        let existing = Some(now - Duration::days(1));

        // Past due keeps an already-open window.
        assert_eq!(
            grace_for_status(SubscriptionStatus::PastDue, existing, now, &config),
            existing
        );
        // Past due with no window gets a fresh one.
        assert_eq!(
            grace_for_status(SubscriptionStatus::PastDue, None, now, &config),
            Some(now + Duration::days(3))
        );
        // Anything else clears it.
        assert_eq!(
            grace_for_status(SubscriptionStatus::Active, existing, now, &config),
            None
        );
    }
}
