//! Subscription lifecycle service.
//!
//! Owns the single write path through which every status change flows:
//! read the row, run the pure state machine, persist under an optimistic
//! version check, and retry on conflict with a fresh read. Event handlers,
//! the payment recorder, and the grace-period sweep all go through here, so
//! a late payment racing the sweep resolves to exactly one committed
//! transition.

use std::sync::Arc;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use uuid::Uuid;

use crate::audit::{ActorType, AuditAction, AuditEntryBuilder, AuditLog};
use crate::context::BillingContext;
use crate::entitlement::EntitlementSink;
use crate::error::{BillingError, BillingResult};
use crate::model::Subscription;
use crate::provider::ProviderClient;
use crate::state_machine::{apply_trigger, AppliedTransition, LifecycleConfig, Trigger};
use crate::store::SubscriptionStore;
use subledger_shared::SubscriptionTier;

/// Version-conflict retries before surfacing a transient failure.
const MAX_VERSION_RETRIES: usize = 3;

pub struct SubscriptionService {
    subs: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn ProviderClient>,
    entitlements: Arc<dyn EntitlementSink>,
    audit: AuditLog,
    config: LifecycleConfig,
}

impl SubscriptionService {
    pub fn new(
        subs: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn ProviderClient>,
        entitlements: Arc<dyn EntitlementSink>,
        audit: AuditLog,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            subs,
            provider,
            entitlements,
            audit,
            config,
        }
    }

    pub fn lifecycle_config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        self.subs.get(id).await
    }

    pub async fn get_by_remote_id(&self, remote_id: &str) -> BillingResult<Option<Subscription>> {
        self.subs.get_by_remote_id(remote_id).await
    }

    pub async fn find_billable_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        self.subs.find_billable_for_user(user_id).await
    }

    /// Apply a lifecycle trigger to the subscription with the given remote id.
    pub async fn apply_trigger_by_remote_id(
        &self,
        ctx: &BillingContext,
        remote_id: &str,
        trigger: Trigger,
        remote_event_id: Option<&str>,
    ) -> BillingResult<Option<AppliedTransition>> {
        let sub = self
            .subs
            .get_by_remote_id(remote_id)
            .await?
            .ok_or(BillingError::UnknownEntity {
                entity: "subscription",
                id: remote_id.to_string(),
            })?;
        self.apply_trigger_by_id(ctx, sub.id, trigger, remote_event_id)
            .await
    }

    /// Apply a lifecycle trigger under optimistic concurrency.
    ///
    /// A zero-row versioned write means a concurrent writer won; the row is
    /// re-read and the trigger re-evaluated against the fresh state, so a
    /// loser whose transition no longer applies exits as a no-op instead of
    /// double-applying.
    pub async fn apply_trigger_by_id(
        &self,
        ctx: &BillingContext,
        id: Uuid,
        trigger: Trigger,
        remote_event_id: Option<&str>,
    ) -> BillingResult<Option<AppliedTransition>> {
        let mut delays = ExponentialBackoff::from_millis(2)
            .factor(25)
            .map(jitter)
            .take(MAX_VERSION_RETRIES);

        loop {
            let sub = self
                .subs
                .get(id)
                .await?
                .ok_or(BillingError::UnknownEntity {
                    entity: "subscription",
                    id: id.to_string(),
                })?;

            let applied = match apply_trigger(&sub, trigger, ctx.now, &self.config)? {
                None => {
                    tracing::debug!(
                        subscription_id = %id,
                        status = %sub.status,
                        trigger = %trigger,
                        "Trigger is a no-op for current state"
                    );
                    return Ok(None);
                }
                Some(applied) => applied,
            };

            if self
                .subs
                .update_with_version_check(&applied.subscription, sub.version)
                .await?
            {
                self.finish_transition(ctx, &sub, &applied, trigger, remote_event_id)
                    .await;
                return Ok(Some(applied));
            }

            tracing::debug!(
                subscription_id = %id,
                version = sub.version,
                trigger = %trigger,
                "Lost optimistic version race, re-reading"
            );

            match delays.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(BillingError::RetriesExhausted(format!(
                        "subscription {id} trigger {trigger}"
                    )))
                }
            }
        }
    }

    /// Post-commit side effects: entitlement tier and audit trail.
    async fn finish_transition(
        &self,
        ctx: &BillingContext,
        before: &Subscription,
        applied: &AppliedTransition,
        trigger: Trigger,
        remote_event_id: Option<&str>,
    ) {
        // The sink is idempotent; a failure here is logged rather than
        // propagated because the state transition is already committed and
        // the next transition or reconciliation pass re-asserts the tier.
        let tier_changed = match self
            .entitlements
            .set_user_tier(before.user_id, applied.effective_tier, ctx.now)
            .await
        {
            Ok(changed) => changed,
            Err(e) => {
                tracing::error!(
                    user_id = %before.user_id,
                    tier = %applied.effective_tier,
                    error = %e,
                    "Failed to push entitlement tier after transition"
                );
                false
            }
        };

        tracing::info!(
            subscription_id = %before.id,
            user_id = %before.user_id,
            from = %applied.previous,
            to = %applied.next,
            trigger = %trigger,
            "Subscription transitioned"
        );

        let action = if trigger == Trigger::GraceExpired {
            AuditAction::GracePeriodExpired
        } else {
            AuditAction::SubscriptionTransitioned
        };

        let mut builder = AuditEntryBuilder::new(ctx, action)
            .actor(ActorType::Provider)
            .user(before.user_id)
            .subscription(before.id)
            .before(before.snapshot())
            .after(applied.subscription.snapshot())
            .detail(serde_json::json!({
                "trigger": trigger.as_str(),
                "tier": applied.effective_tier.as_str(),
                "tier_changed": tier_changed,
            }));
        if let Some(event_id) = remote_event_id {
            builder = builder.remote_event(event_id);
        }
        self.audit.append(builder.build()).await;
    }

    /// Cancel a subscription on behalf of the user.
    ///
    /// Immediate cancellation is confirmed with the provider and applied
    /// locally right away; period-end cancellation only flags the row (the
    /// provider emits `subscription.deleted` when the period lapses).
    pub async fn cancel(
        &self,
        ctx: &BillingContext,
        id: Uuid,
        at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let sub = self
            .subs
            .get(id)
            .await?
            .ok_or(BillingError::UnknownEntity {
                entity: "subscription",
                id: id.to_string(),
            })?;

        if sub.status.is_terminal() {
            return Err(BillingError::InvalidTransition {
                from: sub.status.to_string(),
                trigger: Trigger::CancelRequested.to_string(),
            });
        }

        self.provider
            .cancel_subscription(&sub.remote_subscription_id, at_period_end)
            .await?;

        if at_period_end {
            let mut flagged = sub.clone();
            flagged.cancel_at_period_end = true;
            flagged.updated_at = ctx.now;
            if !self
                .subs
                .update_with_version_check(&flagged, sub.version)
                .await?
            {
                return Err(BillingError::VersionConflict {
                    entity: "subscription",
                    id: id.to_string(),
                });
            }

            self.audit
                .append(
                    AuditEntryBuilder::new(ctx, AuditAction::SubscriptionTransitioned)
                        .actor(ActorType::User)
                        .user(sub.user_id)
                        .subscription(sub.id)
                        .detail(serde_json::json!({ "cancel_at_period_end": true }))
                        .build(),
                )
                .await;
        } else {
            self.apply_trigger_by_id(ctx, id, Trigger::CancelRequested, None)
                .await?;
        }

        self.subs.get(id).await?.ok_or(BillingError::UnknownEntity {
            entity: "subscription",
            id: id.to_string(),
        })
    }

    /// Move the subscription to a different plan tier at the provider, then
    /// mirror the plan fields locally.
    pub async fn change_plan(
        &self,
        ctx: &BillingContext,
        id: Uuid,
        new_plan: SubscriptionTier,
    ) -> BillingResult<Subscription> {
        let sub = self
            .subs
            .get(id)
            .await?
            .ok_or(BillingError::UnknownEntity {
                entity: "subscription",
                id: id.to_string(),
            })?;

        if sub.status.is_terminal() {
            return Err(BillingError::InvalidTransition {
                from: sub.status.to_string(),
                trigger: "change_plan".to_string(),
            });
        }

        let remote = self
            .provider
            .change_plan(&sub.remote_subscription_id, new_plan)
            .await?;

        let mut updated = sub.clone();
        updated.plan = new_plan;
        if let Some(amount) = remote.amount_cents {
            updated.amount_cents = amount;
        }
        updated.updated_at = ctx.now;

        if !self
            .subs
            .update_with_version_check(&updated, sub.version)
            .await?
        {
            return Err(BillingError::VersionConflict {
                entity: "subscription",
                id: id.to_string(),
            });
        }

        let tier = crate::state_machine::effective_tier(updated.status, new_plan);
        if let Err(e) = self
            .entitlements
            .set_user_tier(sub.user_id, tier, ctx.now)
            .await
        {
            tracing::error!(
                user_id = %sub.user_id,
                error = %e,
                "Failed to push tier after plan change"
            );
        }

        self.audit
            .append(
                AuditEntryBuilder::new(ctx, AuditAction::TierChanged)
                    .actor(ActorType::User)
                    .user(sub.user_id)
                    .subscription(sub.id)
                    .before(serde_json::json!({ "plan": sub.plan.as_str() }))
                    .after(serde_json::json!({ "plan": new_plan.as_str() }))
                    .build(),
            )
            .await;

        self.subs.get(id).await?.ok_or(BillingError::UnknownEntity {
            entity: "subscription",
            id: id.to_string(),
        })
    }
}
