//! Entitlement sink.
//!
//! Terminal plan-tier changes are pushed to this collaborator. The operation
//! is idempotent: setting the tier a user already has is a no-op, so it is
//! safe to re-run on duplicate event deliveries and reconciliation passes.

use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use subledger_shared::SubscriptionTier;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[async_trait]
pub trait EntitlementSink: Send + Sync {
    /// Set the user's effective tier. Returns true when the tier actually
    /// changed.
    async fn set_user_tier(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        updated_at: OffsetDateTime,
    ) -> BillingResult<bool>;
}

/// Postgres-backed sink writing the denormalized tier onto the user row.
pub struct PgEntitlementSink {
    pool: PgPool,
}

impl PgEntitlementSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementSink for PgEntitlementSink {
    async fn set_user_tier(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        updated_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        // The predicate makes the write idempotent: re-asserting the current
        // tier touches zero rows.
        let result = sqlx::query(
            r#"
            UPDATE users
            SET plan_tier = $2, tier_updated_at = $3
            WHERE id = $1 AND plan_tier IS DISTINCT FROM $2
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            tracing::info!(user_id = %user_id, tier = %tier, "User entitlement tier updated");
        }
        Ok(changed)
    }
}

/// In-memory sink recording effective tier changes, for tests.
#[derive(Default)]
pub struct MemoryEntitlementSink {
    tiers: Mutex<std::collections::HashMap<Uuid, SubscriptionTier>>,
    changes: Mutex<Vec<(Uuid, SubscriptionTier)>>,
}

impl MemoryEntitlementSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier_of(&self, user_id: Uuid) -> Option<SubscriptionTier> {
        let tiers = self.tiers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tiers.get(&user_id).copied()
    }

    /// Every effective (tier-changing) call, in order.
    pub fn changes(&self) -> Vec<(Uuid, SubscriptionTier)> {
        let changes = self.changes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        changes.clone()
    }
}

#[async_trait]
impl EntitlementSink for MemoryEntitlementSink {
    async fn set_user_tier(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        _updated_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tiers = self.tiers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if tiers.get(&user_id) == Some(&tier) {
            return Ok(false);
        }
        tiers.insert(user_id, tier);
        self.changes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((user_id, tier));
        Ok(true)
    }
}
