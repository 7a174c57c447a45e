//! Grace-period expiry sweep.
//!
//! Periodically expires past-due subscriptions whose grace window elapsed,
//! feeding synthetic expiry transitions through the same versioned write
//! path as event handlers. A payment-succeeded event racing the sweep is
//! settled by the version column: whichever writer commits first wins, the
//! loser re-reads and finds nothing left to do. Multiple worker instances
//! can run the sweep concurrently for the same reason.

use std::sync::Arc;

use uuid::Uuid;

use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::store::SubscriptionStore;
use crate::subscriptions::SubscriptionService;

/// Rows examined per sweep run.
const SWEEP_BATCH_SIZE: i64 = 500;

pub struct GracePeriodMonitor {
    subs: Arc<dyn SubscriptionStore>,
    subscriptions: Arc<SubscriptionService>,
}

impl GracePeriodMonitor {
    pub fn new(subs: Arc<dyn SubscriptionStore>, subscriptions: Arc<SubscriptionService>) -> Self {
        Self { subs, subscriptions }
    }

    /// Expire eligible past-due subscriptions. Returns the ids that actually
    /// transitioned to Unpaid in this run.
    pub async fn sweep(&self, ctx: &BillingContext) -> BillingResult<Vec<Uuid>> {
        let candidates = self
            .subs
            .list_grace_expired(ctx.now, SWEEP_BATCH_SIZE)
            .await?;

        let total = candidates.len();
        let mut transitioned = Vec::new();
        let mut lost_races = 0usize;
        let mut errors = 0usize;

        for sub in candidates {
            match self
                .subscriptions
                .apply_trigger_by_id(ctx, sub.id, crate::state_machine::Trigger::GraceExpired, None)
                .await
            {
                Ok(Some(_)) => transitioned.push(sub.id),
                Ok(None) => {
                    // A concurrent payment or cancellation moved the row
                    // between the scan and the write.
                    lost_races += 1;
                }
                Err(BillingError::RetriesExhausted(_)) => {
                    tracing::warn!(
                        subscription_id = %sub.id,
                        "Sweep lost repeated version races, leaving row for next run"
                    );
                    errors += 1;
                }
                Err(e) => {
                    tracing::error!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Failed to expire past-due subscription"
                    );
                    errors += 1;
                }
            }
        }

        tracing::info!(
            scanned = total,
            expired = transitioned.len(),
            lost_races = lost_races,
            errors = errors,
            "Grace period sweep complete"
        );

        Ok(transitioned)
    }
}
