//! Subscription lifecycle state machine.
//!
//! Pure transition logic: no I/O and no clock access. Callers pass the
//! current row, a trigger, and an explicit `now`; they get back either a
//! fully updated copy of the row to persist, `None` for a lawful no-op
//! (duplicate or stale delivery), or an error for a genuine rule violation.
//! All store writes derived from a transition go through
//! `SubscriptionStore::update_with_version_check`, which is what closes the
//! race between event handlers and the grace-period sweep.

use subledger_shared::SubscriptionTier;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::model::{Subscription, SubscriptionStatus};

/// Tunable lifecycle parameters.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// Days a past-due subscription stays usable before the sweep expires it.
    pub grace_period_days: i64,
    /// Consecutive failed payments that push PastDue to Unpaid.
    pub unpaid_failure_threshold: i32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period_days: 3,
            unpaid_failure_threshold: 3,
        }
    }
}

/// What happened to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// First setup completed successfully (checkout confirmed).
    ActivationSucceeded,
    /// Initial setup abandoned or failed terminally.
    ActivationExpired,
    /// Trial period began.
    TrialStarted,
    PaymentSucceeded,
    PaymentFailed,
    /// Grace window elapsed (applied by the sweep).
    GraceExpired,
    /// Cancellation requested by the user or reported by the provider.
    CancelRequested,
    Pause,
    Resume,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::ActivationSucceeded => "activation_succeeded",
            Trigger::ActivationExpired => "activation_expired",
            Trigger::TrialStarted => "trial_started",
            Trigger::PaymentSucceeded => "payment_succeeded",
            Trigger::PaymentFailed => "payment_failed",
            Trigger::GraceExpired => "grace_expired",
            Trigger::CancelRequested => "cancel_requested",
            Trigger::Pause => "pause",
            Trigger::Resume => "resume",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful transition.
#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub previous: SubscriptionStatus,
    pub next: SubscriptionStatus,
    /// Updated copy of the row, ready for a version-checked write.
    pub subscription: Subscription,
    /// Entitlement tier implied by the new state. Pushing it to the sink is
    /// idempotent, so callers apply it unconditionally.
    pub effective_tier: SubscriptionTier,
}

/// Entitlement tier implied by a subscription state.
///
/// Past-due subscriptions keep their paid tier for the duration of the grace
/// window; everything terminal or unpaid drops to free.
pub fn effective_tier(status: SubscriptionStatus, plan: SubscriptionTier) -> SubscriptionTier {
    match status {
        SubscriptionStatus::Active
        | SubscriptionStatus::Trialing
        | SubscriptionStatus::PastDue
        | SubscriptionStatus::Paused => plan,
        SubscriptionStatus::Incomplete
        | SubscriptionStatus::Unpaid
        | SubscriptionStatus::Canceled
        | SubscriptionStatus::IncompleteExpired => SubscriptionTier::Free,
    }
}

/// Apply a trigger to a subscription.
///
/// Returns `Ok(None)` when the trigger is lawful but changes nothing (a
/// duplicate or out-of-order delivery), and `Err(InvalidTransition)` when the
/// trigger is a rule violation that should be reported to the caller rather
/// than retried.
pub fn apply_trigger(
    sub: &Subscription,
    trigger: Trigger,
    now: OffsetDateTime,
    config: &LifecycleConfig,
) -> BillingResult<Option<AppliedTransition>> {
    use SubscriptionStatus::*;

    let mut next = sub.clone();
    next.updated_at = now;

    let outcome = match (sub.status, trigger) {
        // Initial setup resolution.
        (Incomplete, Trigger::ActivationSucceeded) | (Incomplete, Trigger::PaymentSucceeded) => {
            next.status = Active;
            next.failed_payment_count = 0;
            next.grace_period_end = None;
            Some(next)
        }
        (Incomplete, Trigger::TrialStarted) => {
            next.status = Trialing;
            if next.trial_start.is_none() {
                next.trial_start = Some(now);
            }
            Some(next)
        }
        (Incomplete, Trigger::ActivationExpired) | (Incomplete, Trigger::PaymentFailed) => {
            next.status = IncompleteExpired;
            Some(next)
        }

        // Successful payments re-establish Active and wipe failure tracking.
        (Trialing, Trigger::PaymentSucceeded) | (PastDue, Trigger::PaymentSucceeded) => {
            next.status = Active;
            next.failed_payment_count = 0;
            next.grace_period_end = None;
            Some(next)
        }
        // A success that raced the grace sweep and lost arrives here; it must
        // not re-apply. Genuine recovery of an unpaid subscription comes
        // through reconciliation, where the remote object reports active.
        (Unpaid, Trigger::PaymentSucceeded) => None,
        (Active, Trigger::PaymentSucceeded) => None,

        // First failure opens the grace window.
        (Active, Trigger::PaymentFailed) | (Trialing, Trigger::PaymentFailed) => {
            next.status = PastDue;
            next.failed_payment_count = 1;
            next.grace_period_end = Some(now + Duration::days(config.grace_period_days));
            Some(next)
        }
        // Subsequent failures count up; the threshold forces Unpaid even if
        // the grace window has not elapsed yet.
        (PastDue, Trigger::PaymentFailed) => {
            next.failed_payment_count = sub.failed_payment_count.saturating_add(1);
            if next.failed_payment_count >= config.unpaid_failure_threshold {
                next.status = Unpaid;
            }
            Some(next)
        }

        // Sweep-driven expiry. Only fires when the window genuinely elapsed;
        // a racing payment that already moved the row away makes this a no-op.
        (PastDue, Trigger::GraceExpired) => match sub.grace_period_end {
            Some(end) if end <= now => {
                next.status = Unpaid;
                Some(next)
            }
            _ => None,
        },
        (_, Trigger::GraceExpired) => None,

        // Cancellation. Terminal states reject it as a rule violation.
        (Canceled, Trigger::CancelRequested) | (IncompleteExpired, Trigger::CancelRequested) => {
            return Err(BillingError::InvalidTransition {
                from: sub.status.to_string(),
                trigger: trigger.to_string(),
            })
        }
        (_, Trigger::CancelRequested) => {
            next.status = Canceled;
            next.canceled_at = Some(now);
            next.cancel_at_period_end = false;
            Some(next)
        }

        (Active, Trigger::Pause) | (Trialing, Trigger::Pause) => {
            next.status = Paused;
            Some(next)
        }
        (Paused, Trigger::Pause) => None,
        (Paused, Trigger::Resume) => {
            next.status = Active;
            Some(next)
        }
        (Active, Trigger::Resume) => None,
        (_, Trigger::Pause) | (_, Trigger::Resume) => {
            return Err(BillingError::InvalidTransition {
                from: sub.status.to_string(),
                trigger: trigger.to_string(),
            })
        }

        // Stale deliveries against settled rows.
        (Canceled, _) | (IncompleteExpired, _) => None,
        (Active, Trigger::ActivationSucceeded) => None,
        _ => None,
    };

    Ok(outcome.map(|updated| AppliedTransition {
        previous: sub.status,
        next: updated.status,
        effective_tier: effective_tier(updated.status, updated.plan),
        subscription: updated,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BillingInterval;
    use time::macros::datetime;
    use uuid::Uuid;

    fn subscription(status: SubscriptionStatus) -> Subscription {
        let t0 = datetime!(2025-06-01 00:00 UTC);
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status,
            plan: SubscriptionTier::Pro,
            interval: BillingInterval::Month,
            amount_cents: 2900,
            currency: "usd".into(),
            remote_subscription_id: "rsub_1".into(),
            remote_customer_id: "rcus_1".into(),
            failed_payment_count: 0,
            cancel_at_period_end: false,
            current_period_start: t0,
            current_period_end: t0 + Duration::days(30),
            trial_start: None,
            trial_end: None,
            grace_period_end: None,
            canceled_at: None,
            version: 1,
            created_at: t0,
            updated_at: t0,
        }
    }

    fn now() -> OffsetDateTime {
        datetime!(2025-06-10 12:00 UTC)
    }

    #[test]
    fn test_active_failure_opens_grace_window() {
        let sub = subscription(SubscriptionStatus::Active);
        let applied = apply_trigger(&sub, Trigger::PaymentFailed, now(), &LifecycleConfig::default())
            .unwrap()
            .unwrap();

        assert_eq!(applied.next, SubscriptionStatus::PastDue);
        assert_eq!(applied.subscription.failed_payment_count, 1);
        assert_eq!(
            applied.subscription.grace_period_end,
            Some(now() + Duration::days(3))
        );
        assert_eq!(applied.effective_tier, SubscriptionTier::Pro);
    }

    #[test]
    fn test_past_due_recovers_on_success() {
        let mut sub = subscription(SubscriptionStatus::PastDue);
        sub.failed_payment_count = 2;
        sub.grace_period_end = Some(now() + Duration::days(1));

        let applied = apply_trigger(
            &sub,
            Trigger::PaymentSucceeded,
            now(),
            &LifecycleConfig::default(),
        )
        .unwrap()
        .unwrap();

        assert_eq!(applied.next, SubscriptionStatus::Active);
        assert_eq!(applied.subscription.failed_payment_count, 0);
        assert!(applied.subscription.grace_period_end.is_none());
    }

    #[test]
    fn test_third_failure_forces_unpaid() {
        let mut sub = subscription(SubscriptionStatus::PastDue);
        sub.failed_payment_count = 2;
        sub.grace_period_end = Some(now() + Duration::days(2));

        let applied = apply_trigger(&sub, Trigger::PaymentFailed, now(), &LifecycleConfig::default())
            .unwrap()
            .unwrap();

        assert_eq!(applied.next, SubscriptionStatus::Unpaid);
        assert_eq!(applied.subscription.failed_payment_count, 3);
        assert_eq!(applied.effective_tier, SubscriptionTier::Free);
    }

    #[test]
    fn test_second_failure_stays_past_due() {
        let mut sub = subscription(SubscriptionStatus::PastDue);
        sub.failed_payment_count = 1;

        let applied = apply_trigger(&sub, Trigger::PaymentFailed, now(), &LifecycleConfig::default())
            .unwrap()
            .unwrap();

        assert_eq!(applied.next, SubscriptionStatus::PastDue);
        assert_eq!(applied.subscription.failed_payment_count, 2);
    }

    #[test]
    fn test_grace_expiry_requires_elapsed_window() {
        let mut sub = subscription(SubscriptionStatus::PastDue);
        sub.grace_period_end = Some(now() + Duration::hours(1));

        let outcome =
            apply_trigger(&sub, Trigger::GraceExpired, now(), &LifecycleConfig::default()).unwrap();
        assert!(outcome.is_none(), "window not elapsed yet");

        sub.grace_period_end = Some(now() - Duration::hours(1));
        let applied = apply_trigger(&sub, Trigger::GraceExpired, now(), &LifecycleConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(applied.next, SubscriptionStatus::Unpaid);
        assert_eq!(applied.effective_tier, SubscriptionTier::Free);
    }

    #[test]
    fn test_grace_expiry_noop_after_recovery() {
        // The sweep lost the race: the row is already Active again.
        let sub = subscription(SubscriptionStatus::Active);
        let outcome =
            apply_trigger(&sub, Trigger::GraceExpired, now(), &LifecycleConfig::default()).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_cancel_from_billable_states() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
        ] {
            let sub = subscription(status);
            let applied =
                apply_trigger(&sub, Trigger::CancelRequested, now(), &LifecycleConfig::default())
                    .unwrap()
                    .unwrap();
            assert_eq!(applied.next, SubscriptionStatus::Canceled);
            assert_eq!(applied.subscription.canceled_at, Some(now()));
            assert_eq!(applied.effective_tier, SubscriptionTier::Free);
        }
    }

    #[test]
    fn test_cancel_against_canceled_is_rejected() {
        let sub = subscription(SubscriptionStatus::Canceled);
        let err = apply_trigger(&sub, Trigger::CancelRequested, now(), &LifecycleConfig::default())
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }

    #[test]
    fn test_incomplete_setup_resolution() {
        let sub = subscription(SubscriptionStatus::Incomplete);

        let activated = apply_trigger(
            &sub,
            Trigger::PaymentSucceeded,
            now(),
            &LifecycleConfig::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(activated.next, SubscriptionStatus::Active);

        let expired =
            apply_trigger(&sub, Trigger::PaymentFailed, now(), &LifecycleConfig::default())
                .unwrap()
                .unwrap();
        assert_eq!(expired.next, SubscriptionStatus::IncompleteExpired);

        let trialing =
            apply_trigger(&sub, Trigger::TrialStarted, now(), &LifecycleConfig::default())
                .unwrap()
                .unwrap();
        assert_eq!(trialing.next, SubscriptionStatus::Trialing);
        assert_eq!(trialing.subscription.trial_start, Some(now()));
    }

    #[test]
    fn test_duplicate_success_is_noop() {
        let sub = subscription(SubscriptionStatus::Active);
        let outcome = apply_trigger(
            &sub,
            Trigger::PaymentSucceeded,
            now(),
            &LifecycleConfig::default(),
        )
        .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_stale_payment_events_on_terminal_rows() {
        for status in [
            SubscriptionStatus::Canceled,
            SubscriptionStatus::IncompleteExpired,
        ] {
            let sub = subscription(status);
            for trigger in [Trigger::PaymentSucceeded, Trigger::PaymentFailed] {
                let outcome =
                    apply_trigger(&sub, trigger, now(), &LifecycleConfig::default()).unwrap();
                assert!(outcome.is_none(), "{status} + {trigger} must be a no-op");
            }
        }
    }

    #[test]
    fn test_pause_resume() {
        let sub = subscription(SubscriptionStatus::Active);
        let paused = apply_trigger(&sub, Trigger::Pause, now(), &LifecycleConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(paused.next, SubscriptionStatus::Paused);
        // Paused keeps the paid tier.
        assert_eq!(paused.effective_tier, SubscriptionTier::Pro);

        let resumed = apply_trigger(
            &paused.subscription,
            Trigger::Resume,
            now(),
            &LifecycleConfig::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(resumed.next, SubscriptionStatus::Active);

        let err = apply_trigger(
            &subscription(SubscriptionStatus::Unpaid),
            Trigger::Pause,
            now(),
            &LifecycleConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }

    #[test]
    fn test_unpaid_ignores_late_payment_success() {
        // The loser of the sweep-vs-payment race re-evaluates against the
        // fresh row and must exit without transitioning.
        let mut sub = subscription(SubscriptionStatus::Unpaid);
        sub.failed_payment_count = 3;

        let outcome = apply_trigger(
            &sub,
            Trigger::PaymentSucceeded,
            now(),
            &LifecycleConfig::default(),
        )
        .unwrap();
        assert!(outcome.is_none());
    }
}
