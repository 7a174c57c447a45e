//! Billing invariants.
//!
//! Runnable consistency checks over the billing tables. These can be run
//! after webhook replays or migrations to confirm the system is in a valid
//! state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real SQL query
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - users may be billed or entitled incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of a full invariant run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct TierMismatchRow {
    user_id: Uuid,
    plan_tier: String,
    sub_plan: String,
    sub_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledWithoutTimestampRow {
    sub_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct PastDueWithoutGraceRow {
    sub_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    remote_event_id: String,
    event_type: String,
    processing_started_at: OffsetDateTime,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_billable_subscription().await?);
        violations.extend(self.check_tier_matches_subscription().await?);
        violations.extend(self.check_canceled_has_timestamp().await?);
        violations.extend(self.check_past_due_has_grace_window().await?);
        violations.extend(self.check_no_stuck_events().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: at most one billable subscription per user.
    ///
    /// Two concurrently billable subscriptions mean double billing and
    /// ambiguous entitlement.
    async fn check_single_billable_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing', 'past_due')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_billable_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} billable subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: the user's denormalized tier matches their billable
    /// subscription's plan (grace-period states keep the paid tier).
    async fn check_tier_matches_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TierMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                u.id as user_id,
                u.plan_tier,
                s.plan as sub_plan,
                s.status as sub_status
            FROM users u
            JOIN subscriptions s ON s.user_id = u.id
            WHERE s.status IN ('active', 'trialing', 'past_due')
              AND u.plan_tier != s.plan
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "tier_matches_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User tier '{}' does not match billable subscription plan '{}' (status '{}')",
                    row.plan_tier, row.sub_plan, row.sub_status
                ),
                context: serde_json::json!({
                    "plan_tier": row.plan_tier,
                    "sub_plan": row.sub_plan,
                    "sub_status": row.sub_status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: canceled subscriptions carry a cancellation timestamp.
    async fn check_canceled_has_timestamp(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledWithoutTimestampRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id
            FROM subscriptions
            WHERE status = 'canceled' AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_timestamp".to_string(),
                user_ids: vec![row.user_id],
                description: "Canceled subscription has no canceled_at timestamp".to_string(),
                context: serde_json::json!({ "subscription_id": row.sub_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: past-due subscriptions have an open grace window.
    ///
    /// A past-due row without one is invisible to the sweep and would stay
    /// past due forever.
    async fn check_past_due_has_grace_window(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PastDueWithoutGraceRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id
            FROM subscriptions
            WHERE status = 'past_due' AND grace_period_end IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "past_due_has_grace_window".to_string(),
                user_ids: vec![row.user_id],
                description: "Past-due subscription has no grace_period_end".to_string(),
                context: serde_json::json!({ "subscription_id": row.sub_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: no event claim is stuck in `processing` beyond the
    /// recovery window plus slack.
    async fn check_no_stuck_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT remote_event_id, event_type, processing_started_at
            FROM provider_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - INTERVAL '2 hours'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_events".to_string(),
                user_ids: vec![],
                description: format!(
                    "Event '{}' ({}) stuck in processing since {}",
                    row.remote_event_id, row.event_type, row.processing_started_at
                ),
                context: serde_json::json!({
                    "remote_event_id": row.remote_event_id,
                    "event_type": row.event_type,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_billable_subscription" => self.check_single_billable_subscription().await,
            "tier_matches_subscription" => self.check_tier_matches_subscription().await,
            "canceled_has_timestamp" => self.check_canceled_has_timestamp().await,
            "past_due_has_grace_window" => self.check_past_due_has_grace_window().await,
            "no_stuck_events" => self.check_no_stuck_events().await,
            _ => Ok(vec![]),
        }
    }

    /// All available invariant checks.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_billable_subscription",
            "tier_matches_subscription",
            "canceled_has_timestamp",
            "past_due_has_grace_window",
            "no_stuck_events",
        ]
    }
}
