//! Subledger background worker.
//!
//! Runs the scheduled jobs the billing core depends on:
//! - Grace-period sweep (hourly): expires past-due subscriptions whose
//!   grace window elapsed
//! - Billing invariant checks (daily at 5:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)
//!
//! The sweep shares the event handlers' optimistic-version write path, so
//! running multiple worker instances concurrently is safe.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use subledger_billing::{BillingContext, BillingService};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Subledger Worker");

    let pool = create_db_pool().await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(billing) => Arc::new(billing),
        Err(e) => {
            // Without provider credentials the sweep cannot run; stay alive
            // so orchestration doesn't flap, but do nothing.
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Grace period sweep (hourly)
    // Expires past-due subscriptions whose grace window elapsed. Losing a
    // version race to a concurrent payment event is expected and harmless.
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running grace period sweep");
                let ctx = BillingContext::new();
                match billing.grace.sweep(&ctx).await {
                    Ok(expired) => {
                        if !expired.is_empty() {
                            warn!(
                                expired = expired.len(),
                                "Subscriptions expired to unpaid after grace period"
                            );
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Grace period sweep failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Grace period sweep (hourly)");

    // Job 2: Billing invariant checks (daily at 5:00 AM UTC)
    // Read-only consistency sweep; violations are surfaced on the error
    // channel for the operator.
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 5 * * *", move |_uuid, _l| {
            let checker = subledger_billing::InvariantChecker::new(invariant_pool.clone());
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks = summary.checks_run, "All billing invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Invariant check run failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 5:00 AM UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Subledger Worker started successfully with 3 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background
    // tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
