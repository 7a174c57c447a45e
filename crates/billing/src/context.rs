//! Per-operation context.

use time::OffsetDateTime;
use uuid::Uuid;

/// Explicit call context threaded through every operation.
///
/// Carries the clock so handlers and the state machine never read ambient
/// time, which keeps transition logic deterministic under test and lets the
/// grace sweep and event handlers agree on a single `now` per unit of work.
#[derive(Debug, Clone, Copy)]
pub struct BillingContext {
    pub correlation_id: Uuid,
    pub now: OffsetDateTime,
}

impl BillingContext {
    /// Context for a fresh unit of work using the wall clock.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            now: OffsetDateTime::now_utc(),
        }
    }

    /// Context pinned to a specific instant.
    pub fn at(now: OffsetDateTime) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            now,
        }
    }
}

impl Default for BillingContext {
    fn default() -> Self {
        Self::new()
    }
}
