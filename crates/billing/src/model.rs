//! Domain records for subscriptions, payments, and invoices.
//!
//! Plain structs with an explicit `version` column for optimistic
//! concurrency; all mutation goes through the state machine and the store
//! traits, never through ad-hoc field writes.

use serde::{Deserialize, Serialize};
use subledger_shared::SubscriptionTier;
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Canceled,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "incomplete_expired" => Some(SubscriptionStatus::IncompleteExpired),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }

    /// States that count toward the one-billable-subscription-per-user
    /// invariant.
    pub fn is_billable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing interval of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            _ => None,
        }
    }
}

/// A locally held subscription record.
///
/// The remote system is authoritative for status, period boundaries, and
/// price; this row is the reconciled local view. `version` is the optimistic
/// concurrency guard: every write predicates on the version it read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: SubscriptionStatus,
    pub plan: SubscriptionTier,
    pub interval: BillingInterval,
    pub amount_cents: i64,
    pub currency: String,
    pub remote_subscription_id: String,
    pub remote_customer_id: String,
    pub failed_payment_count: i32,
    pub cancel_at_period_end: bool,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub grace_period_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Compact status snapshot for audit before/after fields.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status.as_str(),
            "plan": self.plan.as_str(),
            "failed_payment_count": self.failed_payment_count,
            "grace_period_end": self.grace_period_end.map(|t| t.unix_timestamp()),
            "cancel_at_period_end": self.cancel_at_period_end,
            "version": self.version,
        })
    }
}

/// Status of a payment. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "succeeded" => Some(PaymentStatus::Succeeded),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            "canceled" => Some(PaymentStatus::Canceled),
            _ => None,
        }
    }

    /// Whether a payment may advance from `self` to `next`.
    ///
    /// Pending fans out to any outcome; Succeeded may only be refunded;
    /// Failed, Refunded, and Canceled are terminal. Re-asserting the current
    /// status is not an advance (callers treat it as a duplicate).
    pub fn can_advance_to(&self, next: PaymentStatus) -> bool {
        match self {
            PaymentStatus::Pending => next != PaymentStatus::Pending,
            PaymentStatus::Succeeded => next == PaymentStatus::Refunded,
            PaymentStatus::Failed | PaymentStatus::Refunded | PaymentStatus::Canceled => false,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment attempt mirrored from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub remote_payment_intent_id: String,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
    pub refunded_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Status of an invoice, mirroring the provider lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Uncollectible => "uncollectible",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(InvoiceStatus::Draft),
            "open" => Some(InvoiceStatus::Open),
            "paid" => Some(InvoiceStatus::Paid),
            "uncollectible" => Some(InvoiceStatus::Uncollectible),
            "void" => Some(InvoiceStatus::Void),
            _ => None,
        }
    }

    /// One-directional: Draft -> Open -> {Paid | Uncollectible | Void}.
    /// Out-of-order deliveries that would regress the status are ignored.
    pub fn can_advance_to(&self, next: InvoiceStatus) -> bool {
        match self {
            InvoiceStatus::Draft => next != InvoiceStatus::Draft,
            InvoiceStatus::Open => matches!(
                next,
                InvoiceStatus::Paid | InvoiceStatus::Uncollectible | InvoiceStatus::Void
            ),
            InvoiceStatus::Paid | InvoiceStatus::Uncollectible | InvoiceStatus::Void => false,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local mirror of a provider invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub remote_invoice_id: String,
    pub status: InvoiceStatus,
    pub amount_cents: i64,
    pub amount_paid_cents: i64,
    pub amount_remaining_cents: i64,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Paused,
        ] {
            assert_eq!(SubscriptionStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::IncompleteExpired.is_terminal());
        assert!(!SubscriptionStatus::Unpaid.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
    }

    #[test]
    fn test_payment_status_forward_only() {
        assert!(PaymentStatus::Pending.can_advance_to(PaymentStatus::Succeeded));
        assert!(PaymentStatus::Pending.can_advance_to(PaymentStatus::Failed));
        assert!(PaymentStatus::Succeeded.can_advance_to(PaymentStatus::Refunded));
        assert!(!PaymentStatus::Succeeded.can_advance_to(PaymentStatus::Pending));
        assert!(!PaymentStatus::Succeeded.can_advance_to(PaymentStatus::Failed));
        assert!(!PaymentStatus::Failed.can_advance_to(PaymentStatus::Succeeded));
        assert!(!PaymentStatus::Refunded.can_advance_to(PaymentStatus::Succeeded));
    }

    #[test]
    fn test_invoice_status_one_directional() {
        assert!(InvoiceStatus::Draft.can_advance_to(InvoiceStatus::Open));
        assert!(InvoiceStatus::Open.can_advance_to(InvoiceStatus::Paid));
        assert!(InvoiceStatus::Open.can_advance_to(InvoiceStatus::Void));
        assert!(!InvoiceStatus::Paid.can_advance_to(InvoiceStatus::Open));
        assert!(!InvoiceStatus::Void.can_advance_to(InvoiceStatus::Paid));
    }
}
