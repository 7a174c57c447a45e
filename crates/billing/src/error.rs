//! Billing error types.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by the billing reconciliation core.
///
/// Variants map onto the retry taxonomy: signature failures are rejected and
/// never retried here, store/version failures are transient and retried with
/// bounded backoff, referential failures are processed-with-warning to stop
/// redelivery loops, and rule violations are client errors.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("malformed event payload: {0}")]
    EventPayloadInvalid(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("optimistic version conflict on {entity} {id}")]
    VersionConflict { entity: &'static str, id: String },

    #[error("retries exhausted: {0}")]
    RetriesExhausted(String),

    #[error("invalid transition: {from} does not accept {trigger}")]
    InvalidTransition { from: String, trigger: String },

    #[error("unknown {entity}: {id}")]
    UnknownEntity { entity: &'static str, id: String },

    #[error("payment provider error: {0}")]
    Provider(String),

    #[error("handler timed out after {0}s")]
    HandlerTimeout(u64),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Transient failures are surfaced to the transport so the provider
    /// redelivers; everything else is terminal for the current delivery.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_)
                | BillingError::VersionConflict { .. }
                | BillingError::RetriesExhausted(_)
                | BillingError::Provider(_)
                | BillingError::HandlerTimeout(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::Provider(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::EventPayloadInvalid(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BillingError::Database("boom".into()).is_transient());
        assert!(BillingError::RetriesExhausted("sub".into()).is_transient());
        assert!(!BillingError::WebhookSignatureInvalid.is_transient());
        assert!(!BillingError::InvalidTransition {
            from: "canceled".into(),
            trigger: "cancel_requested".into()
        }
        .is_transient());
    }
}
