//! Webhook ingestion.
//!
//! Entry point for provider notifications: verify the signature against the
//! shared secret, decode the envelope, persist a `received` audit entry, and
//! hand off to the router. The body is treated as opaque bytes until the
//! signature checks out; a forgery never reaches a handler.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::audit::{ActorType, AuditAction, AuditEntryBuilder, AuditLog};
use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::provider::EventEnvelope;
use crate::router::{EventRouter, RouteOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Allowed skew between the signature timestamp and our clock.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct WebhookIngestor {
    webhook_secret: String,
    router: Arc<EventRouter>,
    audit: AuditLog,
}

impl WebhookIngestor {
    pub fn new(webhook_secret: String, router: Arc<EventRouter>, audit: AuditLog) -> Self {
        Self {
            webhook_secret,
            router,
            audit,
        }
    }

    /// Verify and process one delivery.
    pub async fn ingest(
        &self,
        ctx: &BillingContext,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<RouteOutcome> {
        verify_signature(
            &self.webhook_secret,
            payload,
            signature_header,
            ctx.now.unix_timestamp(),
        )?;

        let envelope: EventEnvelope = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(error = %e, "Signed payload failed to decode");
            BillingError::EventPayloadInvalid(e.to_string())
        })?;

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.kind,
            payload_len = payload.len(),
            "Webhook verified"
        );

        // Recorded before handler execution so processing can be
        // reconstructed even when the handler later fails.
        self.audit
            .append(
                AuditEntryBuilder::new(ctx, AuditAction::EventReceived)
                    .actor(ActorType::Provider)
                    .remote_event(&envelope.id)
                    .detail(serde_json::json!({
                        "event_type": envelope.kind,
                        "created": envelope.created,
                    }))
                    .build(),
            )
            .await;

        self.router.route(ctx, &envelope).await
    }
}

/// Verify the provider's `t=<unix>,v1=<hex>` signature header.
///
/// The signed payload is `"{timestamp}.{body}"` under HMAC-SHA256 with the
/// shared secret (the `whsec_` prefix, when present, is not part of the key).
pub fn verify_signature(
    secret: &str,
    payload: &str,
    signature_header: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::warn!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Compute a `t=...,v1=...` header for a payload. Used by tests and local
/// event replay tooling.
pub fn sign_payload(secret: &str, payload: &str, timestamp: i64) -> String {
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);
    #[allow(clippy::expect_used)] // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(signed_payload.as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";
    const PAYLOAD: &str = r#"{"type":"payment.succeeded"}"#;
    const NOW: i64 = 1_750_000_000;

    #[test]
    fn test_valid_signature_accepted() {
        let header = sign_payload(SECRET, PAYLOAD, NOW);
        assert!(verify_signature(SECRET, PAYLOAD, &header, NOW).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign_payload(SECRET, PAYLOAD, NOW);
        let tampered = r#"{"type":"payment.succeeded","amount":999999}"#;
        assert!(matches!(
            verify_signature(SECRET, tampered, &header, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = sign_payload("whsec_other", PAYLOAD, NOW);
        assert!(verify_signature(SECRET, PAYLOAD, &header, NOW).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        // 10 minutes old, beyond the 5-minute tolerance.
        let header = sign_payload(SECRET, PAYLOAD, NOW - 600);
        assert!(verify_signature(SECRET, PAYLOAD, &header, NOW).is_err());
    }

    #[test]
    fn test_timestamp_within_tolerance_accepted() {
        let header = sign_payload(SECRET, PAYLOAD, NOW - 200);
        assert!(verify_signature(SECRET, PAYLOAD, &header, NOW).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature(SECRET, PAYLOAD, "v1=deadbeef", NOW).is_err());
        assert!(verify_signature(SECRET, PAYLOAD, "t=123", NOW).is_err());
        assert!(verify_signature(SECRET, PAYLOAD, "", NOW).is_err());
    }
}
