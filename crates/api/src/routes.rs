//! HTTP routes.
//!
//! The inbound webhook endpoint is the only business surface this binary
//! exposes; everything else in the billing core is driven by it or by the
//! worker's sweep.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use subledger_billing::{BillingContext, BillingError, RouteOutcome};

use crate::state::AppState;

/// Header carrying the provider signature.
const SIGNATURE_HEADER: &str = "billing-signature";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(handle_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Health check database probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "degraded" })),
            )
                .into_response()
        }
    }
}

/// Inbound provider webhook.
///
/// Status codes drive the provider's redelivery behavior: 200 for
/// accepted-or-already-processed, 400 for a bad signature (never retried
/// into the router), 5xx for transient handler failures so the provider
/// redelivers.
async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let ctx = BillingContext::new();

    match state.billing.webhooks.ingest(&ctx, &body, signature).await {
        Ok(outcome) => {
            let disposition = match outcome {
                RouteOutcome::Processed => "processed",
                RouteOutcome::AlreadyProcessed => "already_processed",
                RouteOutcome::InFlight => "in_flight",
                RouteOutcome::ProcessedWithWarning => "processed_with_warning",
                RouteOutcome::Ignored => "ignored",
            };
            (
                StatusCode::OK,
                Json(serde_json::json!({ "received": true, "disposition": disposition })),
            )
                .into_response()
        }
        Err(BillingError::WebhookSignatureInvalid) => {
            tracing::warn!("Rejected webhook with invalid signature");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid signature" })),
            )
                .into_response()
        }
        Err(e @ BillingError::EventPayloadInvalid(_)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Webhook processing failed, provider will redeliver");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "processing failed" })),
            )
                .into_response()
        }
    }
}
