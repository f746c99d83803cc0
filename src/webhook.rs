//! HTTP endpoint for payout provider webhooks.
//!
//! `POST /webhooks/payouts/{tenant}` carries the provider's JSON status
//! report. When the tenant has a webhook secret, the body must be signed:
//! `X-Slotledger-Signature: hex(hmac_sha256(secret, raw body))`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::engine::EngineError;
use crate::limits::MAX_WEBHOOK_BODY_BYTES;
use crate::observability::WEBHOOKS_TOTAL;
use crate::tenant::TenantManager;

pub const SIGNATURE_HEADER: &str = "x-slotledger-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("malformed webhook: {0}")]
    Malformed(String),
    #[error("missing signature")]
    MissingSignature,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl WebhookError {
    fn status(&self) -> StatusCode {
        match self {
            WebhookError::Malformed(_) => StatusCode::BAD_REQUEST,
            WebhookError::MissingSignature | WebhookError::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            WebhookError::UnknownTenant(_) => StatusCode::NOT_FOUND,
            WebhookError::Engine(e) => match e {
                EngineError::Validation(_) | EngineError::WebhookMapping(_) => {
                    StatusCode::BAD_REQUEST
                }
                EngineError::NotFound(..) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn outcome(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST => "rejected",
            StatusCode::UNAUTHORIZED => "unauthorized",
            StatusCode::NOT_FOUND => "not_found",
            _ => "error",
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status();
        metrics::counter!(WEBHOOKS_TOTAL, "outcome" => self.outcome()).increment(1);
        if status.is_server_error() {
            tracing::error!(error = %self, "webhook processing failed");
        }
        let body = json!({ "ok": false, "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub fn router(tenants: Arc<TenantManager>) -> Router {
    Router::new()
        .route("/webhooks/payouts/:tenant", post(handle_payout_webhook))
        .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES))
        .with_state(tenants)
}

fn mac_of(secret: &str, body: &[u8]) -> Result<Vec<u8>, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Hex HMAC-SHA256 of `body` under `secret`, as a provider would send it.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, hmac::digest::InvalidLength> {
    mac_of(secret, body).map(hex::encode)
}

fn verify_signature(secret: &str, body: &[u8], headers: &HeaderMap) -> Result<(), WebhookError> {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::MissingSignature)?;
    let provided = hex::decode(provided.trim()).map_err(|_| WebhookError::InvalidSignature)?;
    let expected = mac_of(secret, body).map_err(|_| WebhookError::InvalidSignature)?;
    if expected.ct_eq(&provided).into() {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

async fn handle_payout_webhook(
    State(tenants): State<Arc<TenantManager>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, WebhookError> {
    let engine = tenants
        .get_existing(&tenant)
        .ok()
        .flatten()
        .ok_or_else(|| WebhookError::UnknownTenant(tenant.clone()))?;

    let secret = engine.business_unit().await.payout.webhook_secret;
    if secret.is_empty() {
        tracing::warn!(tenant = %tenant, "no webhook secret configured, accepting unsigned payload");
    } else {
        verify_signature(&secret, &body, &headers).inspect_err(|_| {
            tracing::warn!(tenant = %tenant, "webhook signature rejected");
        })?;
    }

    let payload: Value =
        serde_json::from_slice(&body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
    let payout = engine.reconcile_webhook(&payload).await?;

    metrics::counter!(WEBHOOKS_TOTAL, "outcome" => "applied").increment(1);
    tracing::debug!(tenant = %tenant, payout_id = %payout.id, status = payout.status.as_str(), "webhook handled");
    Ok(Json(json!({ "ok": true })))
}
