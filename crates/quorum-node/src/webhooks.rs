// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Webhook registration CRUD and the GitHub ingress.
//!
//! GitHub deliveries are verified with `X-Hub-Signature-256` (HMAC-SHA256,
//! constant-time compare) when a secret is configured, deduplicated through
//! the `webhook-delivery` namespace, and recorded per delivery.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use quorum_db::{WebhookDeliveryRow, WebhookRegistrationRow};

use crate::state::NodeState;

const DELIVERY_DEDUP_NS: &str = "webhook-delivery";

#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"ok": false, "status": 404, "error": "webhook not found"})),
    )
        .into_response()
}

pub async fn create(
    State(state): State<Arc<NodeState>>,
    Json(body): Json<WebhookBody>,
) -> Response {
    let row = WebhookRegistrationRow {
        id: Uuid::new_v4().to_string(),
        url: body.url,
        events: body.events,
        secret: body.secret,
        active: body.active,
        created_at: String::new(),
    };
    match state.store.create_webhook(&row) {
        Ok(()) => (StatusCode::CREATED, Json(json!({"ok": true, "id": row.id}))).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "status": 400, "error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn list(State(state): State<Arc<NodeState>>) -> Response {
    match state.store.list_webhooks() {
        Ok(hooks) => Json(json!({ "webhooks": hooks })).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn show(State(state): State<Arc<NodeState>>, Path(id): Path<String>) -> Response {
    match state.store.get_webhook(&id) {
        Ok(hook) => Json(json!(hook)).into_response(),
        Err(_) => not_found(),
    }
}

pub async fn update(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
    Json(body): Json<WebhookBody>,
) -> Response {
    let row = WebhookRegistrationRow {
        id,
        url: body.url,
        events: body.events,
        secret: body.secret,
        active: body.active,
        created_at: String::new(),
    };
    match state.store.update_webhook(&row) {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(quorum_db::DbError::NotFound(_)) => not_found(),
        Err(e) => internal(e),
    }
}

pub async fn remove(State(state): State<Arc<NodeState>>, Path(id): Path<String>) -> Response {
    match state.store.delete_webhook(&id) {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(quorum_db::DbError::NotFound(_)) => not_found(),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DeliveryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn deliveries(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
    Query(query): Query<DeliveryQuery>,
) -> Response {
    match state.store.webhook_deliveries(Some(&id), query.limit) {
        Ok(rows) => Json(json!({ "deliveries": rows })).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn all_deliveries(
    State(state): State<Arc<NodeState>>,
    Query(query): Query<DeliveryQuery>,
) -> Response {
    match state.store.webhook_deliveries(None, query.limit) {
        Ok(rows) => Json(json!({ "deliveries": rows })).into_response(),
        Err(e) => internal(e),
    }
}

fn internal(e: quorum_db::DbError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"ok": false, "status": 500, "error": e.to_string()})),
    )
        .into_response()
}

// ── GitHub ingress ────────────────────────────────────────────────────────────

pub async fn github_ingress(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.config.webhooks.github_enabled {
        return (StatusCode::SERVICE_UNAVAILABLE, "github webhooks disabled").into_response();
    }

    if let Some(secret) = &state.config.webhooks.github_secret {
        let provided = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_github_signature(secret.as_bytes(), &body, provided) {
            warn!("github webhook signature mismatch");
            return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
        }
    }

    let delivery_id = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    // GitHub redelivers on timeouts; the dedup namespace makes that safe.
    if !delivery_id.is_empty() && state.dedup.is_duplicate(DELIVERY_DEDUP_NS, &delivery_id) {
        return (StatusCode::OK, "duplicate").into_response();
    }

    let row = WebhookDeliveryRow {
        id: Uuid::new_v4().to_string(),
        webhook_id: None,
        source: "github".to_string(),
        event_id: if delivery_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            delivery_id
        },
        status: "received".to_string(),
        payload: String::from_utf8_lossy(&body).into_owned(),
        created_at: String::new(),
    };
    if let Err(e) = state.store.record_webhook_delivery(&row) {
        warn!("webhook delivery record failed: {e}");
    }
    info!(event, "github webhook accepted");
    state.hub.publish(
        "owner",
        json!({"type": "webhook_delivery", "source": "github", "event": event}),
    );
    (StatusCode::OK, "ok").into_response()
}

fn verify_github_signature(secret: &[u8], body: &[u8], provided: &str) -> bool {
    let Some(hex_sig) = provided.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    computed.ct_eq(&expected[..]).into()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn github_signature_verification_roundtrip() {
        let secret = b"webhook-secret";
        let body = b"{\"action\":\"opened\"}";
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_github_signature(secret, body, &sig));
        assert!(!verify_github_signature(secret, b"tampered", &sig));
        assert!(!verify_github_signature(secret, body, "sha256=deadbeef"));
        assert!(!verify_github_signature(secret, body, "not-prefixed"));
    }
}
