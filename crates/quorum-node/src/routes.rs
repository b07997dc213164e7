// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::state::NodeState;

pub async fn health(State(state): State<Arc<NodeState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "active_sessions": state.processes.active_session_ids().len(),
    }))
}

/// A2A agent advertisement.  Public, cached for five minutes.
pub async fn agent_card(State(state): State<Arc<NodeState>>) -> Response {
    let agents: Vec<serde_json::Value> = state
        .store
        .list_agents()
        .unwrap_or_default()
        .into_iter()
        .map(|a| {
            json!({
                "id": a.id,
                "name": a.name,
                "model": a.model,
            })
        })
        .collect();
    let card = json!({
        "name": "quorum",
        "description": "Multi-agent orchestration server",
        "version": env!("CARGO_PKG_VERSION"),
        "agents": agents,
        "capabilities": ["sessions", "councils", "workflows", "algochat"],
    });
    (
        StatusCode::OK,
        [("Cache-Control", "public, max-age=300")],
        Json(card),
    )
        .into_response()
}

pub async fn providers(State(state): State<Arc<NodeState>>) -> Json<serde_json::Value> {
    let providers: Vec<serde_json::Value> = state
        .providers
        .iter()
        .map(|p| json!({"id": p.id, "name": p.name}))
        .collect();
    Json(json!({ "providers": providers }))
}

pub async fn provider_models(
    State(state): State<Arc<NodeState>>,
    Path(provider): Path<String>,
) -> Response {
    match state.providers.iter().find(|p| p.id == provider) {
        Some(p) => Json(json!({"provider": p.id, "models": p.models})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "status": 404, "error": "unknown provider"})),
        )
            .into_response(),
    }
}
