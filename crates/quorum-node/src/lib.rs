// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! HTTP/WebSocket node — the outer surface of the orchestration server.
//!
//! ```text
//!   browser ──WS /ws──────────┐
//!   Slack  ──POST /api/slack──┤
//!   GitHub ──POST /webhooks───┼──► NodeState {processes, councils, bridge,
//!   admin  ──GET /metrics ────┘         workflows, scheduler, notifications}
//!                                        │
//!                 WsHub topics: council · algochat · owner · workflow · …
//! ```
//!
//! Component broadcast streams are pumped into one topic hub; WebSocket
//! clients subscribe to topics (plus per-session `session:{id}` streams)
//! and receive `{type, ...}` JSON envelopes.

pub mod adapters;
pub mod auth;
pub mod hub;
pub mod metrics;
pub mod routes;
pub mod slack;
pub mod state;
pub mod webhooks;
pub mod ws;

pub use state::{NodeState, ProviderInfo};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tracing::info;

/// Build the full router over shared state.
pub fn build_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/metrics", get(metrics::metrics))
        .route("/.well-known/agent-card.json", get(routes::agent_card))
        .route("/api/providers", get(routes::providers))
        .route("/api/providers/:provider/models", get(routes::provider_models))
        .route("/api/webhooks", post(webhooks::create).get(webhooks::list))
        .route(
            "/api/webhooks/deliveries",
            get(webhooks::all_deliveries),
        )
        .route(
            "/api/webhooks/:id",
            get(webhooks::show).put(webhooks::update).delete(webhooks::remove),
        )
        .route("/api/webhooks/:id/deliveries", get(webhooks::deliveries))
        .route("/webhooks/github", post(webhooks::github_ingress))
        .route("/api/slack/events", post(slack::slack_events))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<NodeState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.bind_host, state.config.server.port
    )
    .parse()?;
    let router = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
