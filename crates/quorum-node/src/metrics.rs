// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Prometheus text rendering, hand-rolled from component counters.
//! Admin-gated through the bearer token when `ADMIN_API_KEY` is set.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::auth;
use crate::state::NodeState;

pub async fn metrics(State(state): State<Arc<NodeState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = auth::check_admin(&headers, state.config.server.admin_api_key.as_deref()) {
        return resp;
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        render(&state),
    )
        .into_response()
}

pub fn render(state: &NodeState) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# HELP quorum_uptime_seconds Server uptime.");
    let _ = writeln!(out, "# TYPE quorum_uptime_seconds gauge");
    let _ = writeln!(out, "quorum_uptime_seconds {}", state.uptime_secs());

    let _ = writeln!(out, "# HELP quorum_active_sessions Running sub-processes.");
    let _ = writeln!(out, "# TYPE quorum_active_sessions gauge");
    let _ = writeln!(
        out,
        "quorum_active_sessions {}",
        state.processes.active_session_ids().len()
    );

    let _ = writeln!(out, "# HELP quorum_ws_clients Connected WebSocket clients.");
    let _ = writeln!(out, "# TYPE quorum_ws_clients gauge");
    let _ = writeln!(out, "quorum_ws_clients {}", state.hub.client_count());

    let _ = writeln!(
        out,
        "# HELP quorum_pending_approvals Tool approvals awaiting an owner."
    );
    let _ = writeln!(out, "# TYPE quorum_pending_approvals gauge");
    let _ = writeln!(
        out,
        "quorum_pending_approvals {}",
        state.processes.approvals().outstanding()
    );

    let _ = writeln!(
        out,
        "# HELP quorum_dedup_entries Entries per dedup namespace."
    );
    let _ = writeln!(out, "# TYPE quorum_dedup_entries gauge");
    for ns in state.dedup.metrics() {
        let _ = writeln!(
            out,
            "quorum_dedup_entries{{namespace=\"{}\"}} {}",
            ns.namespace, ns.size
        );
        let _ = writeln!(
            out,
            "quorum_dedup_hits_total{{namespace=\"{}\"}} {}",
            ns.namespace, ns.hits
        );
        let _ = writeln!(
            out,
            "quorum_dedup_misses_total{{namespace=\"{}\"}} {}",
            ns.namespace, ns.misses
        );
        let _ = writeln!(
            out,
            "quorum_dedup_evictions_total{{namespace=\"{}\"}} {}",
            ns.namespace, ns.evictions
        );
    }

    out
}
