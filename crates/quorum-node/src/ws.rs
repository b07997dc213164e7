// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket bridge — topic subscriptions in, `{type, ...}` envelopes out.
//!
//! Authentication happens before the upgrade per the configured mode
//! (bearer header or `?token=` query parameter).  After the upgrade the
//! client manages its topic set with `subscribe` messages; `chat` messages
//! route text into a local agent session whose stream is re-published on
//! the `session:{id}` topic through consumer B.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quorum_core::approvals::ApprovalDecision;
use quorum_core::process::StartOptions;
use quorum_core::subscription::WsSink;
use quorum_db::sessions::NewSession;
use quorum_db::{SessionSource, SessionStatus};

use crate::auth;
use crate::hub::WsHub;
use crate::state::NodeState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    /// Comma-separated initial topic list.
    pub topics: Option<String>,
}

/// Sink that re-publishes a session's consumer-B stream on its hub topic.
struct HubSink {
    hub: Arc<WsHub>,
    topic: String,
}

impl WsSink for HubSink {
    fn send(&self, msg: serde_json::Value) {
        self.hub.publish(&self.topic, msg);
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<NodeState>>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Err(resp) = auth::check_ws(
        &headers,
        query.token.as_deref(),
        &state.config.server.auth,
        state.config.server.admin_api_key.as_deref(),
    ) {
        return resp;
    }
    let initial_topics: HashSet<String> = query
        .topics
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    ws.on_upgrade(move |socket| handle_socket(socket, state, initial_topics))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        topics: Vec<String>,
    },
    Unsubscribe {
        topics: Vec<String>,
    },
    Chat {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        agent_id: Option<String>,
        text: String,
    },
    Approve {
        short_id: String,
        #[serde(default = "default_true")]
        approve: bool,
    },
    Answer {
        short_id: String,
        text: String,
    },
}

fn default_true() -> bool {
    true
}

async fn handle_socket(mut socket: WebSocket, state: Arc<NodeState>, topics: HashSet<String>) {
    state.hub.client_connected();
    let mut topics = topics;
    let mut hub_rx = state.hub.subscribe();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(cmd) => {
                                if let Some(reply) =
                                    handle_client_message(cmd, &state, &mut topics).await
                                {
                                    send_json(&mut socket, &reply).await;
                                }
                            }
                            Err(e) => {
                                send_json(
                                    &mut socket,
                                    &json!({"type": "error", "message": format!("invalid message: {e}")}),
                                )
                                .await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!("websocket recv error: {e}");
                        break;
                    }
                }
            }
            result = hub_rx.recv() => {
                match result {
                    Ok(msg) => {
                        if topics.contains(&msg.topic) {
                            send_json(&mut socket, &msg.payload).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("websocket client lagged by {n} events");
                        send_json(
                            &mut socket,
                            &json!({"type": "error", "message": format!("event stream lagged by {n} events")}),
                        )
                        .await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    state.hub.client_disconnected();
    debug!("websocket connection closed");
}

async fn handle_client_message(
    cmd: ClientMessage,
    state: &Arc<NodeState>,
    topics: &mut HashSet<String>,
) -> Option<serde_json::Value> {
    match cmd {
        ClientMessage::Subscribe { topics: new } => {
            topics.extend(new);
            None
        }
        ClientMessage::Unsubscribe { topics: gone } => {
            for t in gone {
                topics.remove(&t);
            }
            None
        }
        ClientMessage::Chat {
            session_id,
            agent_id,
            text,
        } => match chat(state, session_id, agent_id, &text).await {
            Ok(session_id) => {
                topics.insert(format!("session:{session_id}"));
                Some(json!({"type": "chat_accepted", "session_id": session_id}))
            }
            Err(e) => Some(json!({"type": "error", "message": e.to_string()})),
        },
        ClientMessage::Approve { short_id, approve } => {
            let decision = if approve {
                ApprovalDecision::Approve
            } else {
                ApprovalDecision::Deny
            };
            // The local WS is the owner surface; no sender address to match.
            match state.processes.resolve_approval(&short_id, decision, None) {
                Ok(()) => Some(json!({"type": "approval_resolved", "short_id": short_id})),
                Err(e) => Some(json!({"type": "error", "message": e.to_string()})),
            }
        }
        ClientMessage::Answer { short_id, text } => {
            if state.notifications.answer_question(&short_id, &text, "local-ws") {
                Some(json!({"type": "answer_accepted", "short_id": short_id}))
            } else {
                Some(json!({"type": "error", "message": "no pending question with that id"}))
            }
        }
    }
}

/// Route chat text into a session.  An agent keeps at most one live local
/// chat session — an existing running web session for the agent is reused.
async fn chat(
    state: &Arc<NodeState>,
    session_id: Option<String>,
    agent_id: Option<String>,
    text: &str,
) -> anyhow::Result<String> {
    // Explicit session target.
    if let Some(sid) = session_id {
        let session = state.store.get_session(&sid)?;
        attach_hub_streamer(state, &sid);
        if state.processes.is_running(&sid) {
            state.processes.send_message(&sid, text).await;
        } else {
            state.processes.resume_process(&session, text).await?;
        }
        return Ok(sid);
    }

    let agent_id = match agent_id {
        Some(id) => id,
        None => state
            .store
            .list_agents()?
            .first()
            .map(|a| a.id.clone())
            .ok_or_else(|| anyhow::anyhow!("no agents configured"))?,
    };

    // Reuse the agent's live local chat session if one exists.
    let live = state
        .store
        .list_sessions()?
        .into_iter()
        .find(|s| {
            s.agent_id == agent_id
                && s.source == SessionSource::Web
                && s.status == SessionStatus::Running
        });
    if let Some(session) = live {
        attach_hub_streamer(state, &session.id);
        state.processes.send_message(&session.id, text).await;
        return Ok(session.id);
    }

    let session_id = Uuid::new_v4().to_string();
    let session = state.store.create_session(NewSession {
        id: session_id.clone(),
        agent_id,
        name: "local chat".to_string(),
        source: Some(SessionSource::Web),
        initial_prompt: text.to_string(),
        ..NewSession::default()
    })?;
    attach_hub_streamer(state, &session_id);
    state
        .processes
        .start_process(&session, text, StartOptions::default())
        .await?;
    info!(session_id, "local chat session started");
    Ok(session_id)
}

fn attach_hub_streamer(state: &Arc<NodeState>, session_id: &str) {
    let sink = Arc::new(HubSink {
        hub: Arc::clone(&state.hub),
        topic: format!("session:{session_id}"),
    });
    state.subscriptions.attach_ws(session_id, sink);
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) {
    if let Ok(text) = serde_json::to_string(value) {
        let _ = socket.send(Message::Text(text)).await;
    }
}
