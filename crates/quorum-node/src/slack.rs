// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Slack Events API ingress.
//!
//! Every incoming request is verified via **HMAC-SHA256** using the Slack
//! signing secret:
//!
//! 1. Slack sends `X-Slack-Signature: v0=<hmac>` and
//!    `X-Slack-Request-Timestamp: <unix_ts>`.
//! 2. We compute `HMAC-SHA256(signing_secret, "v0:" + timestamp + ":" + body)`.
//! 3. We compare in constant time (`subtle::ConstantTimeEq`).
//! 4. We reject requests with a timestamp more than 5 minutes old (replay
//!    protection).
//!
//! Verified `message` events are deduplicated (Slack retries aggressively),
//! rate-limited per user, and routed into an agent session keyed by the
//! Slack channel for conversation continuity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quorum_core::process::StartOptions;
use quorum_db::sessions::NewSession;
use quorum_db::SessionSource;

use crate::state::NodeState;

const SLACK_DEDUP_NS: &str = "slack-event";
/// Messages allowed per user per window.
const RATE_LIMIT: u32 = 10;
const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SlackPayload {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        event: SlackEvent,
        #[serde(default)]
        event_id: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SlackEvent {
    Message {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        channel: String,
        #[serde(default)]
        user: String,
        #[serde(default)]
        bot_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

pub async fn slack_events(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.config.slack.enabled {
        return (StatusCode::SERVICE_UNAVAILABLE, "slack disabled").into_response();
    }
    let Some(secret) = &state.config.slack.signing_secret else {
        return (StatusCode::SERVICE_UNAVAILABLE, "slack signing secret missing").into_response();
    };

    // Verify HMAC before touching the body.
    let timestamp = headers
        .get("x-slack-request-timestamp")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let provided_sig = headers
        .get("x-slack-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if let Err(e) = verify_slack_signature(secret.as_bytes(), timestamp, &body, provided_sig) {
        warn!("slack signature verification failed: {e}");
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let payload: SlackPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!("failed to parse slack payload: {e}");
            return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
        }
    };

    match payload {
        SlackPayload::UrlVerification { challenge } => {
            // Slack sends this once when the webhook is first configured.
            (StatusCode::OK, challenge).into_response()
        }
        SlackPayload::EventCallback { event, event_id } => {
            if !event_id.is_empty() && state.dedup.is_duplicate(SLACK_DEDUP_NS, &event_id) {
                return (StatusCode::OK, "duplicate").into_response();
            }
            handle_slack_event(event, &state).await;
            StatusCode::OK.into_response()
        }
        SlackPayload::Other => StatusCode::OK.into_response(),
    }
}

async fn handle_slack_event(event: SlackEvent, state: &Arc<NodeState>) {
    let SlackEvent::Message {
        text,
        channel,
        user,
        bot_id,
    } = event
    else {
        debug!("unhandled slack event type");
        return;
    };
    // Our own bot's messages echo back as events.
    if bot_id.is_some() {
        return;
    }
    let Some(text) = text.filter(|t| !t.is_empty()) else {
        return;
    };
    if rate_limited(&user) {
        warn!(user, "slack user rate limited");
        return;
    }

    // One session per Slack channel; reuse while it is running.
    let existing = state
        .store
        .list_sessions()
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.source == SessionSource::Slack && s.name == channel);
    if let Some(session) = existing {
        if state.processes.is_running(&session.id) {
            let _ = state.processes.send_message(&session.id, &text).await;
            return;
        }
        if state
            .processes
            .resume_process(&session, &text)
            .await
            .is_ok()
        {
            return;
        }
    }

    let Some(agent) = state
        .store
        .list_agents()
        .unwrap_or_default()
        .into_iter()
        .next()
    else {
        warn!("slack message but no agents configured");
        return;
    };
    let session_id = Uuid::new_v4().to_string();
    let session = match state.store.create_session(NewSession {
        id: session_id.clone(),
        agent_id: agent.id,
        name: channel.clone(),
        source: Some(SessionSource::Slack),
        initial_prompt: text.clone(),
        ..NewSession::default()
    }) {
        Ok(s) => s,
        Err(e) => {
            warn!("slack session create failed: {e}");
            return;
        }
    };
    if let Err(e) = state
        .processes
        .start_process(&session, &text, StartOptions::default())
        .await
    {
        warn!("slack session start failed: {e}");
        return;
    }
    info!(channel, session_id, "slack message routed");
}

fn rate_limited(user: &str) -> bool {
    static WINDOWS: OnceLock<Mutex<HashMap<String, (Instant, u32)>>> = OnceLock::new();
    let windows = WINDOWS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut windows = windows.lock().unwrap();
    let entry = windows
        .entry(user.to_string())
        .or_insert_with(|| (Instant::now(), 0));
    if entry.0.elapsed() > RATE_WINDOW {
        *entry = (Instant::now(), 0);
    }
    entry.1 += 1;
    entry.1 > RATE_LIMIT
}

// ── HMAC-SHA256 signature verification ───────────────────────────────────────

/// Verify a Slack request signature.
fn verify_slack_signature(
    secret: &[u8],
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> Result<(), &'static str> {
    let ts: u64 = timestamp.parse().map_err(|_| "bad timestamp")?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if now.abs_diff(ts) > 300 {
        return Err("timestamp outside replay window");
    }

    let Some(hex_sig) = provided.strip_prefix("v0=") else {
        return Err("missing v0 prefix");
    };
    let expected = hex::decode(hex_sig).map_err(|_| "non-hex signature")?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    if bool::from(computed.ct_eq(&expected[..])) {
        Ok(())
    } else {
        Err("signature mismatch")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn now_ts() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            .to_string()
    }

    #[test]
    fn valid_signature_passes() {
        let ts = now_ts();
        let sig = sign(b"secret", &ts, b"payload");
        assert!(verify_slack_signature(b"secret", &ts, b"payload", &sig).is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let ts = now_ts();
        let sig = sign(b"other", &ts, b"payload");
        assert!(verify_slack_signature(b"secret", &ts, b"payload", &sig).is_err());
    }

    #[test]
    fn stale_timestamp_fails_replay_window() {
        let ts = "1000000000"; // long ago
        let sig = sign(b"secret", ts, b"payload");
        assert_eq!(
            verify_slack_signature(b"secret", ts, b"payload", &sig),
            Err("timestamp outside replay window")
        );
    }

    #[test]
    fn malformed_signature_fails() {
        let ts = now_ts();
        assert!(verify_slack_signature(b"secret", &ts, b"payload", "nope").is_err());
        assert!(verify_slack_signature(b"secret", &ts, b"payload", "v0=zz").is_err());
    }
}
