// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Subscription consumers — the two semantic reductions of the raw event
//! stream.
//!
//! **Consumer A** (chain response builder) exists once per
//! `(session, participant)` pair.  It tracks the text-block state machine,
//! posts trimmed status previews, schedules a delayed acknowledgement, emits
//! periodic progress summaries, and — exactly once, at session exit — posts
//! the final response.
//!
//! **Consumer B** (local WS streamer) exists once per session and forwards
//! thinking transitions, raw text deltas, and tool events to a swappable
//! sink, so a reconnecting WebSocket replaces the send function without
//! re-subscribing.
//!
//! Both consumers carry a subscription-side idle timer; on expiry they flush
//! once and unsubscribe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::events::ProcessEvent;
use crate::process::ProcessManager;

/// Delay before the "working on it" acknowledgement.
const ACK_DELAY: Duration = Duration::from_secs(10);
/// Cadence of progress summaries once the ack has fired.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(120);
/// Status previews are trimmed to this many characters.
const STATUS_PREVIEW_CHARS: usize = 300;
/// Bounded action history feeding the progress summary.
const PROGRESS_HISTORY: usize = 100;

/// What consumer A emits towards the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainFeedEvent {
    /// Intermediate status (previews, tool lines, ack, progress).
    Status(String),
    /// The single final response for the session.
    Final(String),
}

#[async_trait]
pub trait ChainFeed: Send + Sync {
    async fn deliver(&self, session_id: &str, participant: &str, event: ChainFeedEvent);
}

/// Swappable sink for consumer B.
pub trait WsSink: Send + Sync {
    fn send(&self, msg: serde_json::Value);
}

type SharedSink = Arc<Mutex<Arc<dyn WsSink>>>;

pub struct SubscriptionManager {
    processes: Arc<ProcessManager>,
    chain_active: Mutex<HashMap<(String, String), ()>>,
    ws_active: Mutex<HashMap<String, SharedSink>>,
    idle_timeout: Duration,
    self_ref: std::sync::Weak<Self>,
}

impl SubscriptionManager {
    pub fn new(processes: Arc<ProcessManager>, idle_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            processes,
            chain_active: Mutex::new(HashMap::new()),
            ws_active: Mutex::new(HashMap::new()),
            idle_timeout,
            self_ref: me.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("subscription manager alive")
    }

    /// Attach consumer A for `(session, participant)`.  A second attach for
    /// the same pair is a no-op.
    pub fn attach_chain(
        &self,
        session_id: &str,
        participant: &str,
        feed: Arc<dyn ChainFeed>,
    ) {
        let key = (session_id.to_string(), participant.to_string());
        {
            let mut active = self.chain_active.lock().unwrap();
            if active.contains_key(&key) {
                debug!(session_id, participant, "chain consumer already attached");
                return;
            }
            active.insert(key.clone(), ());
        }
        let this = self.arc();
        let session_id = session_id.to_string();
        let participant = participant.to_string();
        tokio::spawn(async move {
            run_chain_builder(&this, &session_id, &participant, feed).await;
            this.chain_active.lock().unwrap().remove(&(
                session_id.clone(),
                participant.clone(),
            ));
        });
    }

    /// Attach consumer B for a session.  Re-attaching swaps the sink in
    /// place and keeps the existing subscription.
    pub fn attach_ws(&self, session_id: &str, sink: Arc<dyn WsSink>) {
        {
            let mut active = self.ws_active.lock().unwrap();
            if let Some(shared) = active.get(session_id) {
                *shared.lock().unwrap() = sink;
                debug!(session_id, "ws sink replaced");
                return;
            }
            active.insert(session_id.to_string(), Arc::new(Mutex::new(sink)));
        }
        let shared = self
            .ws_active
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .expect("just inserted");
        let this = self.arc();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            run_ws_streamer(&this, &session_id, shared).await;
            this.ws_active.lock().unwrap().remove(&session_id);
        });
    }

    pub fn chain_consumer_count(&self) -> usize {
        self.chain_active.lock().unwrap().len()
    }
}

// ── Consumer A ────────────────────────────────────────────────────────────────

struct ChainState {
    current_text_block: Option<String>,
    last_text_block: Option<String>,
    last_turn_response: Option<String>,
    /// Fallback: every assistant text seen, in order.
    assistant_texts: Vec<String>,
    actions: Vec<String>,
    tool_calls: u64,
}

impl ChainState {
    fn new() -> Self {
        Self {
            current_text_block: None,
            last_text_block: None,
            last_turn_response: None,
            assistant_texts: Vec::new(),
            actions: Vec::new(),
            tool_calls: 0,
        }
    }

    fn record_action(&mut self, action: String) {
        if self.actions.len() == PROGRESS_HISTORY {
            self.actions.remove(0);
        }
        self.actions.push(action);
    }

    /// The single final response: the freshest completed block, else the
    /// last finished turn, else everything the assistant ever said.
    fn final_text(&mut self) -> String {
        if let Some(current) = self.current_text_block.take() {
            if !current.is_empty() {
                self.last_text_block = Some(current);
            }
        }
        self.last_text_block
            .take()
            .or_else(|| self.last_turn_response.take())
            .unwrap_or_else(|| self.assistant_texts.join("\n"))
    }
}

fn trim_preview(text: &str) -> String {
    if text.chars().count() <= STATUS_PREVIEW_CHARS {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(STATUS_PREVIEW_CHARS).collect();
        out.push('…');
        out
    }
}

async fn run_chain_builder(
    subs: &Arc<SubscriptionManager>,
    session_id: &str,
    participant: &str,
    feed: Arc<dyn ChainFeed>,
) {
    let mut sub = subs.processes.subscribe(session_id);
    let token = sub.token;
    let started = Instant::now();

    let mut state = ChainState::new();
    let mut ack_deadline: Option<Instant> = None;
    let mut ack_sent = false;
    let mut progress_at: Option<Instant> = None;
    let mut idle_deadline = Instant::now() + subs.idle_timeout;

    loop {
        tokio::select! {
            ev = sub.rx.recv() => {
                let Some(ev) = ev else { break };
                idle_deadline = Instant::now() + subs.idle_timeout;
                match &*ev.event {
                    ProcessEvent::Assistant { .. } => {
                        if let Some(text) = ev.event.assistant_text() {
                            state.assistant_texts.push(text);
                        }
                        if !ack_sent && ack_deadline.is_none() {
                            ack_deadline = Some(Instant::now() + ACK_DELAY);
                        }
                    }
                    ProcessEvent::ContentBlockStart { content_block } => {
                        if content_block.block_type == "text" {
                            state.current_text_block = Some(String::new());
                        } else if content_block.block_type == "tool_use" {
                            state.tool_calls += 1;
                            let name = content_block.name.clone().unwrap_or_default();
                            state.record_action(format!("tool: {name}"));
                        }
                    }
                    ProcessEvent::ContentBlockDelta { delta } => {
                        if let Some(buf) = state.current_text_block.as_mut() {
                            buf.push_str(&delta.text);
                        }
                    }
                    ProcessEvent::ContentBlockStop => {
                        if let Some(block) = state.current_text_block.take() {
                            if !block.is_empty() {
                                feed.deliver(
                                    session_id,
                                    participant,
                                    ChainFeedEvent::Status(trim_preview(&block)),
                                )
                                .await;
                                state.last_text_block = Some(block);
                            }
                        }
                    }
                    ProcessEvent::ToolStatus { message } => {
                        state.record_action(format!("status: {message}"));
                        feed.deliver(
                            session_id,
                            participant,
                            ChainFeedEvent::Status(message.clone()),
                        )
                        .await;
                        // A visible status means the participant knows work is
                        // happening: fire the pending ack immediately.
                        if !ack_sent && ack_deadline.is_some() {
                            ack_deadline = None;
                            ack_sent = true;
                            feed.deliver(
                                session_id,
                                participant,
                                ChainFeedEvent::Status("Working on it…".to_string()),
                            )
                            .await;
                            progress_at = Some(Instant::now() + PROGRESS_INTERVAL);
                        }
                    }
                    ProcessEvent::ToolUse { name, .. } => {
                        state.tool_calls += 1;
                        state.record_action(format!("tool: {name}"));
                    }
                    ProcessEvent::Result { .. } => {
                        // Result before the ack fired: the reply is imminent,
                        // no ack needed.
                        ack_deadline = None;
                        if let Some(block) = state.last_text_block.take() {
                            state.last_turn_response = Some(block);
                        }
                        state.current_text_block = None;
                    }
                    ProcessEvent::SessionExited { .. } => {
                        let text = state.final_text();
                        feed.deliver(session_id, participant, ChainFeedEvent::Final(text))
                            .await;
                        subs.processes.unsubscribe(session_id, token);
                        return;
                    }
                    _ => {}
                }
            }
            _ = sleep_opt(ack_deadline), if ack_deadline.is_some() => {
                ack_deadline = None;
                ack_sent = true;
                feed.deliver(
                    session_id,
                    participant,
                    ChainFeedEvent::Status("Working on it…".to_string()),
                )
                .await;
                progress_at = Some(Instant::now() + PROGRESS_INTERVAL);
            }
            _ = sleep_opt(progress_at), if progress_at.is_some() => {
                progress_at = Some(Instant::now() + PROGRESS_INTERVAL);
                let elapsed = started.elapsed().as_secs();
                let recent: Vec<&str> = state
                    .actions
                    .iter()
                    .rev()
                    .take(3)
                    .map(String::as_str)
                    .collect();
                let summary = format!(
                    "Still working ({}s elapsed, {} tool calls{}{})",
                    elapsed,
                    state.tool_calls,
                    if recent.is_empty() { "" } else { "; recent: " },
                    recent.join(", "),
                );
                feed.deliver(session_id, participant, ChainFeedEvent::Status(summary))
                    .await;
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                info!(session_id, participant, "chain consumer idle; final flush");
                let text = state.final_text();
                feed.deliver(session_id, participant, ChainFeedEvent::Final(text))
                    .await;
                subs.processes.unsubscribe(session_id, token);
                return;
            }
        }
    }

    // Stream closed without a session_exited (manager shut down): flush once.
    let text = state.final_text();
    feed.deliver(session_id, participant, ChainFeedEvent::Final(text))
        .await;
    subs.processes.unsubscribe(session_id, token);
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

// ── Consumer B ────────────────────────────────────────────────────────────────

async fn run_ws_streamer(subs: &Arc<SubscriptionManager>, session_id: &str, sink: SharedSink) {
    let mut sub = subs.processes.subscribe(session_id);
    let token = sub.token;

    let mut thinking = false;
    let mut turn_text = String::new();
    let mut idle_deadline = Instant::now() + subs.idle_timeout;

    let send = |msg: serde_json::Value| {
        let sink = sink.lock().unwrap().clone();
        sink.send(msg);
    };

    loop {
        tokio::select! {
            ev = sub.rx.recv() => {
                let Some(ev) = ev else { break };
                idle_deadline = Instant::now() + subs.idle_timeout;
                match &*ev.event {
                    ProcessEvent::Assistant { .. } | ProcessEvent::ContentBlockStart { .. }
                        if !thinking =>
                    {
                        thinking = true;
                        send(json!({"type": "thinking", "value": true}));
                        // Re-handle tool_use starts below by falling through is
                        // not possible in a match; tool starts emit on the next
                        // event anyway.
                        if let ProcessEvent::ContentBlockStart { content_block } = &*ev.event {
                            if content_block.block_type == "tool_use" {
                                send(json!({
                                    "type": "tool_use",
                                    "name": content_block.name.clone().unwrap_or_default(),
                                    "input": "",
                                }));
                            }
                        }
                    }
                    ProcessEvent::ContentBlockStart { content_block } => {
                        if content_block.block_type == "tool_use" {
                            send(json!({
                                "type": "tool_use",
                                "name": content_block.name.clone().unwrap_or_default(),
                                "input": "",
                            }));
                        }
                    }
                    ProcessEvent::ToolUse { name, input } => {
                        send(json!({
                            "type": "tool_use",
                            "name": name,
                            "input": input.to_string(),
                        }));
                    }
                    ProcessEvent::ContentBlockDelta { delta } => {
                        turn_text.push_str(&delta.text);
                        send(json!({"type": "stream", "chunk": delta.text, "done": false}));
                    }
                    ProcessEvent::Result { .. } => {
                        send(json!({"type": "stream", "chunk": "", "done": true}));
                        if thinking {
                            thinking = false;
                            send(json!({"type": "thinking", "value": false}));
                        }
                        if !turn_text.is_empty() {
                            send(json!({"type": "message", "content": turn_text}));
                            turn_text = String::new();
                        }
                    }
                    ProcessEvent::SessionExited { .. } => {
                        if !turn_text.is_empty() {
                            send(json!({"type": "message", "content": turn_text}));
                        }
                        if thinking {
                            send(json!({"type": "thinking", "value": false}));
                        }
                        send(json!({"type": "session_exited"}));
                        subs.processes.unsubscribe(session_id, token);
                        return;
                    }
                    ProcessEvent::Error { message } => {
                        send(json!({"type": "error", "message": message}));
                    }
                    _ => {}
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                if !turn_text.is_empty() {
                    send(json!({"type": "message", "content": turn_text}));
                }
                subs.processes.unsubscribe(session_id, token);
                return;
            }
        }
    }
    subs.processes.unsubscribe(session_id, token);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::ApprovalManager;
    use crate::credits::CreditService;
    use crate::mock::MockLauncher;
    use crate::process::{ChildLauncher, StartOptions};
    use quorum_config::CreditConfig;
    use quorum_db::sessions::NewSession;
    use quorum_db::Store;

    struct RecordingFeed {
        events: Mutex<Vec<ChainFeedEvent>>,
    }

    #[async_trait]
    impl ChainFeed for RecordingFeed {
        async fn deliver(&self, _session: &str, _participant: &str, event: ChainFeedEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct RecordingSink {
        msgs: Mutex<Vec<serde_json::Value>>,
    }

    impl WsSink for RecordingSink {
        fn send(&self, msg: serde_json::Value) {
            self.msgs.lock().unwrap().push(msg);
        }
    }

    struct Fixture {
        store: Arc<Store>,
        launcher: Arc<MockLauncher>,
        mgr: Arc<ProcessManager>,
        subs: Arc<SubscriptionManager>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let launcher = Arc::new(MockLauncher::new());
        let mgr = ProcessManager::new(
            Arc::clone(&store),
            Arc::clone(&launcher) as Arc<dyn ChildLauncher>,
            Arc::new(ApprovalManager::new()),
            Arc::new(CreditService::new(
                Arc::clone(&store),
                CreditConfig::default(),
            )),
            Duration::from_secs(3600),
        );
        let subs = SubscriptionManager::new(Arc::clone(&mgr), Duration::from_secs(600));
        Fixture {
            store,
            launcher,
            mgr,
            subs,
        }
    }

    async fn start(f: &Fixture, id: &str) -> crate::mock::MockChildHandle {
        let s = f
            .store
            .create_session(NewSession {
                id: id.to_string(),
                agent_id: "agent-1".to_string(),
                ..NewSession::default()
            })
            .unwrap();
        f.mgr
            .start_process(&s, "", StartOptions::default())
            .await
            .unwrap();
        f.launcher.handle(id)
    }

    fn feed() -> Arc<RecordingFeed> {
        Arc::new(RecordingFeed {
            events: Mutex::new(Vec::new()),
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_one_final_response_on_exit() {
        let f = fixture();
        let child = start(&f, "s1").await;
        let feed = feed();
        f.subs.attach_chain("s1", "ADDR", feed.clone());
        settle().await;

        child
            .send_line(r#"{"type":"content_block_start","content_block":{"type":"text"}}"#)
            .await;
        child
            .send_line(r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"the answer"}}"#)
            .await;
        child.send_line(r#"{"type":"content_block_stop"}"#).await;
        child.send_line(r#"{"type":"result"}"#).await;
        child.send_line(r#"{"type":"session_exited","code":0}"#).await;
        settle().await;

        let events = feed.events.lock().unwrap();
        let finals: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ChainFeedEvent::Final(_)))
            .collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(*finals[0], ChainFeedEvent::Final("the answer".to_string()));
        // The completed block also produced a status preview.
        assert!(events
            .iter()
            .any(|e| matches!(e, ChainFeedEvent::Status(s) if s == "the answer")));
    }

    #[tokio::test(start_paused = true)]
    async fn mid_turn_exit_prefers_last_completed_block() {
        let f = fixture();
        let child = start(&f, "s1").await;
        let feed = feed();
        f.subs.attach_chain("s1", "ADDR", feed.clone());
        settle().await;

        // Turn 1 completes, then a new block finishes without a result.
        child
            .send_line(r#"{"type":"content_block_start","content_block":{"type":"text"}}"#)
            .await;
        child
            .send_line(r#"{"type":"content_block_delta","delta":{"text":"turn one"}}"#)
            .await;
        child.send_line(r#"{"type":"content_block_stop"}"#).await;
        child.send_line(r#"{"type":"result"}"#).await;
        child
            .send_line(r#"{"type":"content_block_start","content_block":{"type":"text"}}"#)
            .await;
        child
            .send_line(r#"{"type":"content_block_delta","delta":{"text":"fresher"}}"#)
            .await;
        child.send_line(r#"{"type":"content_block_stop"}"#).await;
        child.send_line(r#"{"type":"session_exited","code":0}"#).await;
        settle().await;

        let events = feed.events.lock().unwrap();
        assert!(events.contains(&ChainFeedEvent::Final("fresher".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_fires_after_delay_unless_result_arrives() {
        let f = fixture();
        let child = start(&f, "s1").await;
        let feed1 = feed();
        f.subs.attach_chain("s1", "ADDR", feed1.clone());
        settle().await;

        child
            .send_line(r#"{"type":"assistant","message":{"content":[]}}"#)
            .await;
        settle().await;
        tokio::time::sleep(ACK_DELAY + Duration::from_secs(1)).await;
        assert!(feed1
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, ChainFeedEvent::Status(s) if s.contains("Working on it"))));

        // A second session where the result lands before the delay: no ack.
        let child2 = start(&f, "s2").await;
        let feed2 = feed();
        f.subs.attach_chain("s2", "ADDR", feed2.clone());
        settle().await;
        child2
            .send_line(r#"{"type":"assistant","message":{"content":[]}}"#)
            .await;
        settle().await;
        child2.send_line(r#"{"type":"result"}"#).await;
        settle().await;
        tokio::time::sleep(ACK_DELAY + Duration::from_secs(1)).await;
        assert!(!feed2
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, ChainFeedEvent::Status(s) if s.contains("Working on it"))));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_summaries_follow_the_ack() {
        let f = fixture();
        let child = start(&f, "s1").await;
        let feed = feed();
        f.subs.attach_chain("s1", "ADDR", feed.clone());
        settle().await;

        child
            .send_line(r#"{"type":"assistant","message":{"content":[]}}"#)
            .await;
        child
            .send_line(r#"{"type":"tool_use","name":"grep","input":{}}"#)
            .await;
        settle().await;
        tokio::time::sleep(ACK_DELAY + PROGRESS_INTERVAL + Duration::from_secs(2)).await;

        let events = feed.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, ChainFeedEvent::Status(s) if s.contains("Still working"))));
        assert!(events
            .iter()
            .any(|e| matches!(e, ChainFeedEvent::Status(s) if s.contains("1 tool calls"))));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_status_forwards_and_fires_pending_ack() {
        let f = fixture();
        let child = start(&f, "s1").await;
        let feed = feed();
        f.subs.attach_chain("s1", "ADDR", feed.clone());
        settle().await;

        child
            .send_line(r#"{"type":"assistant","message":{"content":[]}}"#)
            .await;
        settle().await;
        child
            .send_line(r#"{"type":"tool_status","message":"compiling"}"#)
            .await;
        settle().await;

        let events = feed.events.lock().unwrap().clone();
        assert!(events.contains(&ChainFeedEvent::Status("compiling".to_string())));
        assert!(events
            .iter()
            .any(|e| matches!(e, ChainFeedEvent::Status(s) if s.contains("Working on it"))));
    }

    #[tokio::test(start_paused = true)]
    async fn status_preview_is_trimmed() {
        let f = fixture();
        let child = start(&f, "s1").await;
        let feed = feed();
        f.subs.attach_chain("s1", "ADDR", feed.clone());
        settle().await;

        let long = "x".repeat(500);
        child
            .send_line(r#"{"type":"content_block_start","content_block":{"type":"text"}}"#)
            .await;
        child
            .send_line(&format!(
                r#"{{"type":"content_block_delta","delta":{{"text":"{long}"}}}}"#
            ))
            .await;
        child.send_line(r#"{"type":"content_block_stop"}"#).await;
        settle().await;

        let events = feed.events.lock().unwrap();
        let ChainFeedEvent::Status(preview) = &events[0] else {
            panic!("expected status preview");
        };
        assert_eq!(preview.chars().count(), STATUS_PREVIEW_CHARS + 1); // + ellipsis
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_chain_attach_is_noop() {
        let f = fixture();
        let _child = start(&f, "s1").await;
        let feed1 = feed();
        let feed2 = feed();
        f.subs.attach_chain("s1", "ADDR", feed1);
        f.subs.attach_chain("s1", "ADDR", feed2);
        settle().await;
        assert_eq!(f.subs.chain_consumer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_flushes_once_and_unsubscribes() {
        let f = fixture();
        let child = start(&f, "s1").await;
        let feed = feed();
        f.subs.attach_chain("s1", "ADDR", feed.clone());
        settle().await;

        child
            .send_line(r#"{"type":"content_block_start","content_block":{"type":"text"}}"#)
            .await;
        child
            .send_line(r#"{"type":"content_block_delta","delta":{"text":"partial"}}"#)
            .await;
        settle().await;

        tokio::time::sleep(Duration::from_secs(601)).await;
        settle().await;

        let events = feed.events.lock().unwrap();
        let finals: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ChainFeedEvent::Final(_)))
            .collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(*finals[0], ChainFeedEvent::Final("partial".to_string()));
        assert_eq!(f.subs.chain_consumer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ws_streamer_emits_thinking_stream_and_message() {
        let f = fixture();
        let child = start(&f, "s1").await;
        let sink = Arc::new(RecordingSink {
            msgs: Mutex::new(Vec::new()),
        });
        f.subs.attach_ws("s1", sink.clone());
        settle().await;

        child
            .send_line(r#"{"type":"content_block_start","content_block":{"type":"text"}}"#)
            .await;
        child
            .send_line(r#"{"type":"content_block_delta","delta":{"text":"hel"}}"#)
            .await;
        child
            .send_line(r#"{"type":"content_block_delta","delta":{"text":"lo"}}"#)
            .await;
        child.send_line(r#"{"type":"result"}"#).await;
        settle().await;

        let msgs = sink.msgs.lock().unwrap();
        assert_eq!(msgs[0]["type"], "thinking");
        assert_eq!(msgs[0]["value"], true);
        let chunks: Vec<_> = msgs
            .iter()
            .filter(|m| m["type"] == "stream" && m["done"] == false)
            .map(|m| m["chunk"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(chunks, vec!["hel", "lo"]);
        assert!(msgs
            .iter()
            .any(|m| m["type"] == "stream" && m["done"] == true));
        assert!(msgs
            .iter()
            .any(|m| m["type"] == "message" && m["content"] == "hello"));
        assert!(msgs
            .iter()
            .any(|m| m["type"] == "thinking" && m["value"] == false));
    }

    #[tokio::test(start_paused = true)]
    async fn ws_sink_is_swappable() {
        let f = fixture();
        let child = start(&f, "s1").await;
        let sink1 = Arc::new(RecordingSink {
            msgs: Mutex::new(Vec::new()),
        });
        let sink2 = Arc::new(RecordingSink {
            msgs: Mutex::new(Vec::new()),
        });
        f.subs.attach_ws("s1", sink1.clone());
        settle().await;
        f.subs.attach_ws("s1", sink2.clone());
        settle().await;

        child
            .send_line(r#"{"type":"content_block_start","content_block":{"type":"text"}}"#)
            .await;
        settle().await;

        assert!(sink1.msgs.lock().unwrap().is_empty());
        assert!(!sink2.msgs.lock().unwrap().is_empty());
    }
}
