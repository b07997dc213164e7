// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Notification fan-out and the blocking ask-owner bus.
//!
//! `notify` persists one row and attempts delivery on every channel the agent
//! has configured, plus the local WS `owner` topic.  `ask_owner` parks the
//! caller on a oneshot until any authorised responder answers (correlated by
//! short id) or the timeout elapses — exactly one resolution either way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use quorum_db::{NotificationRow, Store};

/// Ask-owner timeouts are clamped to this range (minutes).
const MIN_TIMEOUT_MIN: u64 = 1;
const MAX_TIMEOUT_MIN: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warning,
    Success,
    Error,
}

impl NotifyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notify {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub title: Option<String>,
    pub message: String,
    pub level: NotifyLevel,
}

/// One outbound delivery endpoint ("send a text message to this endpoint
/// identified by this opaque config").
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_type(&self) -> &'static str;
    async fn send(&self, config: &Value, text: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct AskOwnerRequest {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub question: String,
    pub options: Vec<String>,
    pub context: Option<String>,
    pub timeout_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AskOwnerResult {
    Answer { text: String, responder: String },
    /// Nobody answered within the window.
    NoResponse,
}

struct PendingQuestion {
    answer_tx: oneshot::Sender<(String, String)>,
}

pub struct NotificationBus {
    store: Arc<Store>,
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    owner_topic: broadcast::Sender<Value>,
    questions: Mutex<HashMap<String, PendingQuestion>>,
}

impl NotificationBus {
    pub fn new(store: Arc<Store>, adapters: Vec<Arc<dyn ChannelAdapter>>) -> Arc<Self> {
        let (owner_topic, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            adapters,
            owner_topic,
            questions: Mutex::new(HashMap::new()),
        })
    }

    /// Local WS `owner` topic feed.
    pub fn subscribe_owner_topic(&self) -> broadcast::Receiver<Value> {
        self.owner_topic.subscribe()
    }

    /// Persist and fan out one notification.  Returns the notification id
    /// and the channel types actually attempted.
    pub async fn notify(&self, n: Notify) -> anyhow::Result<(String, Vec<String>)> {
        let id = Uuid::new_v4().to_string();
        self.store.insert_notification(&NotificationRow {
            id: id.clone(),
            agent_id: n.agent_id.clone(),
            session_id: n.session_id.clone(),
            title: n.title.clone(),
            message: n.message.clone(),
            level: n.level.as_str().to_string(),
            created_at: String::new(),
        })?;

        let mut attempted = Vec::new();
        let channels = self.store.notification_channels(&n.agent_id)?;
        let text = match &n.title {
            Some(title) => format!("{title}\n{}", n.message),
            None => n.message.clone(),
        };
        for channel in &channels {
            let Some(adapter) = self
                .adapters
                .iter()
                .find(|a| a.channel_type() == channel.channel_type)
            else {
                continue;
            };
            attempted.push(channel.channel_type.clone());
            if let Err(e) = adapter.send(&channel.config, &text).await {
                warn!(
                    agent_id = %n.agent_id,
                    channel = %channel.channel_type,
                    "notification delivery failed: {e}"
                );
            }
        }

        let _ = self.owner_topic.send(json!({
            "type": "agent_notification",
            "id": id,
            "agent_id": n.agent_id,
            "session_id": n.session_id,
            "title": n.title,
            "message": n.message,
            "level": n.level.as_str(),
        }));

        Ok((id, attempted))
    }

    /// Ask the owner a question and block until an answer or the timeout.
    pub async fn ask_owner(&self, req: AskOwnerRequest) -> AskOwnerResult {
        let short_id = short_question_id();
        let (answer_tx, answer_rx) = oneshot::channel();
        self.questions
            .lock()
            .unwrap()
            .insert(short_id.clone(), PendingQuestion { answer_tx });

        let timeout_min = req.timeout_minutes.clamp(MIN_TIMEOUT_MIN, MAX_TIMEOUT_MIN);
        info!(short_id, timeout_min, "question dispatched to owner");

        // Dispatch on every configured channel; the short id is the reply
        // correlation key on every one of them.
        let mut text = format!("[{short_id}] {}", req.question);
        if !req.options.is_empty() {
            text.push_str("\nOptions: ");
            text.push_str(&req.options.join(" | "));
        }
        if let Some(ctx) = &req.context {
            text.push_str("\n");
            text.push_str(ctx);
        }
        let channels = self
            .store
            .notification_channels(&req.agent_id)
            .unwrap_or_default();
        for channel in &channels {
            if let Some(adapter) = self
                .adapters
                .iter()
                .find(|a| a.channel_type() == channel.channel_type)
            {
                if let Err(e) = adapter.send(&channel.config, &text).await {
                    warn!(channel = %channel.channel_type, "question delivery failed: {e}");
                }
            }
        }
        let _ = self.owner_topic.send(json!({
            "type": "agent_question",
            "short_id": short_id,
            "agent_id": req.agent_id,
            "session_id": req.session_id,
            "question": req.question,
            "options": req.options,
        }));

        let result = tokio::time::timeout(
            Duration::from_secs(timeout_min * 60),
            answer_rx,
        )
        .await;
        // Whatever happened, the question is no longer pending.
        self.questions.lock().unwrap().remove(&short_id);

        match result {
            Ok(Ok((text, responder))) => AskOwnerResult::Answer { text, responder },
            Ok(Err(_)) => AskOwnerResult::NoResponse,
            Err(_) => {
                debug!(short_id, "question timed out");
                AskOwnerResult::NoResponse
            }
        }
    }

    /// Deliver an answer from any ingress.  Unknown ids (already answered,
    /// timed out, or mistyped) report false.
    pub fn answer_question(&self, short_id: &str, answer: &str, responder: &str) -> bool {
        let entry = self.questions.lock().unwrap().remove(short_id);
        match entry {
            Some(q) => q
                .answer_tx
                .send((answer.to_string(), responder.to_string()))
                .is_ok(),
            None => false,
        }
    }

    pub fn pending_questions(&self) -> usize {
        self.questions.lock().unwrap().len()
    }
}

fn short_question_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:04x}", rng.gen_range(0u32..0x10000))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_db::NotificationChannelRow;

    struct RecordingAdapter {
        kind: &'static str,
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn channel_type(&self) -> &'static str {
            self.kind
        }
        async fn send(&self, _config: &Value, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            if self.fail {
                anyhow::bail!("simulated failure");
            }
            Ok(())
        }
    }

    fn store_with_channel(kinds: &[&str]) -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for (i, kind) in kinds.iter().enumerate() {
            store
                .add_notification_channel(&NotificationChannelRow {
                    id: format!("ch{i}"),
                    agent_id: "a1".to_string(),
                    channel_type: kind.to_string(),
                    config: json!({}),
                    enabled: true,
                })
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn notify_reports_attempted_channels() {
        let store = store_with_channel(&["discord", "telegram"]);
        let discord = Arc::new(RecordingAdapter {
            kind: "discord",
            sent: Mutex::new(Vec::new()),
            fail: false,
        });
        let bus = NotificationBus::new(store, vec![discord.clone()]);

        let (_id, attempted) = bus
            .notify(Notify {
                agent_id: "a1".to_string(),
                session_id: None,
                title: Some("Build".to_string()),
                message: "done".to_string(),
                level: NotifyLevel::Success,
            })
            .await
            .unwrap();

        // telegram has no adapter registered: only discord was attempted.
        assert_eq!(attempted, vec!["discord"]);
        assert_eq!(discord.sent.lock().unwrap().len(), 1);
        assert!(discord.sent.lock().unwrap()[0].contains("Build"));
    }

    #[tokio::test]
    async fn notify_survives_adapter_failure() {
        let store = store_with_channel(&["discord"]);
        let discord = Arc::new(RecordingAdapter {
            kind: "discord",
            sent: Mutex::new(Vec::new()),
            fail: true,
        });
        let bus = NotificationBus::new(store, vec![discord]);
        let (_, attempted) = bus
            .notify(Notify {
                agent_id: "a1".to_string(),
                session_id: None,
                title: None,
                message: "m".to_string(),
                level: NotifyLevel::Error,
            })
            .await
            .unwrap();
        assert_eq!(attempted, vec!["discord"]);
    }

    #[tokio::test]
    async fn notify_broadcasts_on_owner_topic() {
        let store = store_with_channel(&[]);
        let bus = NotificationBus::new(store, Vec::new());
        let mut rx = bus.subscribe_owner_topic();
        bus.notify(Notify {
            agent_id: "a1".to_string(),
            session_id: None,
            title: None,
            message: "hello".to_string(),
            level: NotifyLevel::Info,
        })
        .await
        .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["type"], "agent_notification");
        assert_eq!(msg["message"], "hello");
    }

    #[tokio::test]
    async fn ask_owner_resolves_with_answer() {
        let store = store_with_channel(&[]);
        let bus = NotificationBus::new(store, Vec::new());
        let mut rx = bus.subscribe_owner_topic();

        let bus2 = Arc::clone(&bus);
        let ask = tokio::spawn(async move {
            bus2.ask_owner(AskOwnerRequest {
                agent_id: "a1".to_string(),
                session_id: None,
                question: "deploy?".to_string(),
                options: vec!["yes".to_string(), "no".to_string()],
                context: None,
                timeout_minutes: 5,
            })
            .await
        });

        // Pull the short id off the owner topic and answer through it.
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["type"], "agent_question");
        let short_id = msg["short_id"].as_str().unwrap().to_string();
        assert!(bus.answer_question(&short_id, "yes", "OWNER"));

        let result = ask.await.unwrap();
        assert_eq!(
            result,
            AskOwnerResult::Answer {
                text: "yes".to_string(),
                responder: "OWNER".to_string()
            }
        );
        assert_eq!(bus.pending_questions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ask_owner_times_out_to_sentinel() {
        let store = store_with_channel(&[]);
        let bus = NotificationBus::new(store, Vec::new());
        let result = bus
            .ask_owner(AskOwnerRequest {
                agent_id: "a1".to_string(),
                session_id: None,
                question: "anyone?".to_string(),
                options: Vec::new(),
                context: None,
                timeout_minutes: 1,
            })
            .await;
        assert_eq!(result, AskOwnerResult::NoResponse);
        assert_eq!(bus.pending_questions(), 0);
        // Late answers are rejected.
        assert!(!bus.answer_question("dead", "yes", "OWNER"));
    }

    #[tokio::test]
    async fn multiple_questions_are_independent() {
        let store = store_with_channel(&[]);
        let bus = NotificationBus::new(store, Vec::new());
        let mut rx = bus.subscribe_owner_topic();

        let spawn_ask = |bus: Arc<NotificationBus>, q: &str| {
            let q = q.to_string();
            tokio::spawn(async move {
                bus.ask_owner(AskOwnerRequest {
                    agent_id: "a1".to_string(),
                    session_id: Some("s1".to_string()),
                    question: q,
                    options: Vec::new(),
                    context: None,
                    timeout_minutes: 5,
                })
                .await
            })
        };
        let ask1 = spawn_ask(Arc::clone(&bus), "first?");
        let ask2 = spawn_ask(Arc::clone(&bus), "second?");

        let m1 = rx.recv().await.unwrap();
        let m2 = rx.recv().await.unwrap();
        let (first, second) = if m1["question"] == "first?" {
            (m1, m2)
        } else {
            (m2, m1)
        };
        bus.answer_question(second["short_id"].as_str().unwrap(), "B", "OWNER");
        bus.answer_question(first["short_id"].as_str().unwrap(), "A", "OWNER");

        assert_eq!(
            ask1.await.unwrap(),
            AskOwnerResult::Answer {
                text: "A".to_string(),
                responder: "OWNER".to_string()
            }
        );
        assert_eq!(
            ask2.await.unwrap(),
            AskOwnerResult::Answer {
                text: "B".to_string(),
                responder: "OWNER".to_string()
            }
        );
    }
}
