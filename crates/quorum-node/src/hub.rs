// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket topic hub.
//!
//! Every component publishes `{type, ...}` envelopes tagged with a topic;
//! sockets subscribe to topic names (`council`, `algochat`, `owner`,
//! `ollama`, `workflow`, `schedule`, plus per-session `session:{id}`) and
//! receive only what they asked for.  Pump tasks translate the component
//! broadcast streams into hub messages at assembly time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use quorum_council::CouncilEvent;
use quorum_scheduler::SchedulerEvent;
use quorum_workflow::WorkflowEvent;

/// One fan-out message.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Value,
}

pub struct WsHub {
    tx: broadcast::Sender<TopicMessage>,
    clients: AtomicUsize,
}

impl WsHub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            tx,
            clients: AtomicUsize::new(0),
        })
    }

    pub fn publish(&self, topic: &str, payload: Value) {
        let _ = self.tx.send(TopicMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        self.tx.subscribe()
    }

    pub fn client_connected(&self) {
        self.clients.fetch_add(1, Ordering::SeqCst);
    }

    pub fn client_disconnected(&self) {
        self.clients.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

/// Pump a council event stream into the hub.
pub fn pump_council(hub: Arc<WsHub>, mut rx: broadcast::Receiver<CouncilEvent>) {
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(ev) => ev,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let payload = match event {
                CouncilEvent::StageChange {
                    launch_id,
                    stage,
                    session_ids,
                } => json!({
                    "type": "council_stage_change",
                    "launch_id": launch_id,
                    "stage": stage,
                    "session_ids": session_ids,
                }),
                CouncilEvent::Log {
                    launch_id,
                    session_id,
                    level,
                    message,
                    detail,
                } => json!({
                    "type": "council_log",
                    "launch_id": launch_id,
                    "session_id": session_id,
                    "level": level,
                    "message": message,
                    "detail": detail,
                }),
                CouncilEvent::DiscussionMessage {
                    launch_id,
                    agent_id,
                    agent_name,
                    round,
                    content,
                } => json!({
                    "type": "council_discussion_message",
                    "launch_id": launch_id,
                    "agent_id": agent_id,
                    "agent_name": agent_name,
                    "round": round,
                    "content": content,
                }),
            };
            hub.publish("council", payload);
        }
    });
}

/// Pump workflow engine events into the hub.
pub fn pump_workflows(hub: Arc<WsHub>, mut rx: broadcast::Receiver<WorkflowEvent>) {
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(ev) => ev,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let payload = match event {
                WorkflowEvent::WorkflowUpdate { workflow_id } => json!({
                    "type": "workflow_update",
                    "workflow_id": workflow_id,
                }),
                WorkflowEvent::RunUpdate {
                    run_id,
                    workflow_id,
                    status,
                } => json!({
                    "type": "workflow_run_update",
                    "run_id": run_id,
                    "workflow_id": workflow_id,
                    "status": status,
                }),
                WorkflowEvent::NodeUpdate {
                    run_id,
                    node_id,
                    status,
                } => json!({
                    "type": "workflow_node_update",
                    "run_id": run_id,
                    "node_id": node_id,
                    "status": status,
                }),
            };
            hub.publish("workflow", payload);
        }
    });
}

/// Pump scheduler events into the hub.
pub fn pump_scheduler(hub: Arc<WsHub>, mut rx: broadcast::Receiver<SchedulerEvent>) {
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(ev) => ev,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let payload = match event {
                SchedulerEvent::ScheduleUpdate { schedule_id } => json!({
                    "type": "schedule_update",
                    "schedule_id": schedule_id,
                }),
                SchedulerEvent::ExecutionRecorded {
                    schedule_id,
                    action_type,
                    outcome,
                } => json!({
                    "type": "schedule_execution_update",
                    "schedule_id": schedule_id,
                    "action_type": action_type,
                    "outcome": outcome,
                }),
                SchedulerEvent::ApprovalRequested { schedule_id } => json!({
                    "type": "schedule_approval_request",
                    "schedule_id": schedule_id,
                }),
            };
            hub.publish("schedule", payload);
        }
    });
}

/// Pump pre-tagged JSON streams (algochat bridge, owner topic) into the hub.
pub fn pump_json(hub: Arc<WsHub>, topic: &'static str, mut rx: broadcast::Receiver<Value>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(payload) => hub.publish(topic, payload),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers_with_topic() {
        let hub = WsHub::new();
        let mut rx = hub.subscribe();
        hub.publish("council", json!({"type": "council_log"}));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "council");
        assert_eq!(msg.payload["type"], "council_log");
    }

    #[tokio::test]
    async fn client_count_tracks_connections() {
        let hub = WsHub::new();
        hub.client_connected();
        hub.client_connected();
        hub.client_disconnected();
        assert_eq!(hub.client_count(), 1);
    }
}
