// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The `agent_session` node executor: run one agent sub-process to
//! completion and surface its final text as the node output.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use quorum_core::process::{ProcessManager, StartOptions};
use quorum_core::ProcessEvent;
use quorum_db::sessions::NewSession;
use quorum_db::{NodeRunStatus, SessionSource, Store};

use crate::engine::{NodeContext, NodeExecutor};

pub struct AgentSessionExecutor {
    store: Arc<Store>,
    processes: Arc<ProcessManager>,
}

impl AgentSessionExecutor {
    pub fn new(store: Arc<Store>, processes: Arc<ProcessManager>) -> Self {
        Self { store, processes }
    }
}

#[async_trait]
impl NodeExecutor for AgentSessionExecutor {
    async fn execute(&self, ctx: NodeContext) -> anyhow::Result<Value> {
        let agent_id = ctx
            .node
            .config
            .get("agent_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(ctx.agent_id.clone())
            .ok_or_else(|| anyhow::anyhow!("agent_session node has no agent"))?;

        let prompt = ctx
            .node
            .config
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| ctx.input.to_string());

        let project_id = ctx
            .node
            .config
            .get("project_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(ctx.default_project_id.clone());
        let work_dir = project_id
            .as_deref()
            .and_then(|pid| self.store.get_project(pid).ok())
            .map(|p| p.path);

        let session_id = Uuid::new_v4().to_string();
        let session = self.store.create_session(NewSession {
            id: session_id.clone(),
            project_id,
            agent_id,
            name: format!("workflow node {}", ctx.node.label),
            source: Some(SessionSource::Agent),
            initial_prompt: prompt.clone(),
            work_dir,
            ..NewSession::default()
        })?;
        self.store
            .set_node_run_session(&ctx.node_run_id, &session_id)?;

        // Subscribe before starting so the exit event cannot slip past.
        let mut sub = self.processes.subscribe(&session_id);
        let token = sub.token;
        self.processes
            .start_process(&session, &prompt, StartOptions::default())
            .await?;
        // The node occupies a concurrency slot but is parked on the child.
        self.store
            .set_node_run_status(&ctx.node_run_id, NodeRunStatus::Waiting)?;

        let exit_code = loop {
            let Some(ev) = sub.rx.recv().await else {
                break None;
            };
            if let ProcessEvent::SessionExited { code } = &*ev.event {
                break *code;
            }
        };
        self.processes.unsubscribe(&session_id, token);

        let text = self.store.last_assistant_message(&session_id)?;
        Ok(json!({
            "session_id": session_id,
            "exit_code": exit_code,
            "text": text,
        }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WorkflowEngine;
    use quorum_config::CreditConfig;
    use quorum_core::approvals::ApprovalManager;
    use quorum_core::credits::CreditService;
    use quorum_core::mock::MockLauncher;
    use quorum_core::process::ChildLauncher;
    use quorum_db::{RunStatus, WorkflowEdge, WorkflowNode, WorkflowRow, WorkflowStatus};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn agent_session_node_waits_for_exit_and_returns_text() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let launcher = Arc::new(MockLauncher::new());
        let processes = ProcessManager::new(
            Arc::clone(&store),
            Arc::clone(&launcher) as Arc<dyn ChildLauncher>,
            Arc::new(ApprovalManager::new()),
            Arc::new(CreditService::new(
                Arc::clone(&store),
                CreditConfig::default(),
            )),
            Duration::from_secs(3600),
        );

        store
            .create_workflow(&WorkflowRow {
                id: "w1".to_string(),
                agent_id: Some("agent-1".to_string()),
                name: "w1".to_string(),
                status: WorkflowStatus::Active,
                default_project_id: None,
                max_concurrency: 1,
                nodes: vec![
                    WorkflowNode {
                        id: "start".into(),
                        node_type: "start".into(),
                        label: "start".into(),
                        config: serde_json::json!({}),
                        position: None,
                    },
                    WorkflowNode {
                        id: "ask".into(),
                        node_type: "agent_session".into(),
                        label: "ask".into(),
                        config: serde_json::json!({"prompt": "solve it"}),
                        position: None,
                    },
                ],
                edges: vec![WorkflowEdge {
                    id: "e1".into(),
                    source: "start".into(),
                    target: "ask".into(),
                    condition: None,
                    label: None,
                }],
                created_at: String::new(),
                updated_at: String::new(),
            })
            .unwrap();

        let engine = WorkflowEngine::new(Arc::clone(&store));
        engine.register_executor(
            "agent_session",
            Arc::new(AgentSessionExecutor::new(
                Arc::clone(&store),
                Arc::clone(&processes),
            )),
        );

        let run_id = engine.trigger_workflow("w1", None).unwrap();

        // Wait for the node's session to spawn, then script the child.
        let session_id = loop {
            let node_runs = store.node_runs_for(&run_id).unwrap();
            if let Some(sid) = node_runs.iter().find_map(|nr| nr.session_id.clone()) {
                break sid;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let child = launcher.handle(&session_id);
        child
            .send_line(
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"computed"}]}}"#,
            )
            .await;
        child.send_line(r#"{"type":"session_exited","code":0}"#).await;

        for _ in 0..500 {
            if store.get_workflow_run(&run_id).unwrap().status == RunStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let run = store.get_workflow_run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let output = run.output.unwrap();
        assert_eq!(output["text"], "computed");
        assert_eq!(output["exit_code"], 0);
    }
}
