// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quorum_db::{
    NodeRunStatus, RunStatus, Store, WorkflowEdge, WorkflowNode, WorkflowRunRow,
};

use crate::expr;

/// Everything an executor sees about the node it runs.
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: String,
    pub node_run_id: String,
    pub node: WorkflowNode,
    pub input: Value,
    pub default_project_id: Option<String>,
    pub agent_id: Option<String>,
}

/// Executes one typed node.  The engine owns all state transitions; an
/// executor only produces the node's output (or an error).
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, ctx: NodeContext) -> anyhow::Result<Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow not found")]
    NotFound,
    #[error(transparent)]
    Db(#[from] quorum_db::DbError),
}

/// Fan-out events for the WS topics.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    WorkflowUpdate {
        workflow_id: String,
    },
    RunUpdate {
        run_id: String,
        workflow_id: String,
        status: RunStatus,
    },
    NodeUpdate {
        run_id: String,
        node_id: String,
        status: NodeRunStatus,
    },
}

pub struct WorkflowEngine {
    store: Arc<Store>,
    executors: Mutex<HashMap<String, Arc<dyn NodeExecutor>>>,
    events_tx: broadcast::Sender<WorkflowEvent>,
    cancelled: Mutex<HashSet<String>>,
    self_ref: std::sync::Weak<Self>,
}

/// Pass-through executors for the structural node types.
struct PassThrough;

#[async_trait]
impl NodeExecutor for PassThrough {
    async fn execute(&self, ctx: NodeContext) -> anyhow::Result<Value> {
        Ok(ctx.input)
    }
}

struct Wait;

#[async_trait]
impl NodeExecutor for Wait {
    async fn execute(&self, ctx: NodeContext) -> anyhow::Result<Value> {
        let ms = ctx.node.config.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(ctx.input)
    }
}

impl WorkflowEngine {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let engine = Arc::new_cyclic(|me| Self {
            store,
            executors: Mutex::new(HashMap::new()),
            events_tx,
            cancelled: Mutex::new(HashSet::new()),
            self_ref: me.clone(),
        });
        engine.register_executor("start", Arc::new(PassThrough));
        engine.register_executor("branch", Arc::new(PassThrough));
        engine.register_executor("join", Arc::new(PassThrough));
        engine.register_executor("wait", Arc::new(Wait));
        engine
    }

    pub fn register_executor(&self, node_type: &str, executor: Arc<dyn NodeExecutor>) {
        self.executors
            .lock()
            .unwrap()
            .insert(node_type.to_string(), executor);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: WorkflowEvent) {
        let _ = self.events_tx.send(event);
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("workflow engine alive")
    }

    /// Create a run over a frozen snapshot and spawn its executor task.
    pub fn trigger_workflow(
        &self,
        workflow_id: &str,
        input: Option<Value>,
    ) -> Result<String, WorkflowError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .map_err(|_| WorkflowError::NotFound)?;
        let start_ids: Vec<String> = workflow
            .nodes
            .iter()
            .filter(|n| n.node_type == "start")
            .map(|n| n.id.clone())
            .collect();
        let run_id = Uuid::new_v4().to_string();
        let run = self
            .store
            .create_workflow_run(&run_id, &workflow, input.as_ref(), &start_ids)?;
        info!(run_id, workflow_id, "workflow run started");
        self.emit(WorkflowEvent::RunUpdate {
            run_id: run_id.clone(),
            workflow_id: workflow_id.to_string(),
            status: RunStatus::Running,
        });

        let engine = self.arc();
        let max_concurrency = workflow.max_concurrency as usize;
        let agent_id = workflow.agent_id.clone();
        let default_project_id = workflow.default_project_id.clone();
        tokio::spawn(async move {
            engine
                .run_loop(run, max_concurrency, agent_id, default_project_id)
                .await;
        });
        Ok(run_id)
    }

    /// Request cancellation; the run settles to `cancelled` once in-flight
    /// nodes drain.
    pub fn cancel_run(&self, run_id: &str) {
        self.cancelled.lock().unwrap().insert(run_id.to_string());
    }

    async fn run_loop(
        self: Arc<Self>,
        run: WorkflowRunRow,
        max_concurrency: usize,
        agent_id: Option<String>,
        default_project_id: Option<String>,
    ) {
        let run_id = run.id.clone();
        let nodes: HashMap<String, WorkflowNode> = run
            .snapshot_nodes
            .iter()
            .cloned()
            .map(|n| (n.id.clone(), n))
            .collect();
        let edges: Vec<WorkflowEdge> = run.snapshot_edges.clone();
        let run_input = run.input.clone().unwrap_or(Value::Null);

        let mut pending: VecDeque<(String, Value)> = run
            .current_node_ids
            .iter()
            .map(|id| (id.clone(), run_input.clone()))
            .collect();
        let mut visited: HashSet<String> = HashSet::new();
        let mut active: usize = 0;
        let mut any_failed: Option<String> = None;
        let mut last_output = Value::Null;
        let mut join_set: JoinSet<(String, String, anyhow::Result<Value>)> = JoinSet::new();

        loop {
            if self.cancelled.lock().unwrap().contains(&run_id) {
                join_set.abort_all();
                let _ = self
                    .store
                    .finish_workflow_run(&run_id, RunStatus::Cancelled, None, None);
                self.emit(WorkflowEvent::RunUpdate {
                    run_id: run_id.clone(),
                    workflow_id: run.workflow_id.clone(),
                    status: RunStatus::Cancelled,
                });
                self.cancelled.lock().unwrap().remove(&run_id);
                return;
            }

            // Admit pending nodes up to the concurrency cap.
            while active < max_concurrency {
                let Some((node_id, input)) = pending.pop_front() else {
                    break;
                };
                if !visited.insert(node_id.clone()) {
                    continue; // a node runs at most once per run
                }
                let Some(node) = nodes.get(&node_id).cloned() else {
                    warn!(run_id, node_id, "snapshot has no such node");
                    continue;
                };
                let node_run_id = Uuid::new_v4().to_string();
                let node_run = match self.store.ensure_node_run(
                    &node_run_id,
                    &run_id,
                    &node_id,
                    &node.node_type,
                    Some(&input),
                ) {
                    Ok(nr) => nr,
                    Err(e) => {
                        warn!(run_id, node_id, "node run create failed: {e}");
                        continue;
                    }
                };
                if node_run.status != NodeRunStatus::Pending {
                    debug!(run_id, node_id, "node run already executed; skipping");
                    continue;
                }
                let _ = self
                    .store
                    .set_node_run_status(&node_run.id, NodeRunStatus::Running);
                self.emit(WorkflowEvent::NodeUpdate {
                    run_id: run_id.clone(),
                    node_id: node_id.clone(),
                    status: NodeRunStatus::Running,
                });

                let executor = self
                    .executors
                    .lock()
                    .unwrap()
                    .get(&node.node_type)
                    .cloned();
                let ctx = NodeContext {
                    run_id: run_id.clone(),
                    node_run_id: node_run.id.clone(),
                    node,
                    input,
                    default_project_id: default_project_id.clone(),
                    agent_id: agent_id.clone(),
                };
                active += 1;
                let nr_id = node_run.id.clone();
                join_set.spawn(async move {
                    let result = match executor {
                        Some(ex) => ex.execute(ctx.clone()).await,
                        None => Err(anyhow::anyhow!(
                            "no executor for node type {:?}",
                            ctx.node.node_type
                        )),
                    };
                    (nr_id, ctx.node.id, result)
                });
            }

            // Persist the visible frontier.
            let frontier: Vec<String> = pending.iter().map(|(id, _)| id.clone()).collect();
            let _ = self.store.set_run_current_nodes(&run_id, &frontier);

            if active == 0 && pending.is_empty() {
                break;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            active -= 1;
            let Ok((node_run_id, node_id, result)) = joined else {
                continue; // aborted/panicked subtask: counted, nothing to route
            };
            match result {
                Ok(output) => {
                    let _ = self.store.set_node_run_output(&node_run_id, &output);
                    let _ = self
                        .store
                        .set_node_run_status(&node_run_id, NodeRunStatus::Completed);
                    self.emit(WorkflowEvent::NodeUpdate {
                        run_id: run_id.clone(),
                        node_id: node_id.clone(),
                        status: NodeRunStatus::Completed,
                    });
                    last_output = output.clone();
                    for edge in edges.iter().filter(|e| e.source == node_id) {
                        let fires = match &edge.condition {
                            None => true,
                            Some(cond) => match expr::evaluate(cond, &output) {
                                Ok(fires) => fires,
                                Err(e) => {
                                    warn!(run_id, edge = %edge.id, "bad edge condition: {e}");
                                    false
                                }
                            },
                        };
                        if fires {
                            pending.push_back((edge.target.clone(), output.clone()));
                        }
                    }
                }
                Err(e) => {
                    let _ = self.store.set_node_run_error(&node_run_id, &e.to_string());
                    self.emit(WorkflowEvent::NodeUpdate {
                        run_id: run_id.clone(),
                        node_id: node_id.clone(),
                        status: NodeRunStatus::Failed,
                    });
                    if any_failed.is_none() {
                        any_failed = Some(format!("node {node_id}: {e}"));
                    }
                }
            }
        }

        let (status, error) = match &any_failed {
            None => (RunStatus::Completed, None),
            Some(e) => (RunStatus::Failed, Some(e.as_str())),
        };
        let output = if status == RunStatus::Completed {
            Some(last_output)
        } else {
            None
        };
        let _ = self
            .store
            .finish_workflow_run(&run_id, status, output.as_ref(), error);
        self.emit(WorkflowEvent::RunUpdate {
            run_id: run_id.clone(),
            workflow_id: run.workflow_id.clone(),
            status,
        });
        info!(run_id, status = status.as_str(), "workflow run finished");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_db::{WorkflowRow, WorkflowStatus};
    use serde_json::json;
    use std::time::Duration;

    fn node(id: &str, node_type: &str, config: Value) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            node_type: node_type.to_string(),
            label: id.to_string(),
            config,
            position: None,
        }
    }

    fn edge(id: &str, source: &str, target: &str, condition: Option<&str>) -> WorkflowEdge {
        WorkflowEdge {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: condition.map(str::to_string),
            label: None,
        }
    }

    fn workflow(store: &Store, id: &str, max: u32, nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) {
        store
            .create_workflow(&WorkflowRow {
                id: id.to_string(),
                agent_id: None,
                name: id.to_string(),
                status: WorkflowStatus::Active,
                default_project_id: None,
                max_concurrency: max,
                nodes,
                edges,
                created_at: String::new(),
                updated_at: String::new(),
            })
            .unwrap();
    }

    async fn wait_for_status(store: &Store, run_id: &str, status: RunStatus) {
        for _ in 0..500 {
            if store.get_workflow_run(run_id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "run never reached {:?}; at {:?}",
            status,
            store.get_workflow_run(run_id).unwrap().status
        );
    }

    /// Records how many executions overlap, to check the concurrency cap.
    struct GaugeExecutor {
        current: Arc<Mutex<usize>>,
        peak: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl NodeExecutor for GaugeExecutor {
        async fn execute(&self, ctx: NodeContext) -> anyhow::Result<Value> {
            {
                let mut cur = self.current.lock().unwrap();
                *cur += 1;
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(*cur);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            *self.current.lock().unwrap() -= 1;
            Ok(ctx.input)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn linear_run_completes_with_output() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        workflow(
            &store,
            "w1",
            1,
            vec![
                node("n1", "start", json!({})),
                node("n2", "wait", json!({"ms": 5})),
            ],
            vec![edge("e1", "n1", "n2", None)],
        );
        let engine = WorkflowEngine::new(Arc::clone(&store));
        let run_id = engine
            .trigger_workflow("w1", Some(json!({"seed": 1})))
            .unwrap();

        wait_for_status(&store, &run_id, RunStatus::Completed).await;
        let run = store.get_workflow_run(&run_id).unwrap();
        assert_eq!(run.output, Some(json!({"seed": 1})));

        let node_runs = store.node_runs_for(&run_id).unwrap();
        assert_eq!(node_runs.len(), 2);
        assert!(node_runs
            .iter()
            .all(|nr| nr.status == NodeRunStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_edges_select_the_branch() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        workflow(
            &store,
            "w1",
            2,
            vec![
                node("start", "start", json!({})),
                node("yes", "wait", json!({})),
                node("no", "wait", json!({})),
            ],
            vec![
                edge("e1", "start", "yes", Some("go == true")),
                edge("e2", "start", "no", Some("go == false")),
            ],
        );
        let engine = WorkflowEngine::new(Arc::clone(&store));
        let run_id = engine
            .trigger_workflow("w1", Some(json!({"go": true})))
            .unwrap();
        wait_for_status(&store, &run_id, RunStatus::Completed).await;

        let node_runs = store.node_runs_for(&run_id).unwrap();
        let executed: Vec<_> = node_runs.iter().map(|nr| nr.node_id.as_str()).collect();
        assert!(executed.contains(&"yes"));
        assert!(!executed.contains(&"no"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_the_cap() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut nodes = vec![node("start", "start", json!({}))];
        let mut edges_v = Vec::new();
        for i in 0..6 {
            nodes.push(node(&format!("slow{i}"), "slow", json!({})));
            edges_v.push(edge(&format!("e{i}"), "start", &format!("slow{i}"), None));
        }
        workflow(&store, "w1", 2, nodes, edges_v);

        let engine = WorkflowEngine::new(Arc::clone(&store));
        let current = Arc::new(Mutex::new(0));
        let peak = Arc::new(Mutex::new(0));
        engine.register_executor(
            "slow",
            Arc::new(GaugeExecutor {
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            }),
        );

        let run_id = engine.trigger_workflow("w1", None).unwrap();
        wait_for_status(&store, &run_id, RunStatus::Completed).await;
        assert!(*peak.lock().unwrap() <= 2, "cap of 2 exceeded");
        assert_eq!(store.node_runs_for(&run_id).unwrap().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_node_fails_the_run_with_first_error() {
        struct Boom;
        #[async_trait]
        impl NodeExecutor for Boom {
            async fn execute(&self, _ctx: NodeContext) -> anyhow::Result<Value> {
                anyhow::bail!("exploded")
            }
        }
        let store = Arc::new(Store::open_in_memory().unwrap());
        workflow(
            &store,
            "w1",
            1,
            vec![node("start", "start", json!({})), node("b", "boom", json!({}))],
            vec![edge("e1", "start", "b", None)],
        );
        let engine = WorkflowEngine::new(Arc::clone(&store));
        engine.register_executor("boom", Arc::new(Boom));

        let run_id = engine.trigger_workflow("w1", None).unwrap();
        wait_for_status(&store, &run_id, RunStatus::Failed).await;
        let run = store.get_workflow_run(&run_id).unwrap();
        assert!(run.error.unwrap().contains("exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_node_type_fails_cleanly() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        workflow(
            &store,
            "w1",
            1,
            vec![
                node("start", "start", json!({})),
                node("m", "mystery", json!({})),
            ],
            vec![edge("e1", "start", "m", None)],
        );
        let engine = WorkflowEngine::new(Arc::clone(&store));
        let run_id = engine.trigger_workflow("w1", None).unwrap();
        wait_for_status(&store, &run_id, RunStatus::Failed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn diamond_join_runs_join_once() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        workflow(
            &store,
            "w1",
            4,
            vec![
                node("start", "start", json!({})),
                node("a", "wait", json!({})),
                node("b", "wait", json!({})),
                node("j", "join", json!({})),
            ],
            vec![
                edge("e1", "start", "a", None),
                edge("e2", "start", "b", None),
                edge("e3", "a", "j", None),
                edge("e4", "b", "j", None),
            ],
        );
        let engine = WorkflowEngine::new(Arc::clone(&store));
        let run_id = engine.trigger_workflow("w1", None).unwrap();
        wait_for_status(&store, &run_id, RunStatus::Completed).await;

        let joins: Vec<_> = store
            .node_runs_for(&run_id)
            .unwrap()
            .into_iter()
            .filter(|nr| nr.node_id == "j")
            .collect();
        assert_eq!(joins.len(), 1, "join node must run exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_unknown_workflow_is_not_found() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = WorkflowEngine::new(store);
        assert!(matches!(
            engine.trigger_workflow("ghost", None),
            Err(WorkflowError::NotFound)
        ));
    }
}
