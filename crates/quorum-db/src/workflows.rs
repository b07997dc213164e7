// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Workflow, run, and node-run queries.
//!
//! A run freezes the workflow's nodes and edges at trigger time; the executor
//! only ever reads the snapshot, so concurrent edits to the workflow cannot
//! change a run in flight.  `(run_id, node_id)` is unique — re-enqueueing a
//! node that already ran is an idempotent no-op.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Skipped,
}

impl NodeRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Counts against the run's `max_concurrency` budget.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }
}

/// A typed node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub position: Option<(f64, f64)>,
}

/// A directed edge; `condition` (when present) is evaluated against the
/// source node-run's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRow {
    pub id: String,
    pub agent_id: Option<String>,
    pub name: String,
    pub status: WorkflowStatus,
    pub default_project_id: Option<String>,
    pub max_concurrency: u32,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunRow {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub snapshot_nodes: Vec<WorkflowNode>,
    pub snapshot_edges: Vec<WorkflowEdge>,
    pub current_node_ids: Vec<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNodeRunRow {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeRunStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub session_id: Option<String>,
    pub work_task_id: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

fn json_col(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let text: Option<String> = row.get(name)?;
    Ok(text.and_then(|t| serde_json::from_str(&t).ok()))
}

fn workflow_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowRow> {
    let status: String = row.get("status")?;
    let nodes: String = row.get("nodes")?;
    let edges: String = row.get("edges")?;
    Ok(WorkflowRow {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        name: row.get("name")?,
        status: WorkflowStatus::parse(&status).unwrap_or(WorkflowStatus::Draft),
        default_project_id: row.get("default_project_id")?,
        max_concurrency: row.get::<_, i64>("max_concurrency")?.max(1) as u32,
        nodes: serde_json::from_str(&nodes).unwrap_or_default(),
        edges: serde_json::from_str(&edges).unwrap_or_default(),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowRunRow> {
    let status: String = row.get("status")?;
    let nodes: String = row.get("snapshot_nodes")?;
    let edges: String = row.get("snapshot_edges")?;
    let current: String = row.get("current_node_ids")?;
    Ok(WorkflowRunRow {
        id: row.get("id")?,
        workflow_id: row.get("workflow_id")?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        input: json_col(row, "input")?,
        output: json_col(row, "output")?,
        snapshot_nodes: serde_json::from_str(&nodes).unwrap_or_default(),
        snapshot_edges: serde_json::from_str(&edges).unwrap_or_default(),
        current_node_ids: serde_json::from_str(&current).unwrap_or_default(),
        error: row.get("error")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

fn node_run_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowNodeRunRow> {
    let status: String = row.get("status")?;
    Ok(WorkflowNodeRunRow {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        node_id: row.get("node_id")?,
        node_type: row.get("node_type")?,
        status: NodeRunStatus::parse(&status).unwrap_or(NodeRunStatus::Failed),
        input: json_col(row, "input")?,
        output: json_col(row, "output")?,
        session_id: row.get("session_id")?,
        work_task_id: row.get("work_task_id")?,
        error: row.get("error")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

const WORKFLOW_COLS: &str = "id, agent_id, name, status, default_project_id, max_concurrency, \
     nodes, edges, created_at, updated_at";
const RUN_COLS: &str = "id, workflow_id, status, input, output, snapshot_nodes, snapshot_edges, \
     current_node_ids, error, started_at, completed_at";
const NODE_RUN_COLS: &str = "id, run_id, node_id, node_type, status, input, output, session_id, \
     work_task_id, error, started_at, completed_at";

impl Store {
    pub fn create_workflow(&self, wf: &WorkflowRow) -> DbResult<()> {
        // Structural invariants: at least one start node, edges reference
        // existing node ids.
        if !wf.nodes.iter().any(|n| n.node_type == "start") {
            return Err(DbError::Constraint("workflow needs a start node".into()));
        }
        for edge in &wf.edges {
            let known = |id: &str| wf.nodes.iter().any(|n| n.id == id);
            if !known(&edge.source) || !known(&edge.target) {
                return Err(DbError::Constraint(format!(
                    "edge {} references unknown node",
                    edge.id
                )));
            }
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workflows (id, agent_id, name, status, default_project_id, \
             max_concurrency, nodes, edges, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                wf.id,
                wf.agent_id,
                wf.name,
                wf.status.as_str(),
                wf.default_project_id,
                wf.max_concurrency.max(1),
                serde_json::to_string(&wf.nodes)?,
                serde_json::to_string(&wf.edges)?,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_workflow(&self, id: &str) -> DbResult<WorkflowRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {WORKFLOW_COLS} FROM workflows WHERE id = ?1"),
            params![id],
            workflow_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound("workflow"))
    }

    pub fn create_workflow_run(
        &self,
        id: &str,
        wf: &WorkflowRow,
        input: Option<&serde_json::Value>,
        current_node_ids: &[String],
    ) -> DbResult<WorkflowRunRow> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workflow_runs (id, workflow_id, status, input, snapshot_nodes, \
             snapshot_edges, current_node_ids, started_at) \
             VALUES (?1, ?2, 'running', ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                wf.id,
                input.map(serde_json::to_string).transpose()?,
                serde_json::to_string(&wf.nodes)?,
                serde_json::to_string(&wf.edges)?,
                serde_json::to_string(current_node_ids)?,
                Self::now(),
            ],
        )?;
        drop(conn);
        self.get_workflow_run(id)
    }

    pub fn get_workflow_run(&self, id: &str) -> DbResult<WorkflowRunRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {RUN_COLS} FROM workflow_runs WHERE id = ?1"),
            params![id],
            run_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound("workflow run"))
    }

    pub fn set_run_current_nodes(&self, id: &str, node_ids: &[String]) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workflow_runs SET current_node_ids = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(node_ids)?],
        )?;
        Ok(())
    }

    pub fn finish_workflow_run(
        &self,
        id: &str,
        status: RunStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workflow_runs SET status = ?2, output = ?3, error = ?4, completed_at = ?5 \
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                output.map(serde_json::to_string).transpose()?,
                error,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    /// Create a pending node run unless one already exists for
    /// `(run_id, node_id)`.  Returns the (possibly pre-existing) row.
    pub fn ensure_node_run(
        &self,
        id: &str,
        run_id: &str,
        node_id: &str,
        node_type: &str,
        input: Option<&serde_json::Value>,
    ) -> DbResult<WorkflowNodeRunRow> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO workflow_node_runs (id, run_id, node_id, node_type, \
             status, input) VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                id,
                run_id,
                node_id,
                node_type,
                input.map(serde_json::to_string).transpose()?,
            ],
        )?;
        conn.query_row(
            &format!(
                "SELECT {NODE_RUN_COLS} FROM workflow_node_runs \
                 WHERE run_id = ?1 AND node_id = ?2"
            ),
            params![run_id, node_id],
            node_run_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound("workflow node run"))
    }

    pub fn set_node_run_status(&self, id: &str, status: NodeRunStatus) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();
        match status {
            NodeRunStatus::Running | NodeRunStatus::Waiting => conn.execute(
                "UPDATE workflow_node_runs SET status = ?2, \
                 started_at = COALESCE(started_at, ?3) WHERE id = ?1",
                params![id, status.as_str(), now],
            )?,
            NodeRunStatus::Completed
            | NodeRunStatus::Failed
            | NodeRunStatus::Skipped => conn.execute(
                "UPDATE workflow_node_runs SET status = ?2, completed_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now],
            )?,
            NodeRunStatus::Pending => conn.execute(
                "UPDATE workflow_node_runs SET status = 'pending' WHERE id = ?1",
                params![id],
            )?,
        };
        Ok(())
    }

    pub fn set_node_run_output(&self, id: &str, output: &serde_json::Value) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workflow_node_runs SET output = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(output)?],
        )?;
        Ok(())
    }

    pub fn set_node_run_session(&self, id: &str, session_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workflow_node_runs SET session_id = ?2 WHERE id = ?1",
            params![id, session_id],
        )?;
        Ok(())
    }

    pub fn set_node_run_error(&self, id: &str, error: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workflow_node_runs SET status = 'failed', error = ?2, completed_at = ?3 \
             WHERE id = ?1",
            params![id, error, Self::now()],
        )?;
        Ok(())
    }

    pub fn node_runs_for(&self, run_id: &str) -> DbResult<Vec<WorkflowNodeRunRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_RUN_COLS} FROM workflow_node_runs WHERE run_id = ?1 ORDER BY rowid ASC"
        ))?;
        let rows = stmt
            .query_map(params![run_id], node_run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(id: &str) -> WorkflowRow {
        WorkflowRow {
            id: id.to_string(),
            agent_id: None,
            name: "wf".to_string(),
            status: WorkflowStatus::Active,
            default_project_id: None,
            max_concurrency: 2,
            nodes: vec![
                WorkflowNode {
                    id: "n1".into(),
                    node_type: "start".into(),
                    label: "start".into(),
                    config: serde_json::json!({}),
                    position: None,
                },
                WorkflowNode {
                    id: "n2".into(),
                    node_type: "wait".into(),
                    label: "wait".into(),
                    config: serde_json::json!({"ms": 10}),
                    position: None,
                },
            ],
            edges: vec![WorkflowEdge {
                id: "e1".into(),
                source: "n1".into(),
                target: "n2".into(),
                condition: None,
                label: None,
            }],
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn workflow_without_start_node_rejected() {
        let s = Store::open_in_memory().unwrap();
        let mut wf = workflow("w1");
        wf.nodes.remove(0);
        wf.edges.clear();
        assert!(matches!(s.create_workflow(&wf), Err(DbError::Constraint(_))));
    }

    #[test]
    fn edge_to_unknown_node_rejected() {
        let s = Store::open_in_memory().unwrap();
        let mut wf = workflow("w1");
        wf.edges[0].target = "ghost".into();
        assert!(matches!(s.create_workflow(&wf), Err(DbError::Constraint(_))));
    }

    #[test]
    fn node_run_is_idempotent_per_run_and_node() {
        let s = Store::open_in_memory().unwrap();
        let wf = workflow("w1");
        s.create_workflow(&wf).unwrap();
        s.create_workflow_run("r1", &wf, None, &["n1".into()]).unwrap();

        let first = s.ensure_node_run("nr1", "r1", "n1", "start", None).unwrap();
        let second = s.ensure_node_run("nr2", "r1", "n1", "start", None).unwrap();
        assert_eq!(first.id, second.id, "second ensure must not create a new row");
    }

    #[test]
    fn run_snapshot_is_frozen_copy() {
        let s = Store::open_in_memory().unwrap();
        let wf = workflow("w1");
        s.create_workflow(&wf).unwrap();
        let run = s.create_workflow_run("r1", &wf, None, &["n1".into()]).unwrap();
        assert_eq!(run.snapshot_nodes.len(), 2);
        assert_eq!(run.snapshot_edges.len(), 1);
        assert_eq!(run.current_node_ids, vec!["n1"]);
    }
}
