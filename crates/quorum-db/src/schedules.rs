// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

/// Gate applied before a schedule's actions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    Auto,
    OwnerApprove,
    CouncilApprove,
}

impl ApprovalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::OwnerApprove => "owner_approve",
            Self::CouncilApprove => "council_approve",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "owner_approve" => Some(Self::OwnerApprove),
            "council_approve" => Some(Self::CouncilApprove),
            _ => None,
        }
    }
}

/// One configured action.  Only `star_repos` and `custom` execute here; the
/// remaining types are declared for forward compatibility and recorded as
/// skipped when encountered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub id: String,
    pub agent_id: Option<String>,
    pub name: String,
    pub description: String,
    pub status: ScheduleStatus,
    pub cron_expression: Option<String>,
    pub interval_ms: Option<u64>,
    pub actions: Vec<ActionConfig>,
    pub approval_policy: ApprovalPolicy,
    pub next_run_at: Option<String>,
    pub execution_count: u64,
    pub created_at: String,
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRow> {
    let status: String = row.get("status")?;
    let policy: String = row.get("approval_policy")?;
    let actions: String = row.get("actions")?;
    let interval: Option<i64> = row.get("interval_ms")?;
    Ok(ScheduleRow {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        status: ScheduleStatus::parse(&status).unwrap_or(ScheduleStatus::Paused),
        cron_expression: row.get("cron_expression")?,
        interval_ms: interval.map(|v| v as u64),
        actions: serde_json::from_str(&actions).unwrap_or_default(),
        approval_policy: ApprovalPolicy::parse(&policy).unwrap_or(ApprovalPolicy::Auto),
        next_run_at: row.get("next_run_at")?,
        execution_count: row.get::<_, i64>("execution_count")? as u64,
        created_at: row.get("created_at")?,
    })
}

const SCHEDULE_COLS: &str = "id, agent_id, name, description, status, cron_expression, \
     interval_ms, actions, approval_policy, next_run_at, execution_count, created_at";

impl Store {
    pub fn create_schedule(&self, sched: &ScheduleRow) -> DbResult<()> {
        // Exactly one of cron_expression / interval_ms (§3 invariant).
        if sched.cron_expression.is_some() == sched.interval_ms.is_some() {
            return Err(DbError::Constraint(
                "schedule needs exactly one of cron_expression or interval_ms".into(),
            ));
        }
        if sched.actions.is_empty() {
            return Err(DbError::Constraint("schedule needs at least one action".into()));
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedules (id, agent_id, name, description, status, cron_expression, \
             interval_ms, actions, approval_policy, next_run_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                sched.id,
                sched.agent_id,
                sched.name,
                sched.description,
                sched.status.as_str(),
                sched.cron_expression,
                sched.interval_ms.map(|v| v as i64),
                serde_json::to_string(&sched.actions)?,
                sched.approval_policy.as_str(),
                sched.next_run_at,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_schedule(&self, id: &str) -> DbResult<ScheduleRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {SCHEDULE_COLS} FROM schedules WHERE id = ?1"),
            params![id],
            schedule_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound("schedule"))
    }

    /// Active schedules whose `next_run_at` is due at or before `now`.
    pub fn due_schedules(&self, now: &str) -> DbResult<Vec<ScheduleRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLS} FROM schedules \
             WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1"
        ))?;
        let rows = stmt
            .query_map(params![now], schedule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_active_schedules(&self) -> DbResult<Vec<ScheduleRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLS} FROM schedules WHERE status = 'active'"
        ))?;
        let rows = stmt
            .query_map([], schedule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Atomically claim a due schedule by moving `next_run_at` forward.
    /// Returns false when another tick already claimed it.
    pub fn claim_schedule(
        &self,
        id: &str,
        expected_next: &str,
        new_next: Option<&str>,
    ) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE schedules SET next_run_at = ?3, execution_count = execution_count + 1 \
             WHERE id = ?1 AND next_run_at = ?2",
            params![id, expected_next, new_next],
        )?;
        Ok(n == 1)
    }

    pub fn set_schedule_next_run(&self, id: &str, next: Option<&str>) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedules SET next_run_at = ?2 WHERE id = ?1",
            params![id, next],
        )?;
        Ok(())
    }

    pub fn record_schedule_execution(
        &self,
        id: &str,
        schedule_id: &str,
        action_type: &str,
        session_id: Option<&str>,
        outcome: &str,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedule_executions (id, schedule_id, action_type, session_id, \
             outcome, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, schedule_id, action_type, session_id, outcome, Self::now()],
        )?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
