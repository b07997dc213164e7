// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Session and session-message queries.
//!
//! Invariants enforced here rather than trusted to callers:
//! `pid` is non-null iff `status = running` (the two change together in
//! [`Store::mark_session_running`] / [`Store::mark_session_ended`]), and a
//! session delete cascades to its messages while conversations merely lose
//! their weak reference (FK `ON DELETE SET NULL`).

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Where a session originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Web,
    Algochat,
    Agent,
    Slack,
    Poll,
}

impl SessionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Algochat => "algochat",
            Self::Agent => "agent",
            Self::Slack => "slack",
            Self::Poll => "poll",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "web" => Some(Self::Web),
            "algochat" => Some(Self::Algochat),
            "agent" => Some(Self::Agent),
            "slack" => Some(Self::Slack),
            "poll" => Some(Self::Poll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouncilRole {
    Member,
    Reviewer,
    Chairman,
}

impl CouncilRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Reviewer => "reviewer",
            Self::Chairman => "chairman",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "member" => Some(Self::Member),
            "reviewer" => Some(Self::Reviewer),
            "chairman" => Some(Self::Chairman),
            _ => None,
        }
    }
}

/// One sub-process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub project_id: Option<String>,
    pub agent_id: String,
    pub name: String,
    pub status: SessionStatus,
    pub source: SessionSource,
    pub initial_prompt: String,
    pub pid: Option<u32>,
    pub total_cost_usd: f64,
    pub total_algo_spent: i64,
    pub total_turns: i64,
    pub credits_consumed: f64,
    pub council_launch_id: Option<String>,
    pub council_role: Option<CouncilRole>,
    pub work_dir: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Builder-ish input for session creation; the row is filled with defaults.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub id: String,
    pub project_id: Option<String>,
    pub agent_id: String,
    pub name: String,
    pub source: Option<SessionSource>,
    pub initial_prompt: String,
    pub council_launch_id: Option<String>,
    pub council_role: Option<CouncilRole>,
    pub work_dir: Option<String>,
}

/// One persisted role-tagged message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessageRow {
    pub row_id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub cost_usd: f64,
    pub created_at: String,
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    let status: String = row.get("status")?;
    let source: String = row.get("source")?;
    let role: Option<String> = row.get("council_role")?;
    Ok(SessionRow {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        agent_id: row.get("agent_id")?,
        name: row.get("name")?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Error),
        source: SessionSource::parse(&source).unwrap_or(SessionSource::Web),
        initial_prompt: row.get("initial_prompt")?,
        pid: row.get("pid")?,
        total_cost_usd: row.get("total_cost_usd")?,
        total_algo_spent: row.get("total_algo_spent")?,
        total_turns: row.get("total_turns")?,
        credits_consumed: row.get("credits_consumed")?,
        council_launch_id: row.get("council_launch_id")?,
        council_role: role.as_deref().and_then(CouncilRole::parse),
        work_dir: row.get("work_dir")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const SESSION_COLS: &str = "id, project_id, agent_id, name, status, source, initial_prompt, pid, \
     total_cost_usd, total_algo_spent, total_turns, credits_consumed, \
     council_launch_id, council_role, work_dir, created_at, updated_at";

impl Store {
    pub fn create_session(&self, new: NewSession) -> DbResult<SessionRow> {
        // A session inside a council launch must carry a role; §3 invariant.
        if new.council_launch_id.is_some() && new.council_role.is_none() {
            return Err(DbError::Constraint(
                "council session requires a council_role".into(),
            ));
        }
        let now = Self::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, project_id, agent_id, name, status, source, \
             initial_prompt, council_launch_id, council_role, work_dir, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'created', ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                new.id,
                new.project_id,
                new.agent_id,
                new.name,
                new.source.unwrap_or(SessionSource::Web).as_str(),
                new.initial_prompt,
                new.council_launch_id,
                new.council_role.map(|r| r.as_str()),
                new.work_dir,
                now,
            ],
        )?;
        drop(conn);
        self.get_session(&new.id)
    }

    pub fn get_session(&self, id: &str) -> DbResult<SessionRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
            params![id],
            session_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound("session"))
    }

    pub fn list_sessions(&self) -> DbResult<Vec<SessionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLS} FROM sessions ORDER BY created_at DESC"
        ))?;
        let rows = stmt
            .query_map([], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn sessions_for_launch(&self, launch_id: &str) -> DbResult<Vec<SessionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLS} FROM sessions WHERE council_launch_id = ?1 \
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![launch_id], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// status → running, pid set.  The only path that sets a pid.
    pub fn mark_session_running(&self, id: &str, pid: u32) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE sessions SET status = 'running', pid = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, pid, Self::now()],
        )?;
        if n == 0 {
            return Err(DbError::NotFound("session"));
        }
        Ok(())
    }

    /// Terminal transition: status → stopped | error, pid cleared.
    pub fn mark_session_ended(&self, id: &str, status: SessionStatus) -> DbResult<()> {
        debug_assert!(matches!(
            status,
            SessionStatus::Stopped | SessionStatus::Error
        ));
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE sessions SET status = ?2, pid = NULL, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), Self::now()],
        )?;
        if n == 0 {
            return Err(DbError::NotFound("session"));
        }
        Ok(())
    }

    /// Accumulate cost and turn counters from one `result` event.
    pub fn add_session_result(&self, id: &str, cost_usd: f64, turns: i64) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET total_cost_usd = total_cost_usd + ?2, \
             total_turns = total_turns + ?3, updated_at = ?4 WHERE id = ?1",
            params![id, cost_usd, turns, Self::now()],
        )?;
        Ok(())
    }

    pub fn add_session_credits(&self, id: &str, credits: f64) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET credits_consumed = credits_consumed + ?2, updated_at = ?3 \
             WHERE id = ?1",
            params![id, credits, Self::now()],
        )?;
        Ok(())
    }

    pub fn add_session_algo_spent(&self, id: &str, micro: i64) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET total_algo_spent = total_algo_spent + ?2, updated_at = ?3 \
             WHERE id = ?1",
            params![id, micro, Self::now()],
        )?;
        Ok(())
    }

    /// Delete a session, its messages, and any conversation references — one
    /// transaction so a crash cannot leave a dangling conversation binding.
    pub fn delete_session(&self, id: &str) -> DbResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE algochat_conversations SET session_id = NULL WHERE session_id = ?1",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM session_messages WHERE session_id = ?1",
            params![id],
        )?;
        let n = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        if n == 0 {
            return Err(DbError::NotFound("session"));
        }
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn append_session_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        cost_usd: f64,
    ) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO session_messages (session_id, role, content, cost_usd, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, role, content, cost_usd, Self::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn session_messages(&self, session_id: &str) -> DbResult<Vec<SessionMessageRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT row_id, session_id, role, content, cost_usd, created_at \
             FROM session_messages WHERE session_id = ?1 ORDER BY row_id ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(SessionMessageRow {
                    row_id: row.get(0)?,
                    session_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    cost_usd: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The most recent assistant message of a session, if any.
    pub fn last_assistant_message(&self, session_id: &str) -> DbResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let content = conn
            .query_row(
                "SELECT content FROM session_messages \
                 WHERE session_id = ?1 AND role = 'assistant' \
                 ORDER BY row_id DESC LIMIT 1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn new_session(id: &str) -> NewSession {
        NewSession {
            id: id.to_string(),
            agent_id: "agent-1".to_string(),
            name: "test".to_string(),
            ..NewSession::default()
        }
    }

    #[test]
    fn created_session_has_no_pid() {
        let s = store();
        let row = s.create_session(new_session("s1")).unwrap();
        assert_eq!(row.status, SessionStatus::Created);
        assert_eq!(row.pid, None);
    }

    #[test]
    fn pid_set_iff_running() {
        let s = store();
        s.create_session(new_session("s1")).unwrap();

        s.mark_session_running("s1", 4242).unwrap();
        let row = s.get_session("s1").unwrap();
        assert_eq!(row.status, SessionStatus::Running);
        assert_eq!(row.pid, Some(4242));

        s.mark_session_ended("s1", SessionStatus::Stopped).unwrap();
        let row = s.get_session("s1").unwrap();
        assert_eq!(row.status, SessionStatus::Stopped);
        assert_eq!(row.pid, None);
    }

    #[test]
    fn council_session_without_role_is_rejected() {
        let s = store();
        let mut ns = new_session("s1");
        ns.council_launch_id = Some("launch-1".to_string());
        assert!(matches!(
            s.create_session(ns),
            Err(DbError::Constraint(_))
        ));
    }

    #[test]
    fn delete_cascades_messages_and_clears_conversation() {
        let s = store();
        s.create_session(new_session("s1")).unwrap();
        s.append_session_message("s1", "user", "hi", 0.0).unwrap();
        s.upsert_conversation("PARTICIPANT", Some("agent-1"), Some("s1"), 10)
            .unwrap();

        s.delete_session("s1").unwrap();

        assert!(s.session_messages("s1").unwrap().is_empty());
        let convo = s.get_conversation("PARTICIPANT").unwrap().unwrap();
        assert_eq!(convo.session_id, None);
        // last_round survives the unbinding (spec: preserved).
        assert_eq!(convo.last_round, 10);
    }

    #[test]
    fn last_assistant_message_picks_latest() {
        let s = store();
        s.create_session(new_session("s1")).unwrap();
        s.append_session_message("s1", "assistant", "first", 0.0)
            .unwrap();
        s.append_session_message("s1", "tool", "noise", 0.0).unwrap();
        s.append_session_message("s1", "assistant", "second", 0.0)
            .unwrap();
        assert_eq!(
            s.last_assistant_message("s1").unwrap().as_deref(),
            Some("second")
        );
    }

    #[test]
    fn result_accumulation_adds_up() {
        let s = store();
        s.create_session(new_session("s1")).unwrap();
        s.add_session_result("s1", 0.25, 1).unwrap();
        s.add_session_result("s1", 0.50, 2).unwrap();
        let row = s.get_session("s1").unwrap();
        assert!((row.total_cost_usd - 0.75).abs() < f64::EPSILON);
        assert_eq!(row.total_turns, 3);
    }
}
