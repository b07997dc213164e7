// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Council and council-launch queries.
//!
//! A launch snapshots the council's member list, chairman, and round count at
//! launch time; later edits to the council never affect a launch in flight.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, Store};

/// Deliberation stage.  Transitions follow the trigger DAG; `Complete` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouncilStage {
    Queued,
    Responding,
    Discussing,
    Reviewing,
    Synthesizing,
    Complete,
    Failed,
}

impl CouncilStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Responding => "responding",
            Self::Discussing => "discussing",
            Self::Reviewing => "reviewing",
            Self::Synthesizing => "synthesizing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "responding" => Some(Self::Responding),
            "discussing" => Some(Self::Discussing),
            "reviewing" => Some(Self::Reviewing),
            "synthesizing" => Some(Self::Synthesizing),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// A named group of agents that deliberates on one prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub member_agent_ids: Vec<String>,
    pub chairman_agent_id: Option<String>,
    pub discussion_rounds: u32,
    pub created_at: String,
}

/// One execution of a council.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilLaunchRow {
    pub id: String,
    pub council_id: String,
    pub project_id: Option<String>,
    pub prompt: String,
    pub stage: CouncilStage,
    pub synthesis: Option<String>,
    pub error: Option<String>,
    /// Member list frozen at launch time.
    pub member_agent_ids: Vec<String>,
    pub chairman_agent_id: Option<String>,
    pub discussion_rounds: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// One member contribution within a discussion round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionMessageRow {
    pub id: i64,
    pub launch_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub round: u32,
    pub content: String,
    pub created_at: String,
}

fn launch_from_row(row: &Row<'_>) -> rusqlite::Result<CouncilLaunchRow> {
    let stage: String = row.get("stage")?;
    let members: String = row.get("member_agent_ids")?;
    Ok(CouncilLaunchRow {
        id: row.get("id")?,
        council_id: row.get("council_id")?,
        project_id: row.get("project_id")?,
        prompt: row.get("prompt")?,
        stage: CouncilStage::parse(&stage).unwrap_or(CouncilStage::Failed),
        synthesis: row.get("synthesis")?,
        error: row.get("error")?,
        member_agent_ids: serde_json::from_str(&members).unwrap_or_default(),
        chairman_agent_id: row.get("chairman_agent_id")?,
        discussion_rounds: row.get::<_, i64>("discussion_rounds")? as u32,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const LAUNCH_COLS: &str = "id, council_id, project_id, prompt, stage, synthesis, error, \
     member_agent_ids, chairman_agent_id, discussion_rounds, created_at, updated_at";

impl Store {
    pub fn create_council(&self, council: &CouncilRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO councils (id, name, description, member_agent_ids, \
             chairman_agent_id, discussion_rounds, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                council.id,
                council.name,
                council.description,
                serde_json::to_string(&council.member_agent_ids)?,
                council.chairman_agent_id,
                council.discussion_rounds,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_council(&self, id: &str) -> DbResult<CouncilRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, description, member_agent_ids, chairman_agent_id, \
             discussion_rounds, created_at FROM councils WHERE id = ?1",
            params![id],
            council_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound("council"))
    }

    pub fn find_council_by_name(&self, name: &str) -> DbResult<Option<CouncilRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, description, member_agent_ids, chairman_agent_id, \
                 discussion_rounds, created_at FROM councils WHERE name = ?1 COLLATE NOCASE",
                params![name],
                council_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Create a launch in stage `queued`, snapshotting the council definition.
    pub fn create_launch(
        &self,
        id: &str,
        council: &CouncilRow,
        project_id: Option<&str>,
        prompt: &str,
    ) -> DbResult<CouncilLaunchRow> {
        let now = Self::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO council_launches (id, council_id, project_id, prompt, stage, \
             member_agent_ids, chairman_agent_id, discussion_rounds, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                council.id,
                project_id,
                prompt,
                serde_json::to_string(&council.member_agent_ids)?,
                council.chairman_agent_id,
                council.discussion_rounds,
                now,
            ],
        )?;
        drop(conn);
        self.get_launch(id)
    }

    pub fn get_launch(&self, id: &str) -> DbResult<CouncilLaunchRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {LAUNCH_COLS} FROM council_launches WHERE id = ?1"),
            params![id],
            launch_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound("council launch"))
    }

    pub fn set_launch_stage(&self, id: &str, stage: CouncilStage) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE council_launches SET stage = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, stage.as_str(), Self::now()],
        )?;
        if n == 0 {
            return Err(DbError::NotFound("council launch"));
        }
        Ok(())
    }

    /// Write the synthesis and move to `complete` in one statement.
    pub fn complete_launch(&self, id: &str, synthesis: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE council_launches SET stage = 'complete', synthesis = ?2, updated_at = ?3 \
             WHERE id = ?1",
            params![id, synthesis, Self::now()],
        )?;
        if n == 0 {
            return Err(DbError::NotFound("council launch"));
        }
        Ok(())
    }

    pub fn fail_launch(&self, id: &str, error: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE council_launches SET stage = 'failed', error = ?2, updated_at = ?3 \
             WHERE id = ?1",
            params![id, error, Self::now()],
        )?;
        if n == 0 {
            return Err(DbError::NotFound("council launch"));
        }
        Ok(())
    }

    pub fn add_discussion_message(
        &self,
        launch_id: &str,
        agent_id: &str,
        agent_name: &str,
        round: u32,
        content: &str,
    ) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO council_discussion_messages \
             (launch_id, agent_id, agent_name, round, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![launch_id, agent_id, agent_name, round, content, Self::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All discussion messages for a launch, ordered by (round, insertion).
    pub fn discussion_messages(&self, launch_id: &str) -> DbResult<Vec<DiscussionMessageRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, launch_id, agent_id, agent_name, round, content, created_at \
             FROM council_discussion_messages WHERE launch_id = ?1 ORDER BY round ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![launch_id], |row| {
                Ok(DiscussionMessageRow {
                    id: row.get(0)?,
                    launch_id: row.get(1)?,
                    agent_id: row.get(2)?,
                    agent_name: row.get(3)?,
                    round: row.get::<_, i64>(4)? as u32,
                    content: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn council_from_row(row: &Row<'_>) -> rusqlite::Result<CouncilRow> {
    let members: String = row.get("member_agent_ids")?;
    Ok(CouncilRow {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        member_agent_ids: serde_json::from_str(&members).unwrap_or_default(),
        chairman_agent_id: row.get("chairman_agent_id")?,
        discussion_rounds: row.get::<_, i64>("discussion_rounds")? as u32,
        created_at: row.get("created_at")?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn council(id: &str, name: &str) -> CouncilRow {
        CouncilRow {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            member_agent_ids: vec!["a1".into(), "a2".into()],
            chairman_agent_id: Some("a1".into()),
            discussion_rounds: 1,
            created_at: String::new(),
        }
    }

    #[test]
    fn launch_snapshots_member_list() {
        let s = Store::open_in_memory().unwrap();
        let c = council("c1", "Review Board");
        s.create_council(&c).unwrap();
        let launch = s.create_launch("l1", &c, None, "question?").unwrap();
        assert_eq!(launch.stage, CouncilStage::Queued);
        assert_eq!(launch.member_agent_ids, vec!["a1", "a2"]);
        assert_eq!(launch.chairman_agent_id.as_deref(), Some("a1"));
    }

    #[test]
    fn council_lookup_is_case_insensitive() {
        let s = Store::open_in_memory().unwrap();
        s.create_council(&council("c1", "Review Board")).unwrap();
        assert!(s.find_council_by_name("review board").unwrap().is_some());
        assert!(s.find_council_by_name("missing").unwrap().is_none());
    }

    #[test]
    fn complete_launch_writes_synthesis() {
        let s = Store::open_in_memory().unwrap();
        let c = council("c1", "Board");
        s.create_council(&c).unwrap();
        s.create_launch("l1", &c, None, "q").unwrap();
        s.complete_launch("l1", "the answer").unwrap();
        let l = s.get_launch("l1").unwrap();
        assert_eq!(l.stage, CouncilStage::Complete);
        assert_eq!(l.synthesis.as_deref(), Some("the answer"));
    }

    #[test]
    fn discussion_messages_ordered_by_round_then_insertion() {
        let s = Store::open_in_memory().unwrap();
        let c = council("c1", "Board");
        s.create_council(&c).unwrap();
        s.create_launch("l1", &c, None, "q").unwrap();
        s.add_discussion_message("l1", "a2", "Two", 2, "late").unwrap();
        s.add_discussion_message("l1", "a1", "One", 1, "first").unwrap();
        s.add_discussion_message("l1", "a2", "Two", 1, "second").unwrap();
        let msgs = s.discussion_messages("l1").unwrap();
        let order: Vec<_> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "late"]);
    }
}
