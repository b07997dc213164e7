// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::{DbResult, Store};

/// An agent session pinned to a fresh git branch.  Execution is external;
/// the server only tracks the record and enforces the daily cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkTaskRow {
    pub id: String,
    pub agent_id: Option<String>,
    pub description: String,
    pub branch: String,
    pub status: String,
    pub created_at: String,
}

impl Store {
    pub fn create_work_task(&self, row: &WorkTaskRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO work_tasks (id, agent_id, description, branch, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.id,
                row.agent_id,
                row.description,
                row.branch,
                row.status,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    /// Work tasks created since the given RFC 3339 instant (daily cap check).
    pub fn count_work_tasks_since(&self, since: &str) -> DbResult<u32> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT count(*) FROM work_tasks WHERE created_at >= ?1",
            params![since],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }
}
