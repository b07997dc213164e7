// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::{DbResult, Store};

/// One observation point of a project's code health counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshotRow {
    pub id: String,
    pub agent_id: String,
    pub project_id: String,
    pub tsc_errors: i64,
    pub test_failures: i64,
    pub todos: i64,
    pub fixmes: i64,
    pub hacks: i64,
    pub large_files: i64,
    pub outdated_deps: i64,
    pub tsc_passed: bool,
    pub tests_passed: bool,
    pub collected_at: String,
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<HealthSnapshotRow> {
    Ok(HealthSnapshotRow {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        project_id: row.get(2)?,
        tsc_errors: row.get(3)?,
        test_failures: row.get(4)?,
        todos: row.get(5)?,
        fixmes: row.get(6)?,
        hacks: row.get(7)?,
        large_files: row.get(8)?,
        outdated_deps: row.get(9)?,
        tsc_passed: row.get(10)?,
        tests_passed: row.get(11)?,
        collected_at: row.get(12)?,
    })
}

impl Store {
    pub fn save_health_snapshot(&self, snap: &HealthSnapshotRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO health_snapshots (id, agent_id, project_id, tsc_errors, test_failures, \
             todos, fixmes, hacks, large_files, outdated_deps, tsc_passed, tests_passed, \
             collected_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                snap.id,
                snap.agent_id,
                snap.project_id,
                snap.tsc_errors,
                snap.test_failures,
                snap.todos,
                snap.fixmes,
                snap.hacks,
                snap.large_files,
                snap.outdated_deps,
                snap.tsc_passed,
                snap.tests_passed,
                if snap.collected_at.is_empty() {
                    Self::now()
                } else {
                    snap.collected_at.clone()
                },
            ],
        )?;
        Ok(())
    }

    /// Newest-first snapshots for one (agent, project) pair.
    pub fn recent_health_snapshots(
        &self,
        agent_id: &str,
        project_id: &str,
        limit: u32,
    ) -> DbResult<Vec<HealthSnapshotRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, project_id, tsc_errors, test_failures, todos, fixmes, hacks, \
             large_files, outdated_deps, tsc_passed, tests_passed, collected_at \
             FROM health_snapshots WHERE agent_id = ?1 AND project_id = ?2 \
             ORDER BY collected_at DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![agent_id, project_id, limit], snapshot_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
