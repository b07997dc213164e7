// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! SQLite persistence for the orchestration server.
//!
//! One [`Store`] wraps one `rusqlite::Connection` behind a mutex; SQLite
//! serialises writes anyway, so a single connection keeps the locking story
//! trivial.  Every component talks to the same `Arc<Store>`.
//!
//! Multi-row mutations (session delete cascade, dedup flush) run inside
//! explicit transactions.  Timestamps are RFC 3339 UTC text; JSON-shaped
//! columns (workflow nodes, schedule actions) are serialised with
//! `serde_json` at the boundary.

mod schema;

pub mod agents;
pub mod conversations;
pub mod councils;
pub mod credits;
pub mod dedup;
pub mod health;
pub mod messages;
pub mod notifications;
pub mod projects;
pub mod psk;
pub mod schedules;
pub mod sessions;
pub mod webhooks;
pub mod workflows;
pub mod worktasks;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

pub use agents::AgentRow;
pub use conversations::ConversationRow;
pub use councils::{CouncilLaunchRow, CouncilRow, CouncilStage, DiscussionMessageRow};
pub use credits::CreditTransactionRow;
pub use health::HealthSnapshotRow;
pub use notifications::{NotificationChannelRow, NotificationRow};
pub use projects::ProjectRow;
pub use psk::PskContactRow;
pub use schedules::{ApprovalPolicy, ScheduleRow, ScheduleStatus};
pub use sessions::{CouncilRole, SessionMessageRow, SessionRow, SessionSource, SessionStatus};
pub use webhooks::{WebhookDeliveryRow, WebhookRegistrationRow};
pub use workflows::{
    NodeRunStatus, RunStatus, WorkflowEdge, WorkflowNode, WorkflowNodeRunRow, WorkflowRow,
    WorkflowRunRow, WorkflowStatus,
};
pub use worktasks::WorkTaskRow;

/// Store-level error.  `NotFound` is safe and expected; everything else is a
/// genuine database failure.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// The single handle every component shares (as `Arc<Store>`).
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Current UTC timestamp in the canonical column format.
    pub(crate) fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_runs_migrations() {
        let store = Store::open_in_memory().unwrap();
        // Any table from the schema proves migrations ran.
        let conn = store.conn.lock().unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='sessions'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn open_on_disk_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quorum.db");
        drop(Store::open(&path).unwrap());
        // Second open must not fail on existing schema.
        drop(Store::open(&path).unwrap());
    }
}
