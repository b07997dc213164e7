// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DbResult, Store};

/// The durable binding participant → agent → current session, with the
/// high-water round the bridge has committed to having processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: String,
    pub participant_addr: String,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub last_round: u64,
}

impl Store {
    pub fn get_conversation(&self, participant: &str) -> DbResult<Option<ConversationRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, participant_addr, agent_id, session_id, last_round \
                 FROM algochat_conversations WHERE participant_addr = ?1",
                params![participant],
                |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        participant_addr: row.get(1)?,
                        agent_id: row.get(2)?,
                        session_id: row.get(3)?,
                        last_round: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Create or rebind the conversation for a participant.  `last_round` is
    /// monotonic: the stored value only moves forward.
    pub fn upsert_conversation(
        &self,
        participant: &str,
        agent_id: Option<&str>,
        session_id: Option<&str>,
        last_round: u64,
    ) -> DbResult<ConversationRow> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO algochat_conversations (id, participant_addr, agent_id, session_id, last_round) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(participant_addr) DO UPDATE SET \
                 agent_id = COALESCE(excluded.agent_id, agent_id), \
                 session_id = COALESCE(excluded.session_id, session_id), \
                 last_round = MAX(last_round, excluded.last_round)",
            params![
                Uuid::new_v4().to_string(),
                participant,
                agent_id,
                session_id,
                last_round as i64,
            ],
        )?;
        drop(conn);
        Ok(self.get_conversation(participant)?.expect("just upserted"))
    }

    pub fn set_conversation_agent(&self, participant: &str, agent_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE algochat_conversations SET agent_id = ?2, session_id = NULL \
             WHERE participant_addr = ?1",
            params![participant, agent_id],
        )?;
        Ok(())
    }

    /// Reverse lookup: which conversation is currently bound to a session.
    pub fn conversation_for_session(&self, session_id: &str) -> DbResult<Option<ConversationRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, participant_addr, agent_id, session_id, last_round \
                 FROM algochat_conversations WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        participant_addr: row.get(1)?,
                        agent_id: row.get(2)?,
                        session_id: row.get(3)?,
                        last_round: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn count_conversations(&self) -> DbResult<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT count(*) FROM algochat_conversations", [], |r| {
            r.get(0)
        })?;
        Ok(n as u64)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_round_never_regresses() {
        let s = Store::open_in_memory().unwrap();
        s.upsert_conversation("ADDR", None, None, 100).unwrap();
        let c = s.upsert_conversation("ADDR", None, None, 50).unwrap();
        assert_eq!(c.last_round, 100);
        let c = s.upsert_conversation("ADDR", None, None, 150).unwrap();
        assert_eq!(c.last_round, 150);
    }

    #[test]
    fn upsert_does_not_clear_binding_with_none() {
        let s = Store::open_in_memory().unwrap();
        s.create_session(crate::sessions::NewSession {
            id: "s1".to_string(),
            agent_id: "a1".to_string(),
            ..Default::default()
        })
        .unwrap();
        s.upsert_conversation("ADDR", Some("a1"), Some("s1"), 1)
            .unwrap();
        let c = s.upsert_conversation("ADDR", None, None, 2).unwrap();
        assert_eq!(c.agent_id.as_deref(), Some("a1"));
        assert_eq!(c.session_id.as_deref(), Some("s1"));
        assert_eq!(c.last_round, 2);
    }
}
