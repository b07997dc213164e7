// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, Store};

/// The persistent identity a sub-process impersonates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRow {
    pub id: String,
    pub name: String,
    pub model: String,
    pub default_project_id: Option<String>,
    pub wallet_address: Option<String>,
    pub algochat_enabled: bool,
    pub algochat_auto: bool,
    /// JSON array of tool names this agent may use, or `None` for all.
    pub tool_permissions: Option<Vec<String>>,
    pub created_at: String,
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentRow> {
    let perms: Option<String> = row.get("tool_permissions")?;
    Ok(AgentRow {
        id: row.get("id")?,
        name: row.get("name")?,
        model: row.get("model")?,
        default_project_id: row.get("default_project_id")?,
        wallet_address: row.get("wallet_address")?,
        algochat_enabled: row.get("algochat_enabled")?,
        algochat_auto: row.get("algochat_auto")?,
        tool_permissions: perms.and_then(|p| serde_json::from_str(&p).ok()),
        created_at: row.get("created_at")?,
    })
}

const AGENT_COLS: &str = "id, name, model, default_project_id, wallet_address, \
     algochat_enabled, algochat_auto, tool_permissions, created_at";

impl Store {
    pub fn create_agent(&self, agent: &AgentRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let perms = agent
            .tool_permissions
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO agents (id, name, model, default_project_id, wallet_address, \
             algochat_enabled, algochat_auto, tool_permissions, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                agent.id,
                agent.name,
                agent.model,
                agent.default_project_id,
                agent.wallet_address,
                agent.algochat_enabled,
                agent.algochat_auto,
                perms,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> DbResult<AgentRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
            params![id],
            agent_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound("agent"))
    }

    pub fn list_agents(&self) -> DbResult<Vec<AgentRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare(&format!("SELECT {AGENT_COLS} FROM agents ORDER BY name ASC"))?;
        let rows = stmt
            .query_map([], agent_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Agents reachable over the on-chain channel, auto-routable first.
    pub fn list_algochat_agents(&self) -> DbResult<Vec<AgentRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE algochat_enabled = 1 \
             ORDER BY algochat_auto DESC, name ASC"
        ))?;
        let rows = stmt
            .query_map([], agent_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every known agent wallet address (for the ingress self-send filter).
    pub fn agent_wallet_addresses(&self) -> DbResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT wallet_address FROM agents WHERE wallet_address IS NOT NULL")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, name: &str) -> AgentRow {
        AgentRow {
            id: id.to_string(),
            name: name.to_string(),
            model: "default".to_string(),
            default_project_id: None,
            wallet_address: None,
            algochat_enabled: false,
            algochat_auto: false,
            tool_permissions: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn roundtrip_agent() {
        let s = Store::open_in_memory().unwrap();
        let mut a = agent("a1", "Scout");
        a.tool_permissions = Some(vec!["read".into(), "grep".into()]);
        s.create_agent(&a).unwrap();
        let got = s.get_agent("a1").unwrap();
        assert_eq!(got.name, "Scout");
        assert_eq!(got.tool_permissions.unwrap().len(), 2);
    }

    #[test]
    fn algochat_agents_auto_first() {
        let s = Store::open_in_memory().unwrap();
        let mut a = agent("a1", "Alpha");
        a.algochat_enabled = true;
        let mut b = agent("b1", "Beta");
        b.algochat_enabled = true;
        b.algochat_auto = true;
        s.create_agent(&a).unwrap();
        s.create_agent(&b).unwrap();
        let list = s.list_algochat_agents().unwrap();
        assert_eq!(list[0].id, "b1");
    }
}
