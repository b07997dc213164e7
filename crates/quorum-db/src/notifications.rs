// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::{DbResult, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRow {
    pub id: String,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub title: Option<String>,
    pub message: String,
    pub level: String,
    pub created_at: String,
}

/// One delivery endpoint an agent has configured (discord, telegram, github,
/// algochat, slack).  `config` is the adapter-specific opaque JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannelRow {
    pub id: String,
    pub agent_id: String,
    pub channel_type: String,
    pub config: serde_json::Value,
    pub enabled: bool,
}

impl Store {
    pub fn insert_notification(&self, row: &NotificationRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notifications (id, agent_id, session_id, title, message, level, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.agent_id,
                row.session_id,
                row.title,
                row.message,
                row.level,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    pub fn notification_channels(&self, agent_id: &str) -> DbResult<Vec<NotificationChannelRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, channel_type, config, enabled FROM notification_channels \
             WHERE agent_id = ?1 AND enabled = 1",
        )?;
        let rows = stmt
            .query_map(params![agent_id], |row| {
                let config: String = row.get(3)?;
                Ok(NotificationChannelRow {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    channel_type: row.get(2)?,
                    config: serde_json::from_str(&config)
                        .unwrap_or(serde_json::Value::Null),
                    enabled: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn add_notification_channel(&self, row: &NotificationChannelRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notification_channels (id, agent_id, channel_type, config, enabled) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.id,
                row.agent_id,
                row.channel_type,
                serde_json::to_string(&row.config)?,
                row.enabled,
            ],
        )?;
        Ok(())
    }
}
