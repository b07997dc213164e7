// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistrationRow {
    pub id: String,
    pub url: String,
    pub events: Vec<String>,
    pub secret: Option<String>,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryRow {
    pub id: String,
    pub webhook_id: Option<String>,
    pub source: String,
    pub event_id: String,
    pub status: String,
    pub payload: String,
    pub created_at: String,
}

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookRegistrationRow> {
    let events: String = row.get(2)?;
    Ok(WebhookRegistrationRow {
        id: row.get(0)?,
        url: row.get(1)?,
        events: serde_json::from_str(&events).unwrap_or_default(),
        secret: row.get(3)?,
        active: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookDeliveryRow> {
    Ok(WebhookDeliveryRow {
        id: row.get(0)?,
        webhook_id: row.get(1)?,
        source: row.get(2)?,
        event_id: row.get(3)?,
        status: row.get(4)?,
        payload: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl Store {
    pub fn create_webhook(&self, row: &WebhookRegistrationRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO webhook_registrations (id, url, events, secret, active, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.id,
                row.url,
                serde_json::to_string(&row.events)?,
                row.secret,
                row.active,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_webhook(&self, id: &str) -> DbResult<WebhookRegistrationRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, url, events, secret, active, created_at FROM webhook_registrations \
             WHERE id = ?1",
            params![id],
            registration_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound("webhook"))
    }

    pub fn list_webhooks(&self) -> DbResult<Vec<WebhookRegistrationRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, url, events, secret, active, created_at FROM webhook_registrations \
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], registration_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_webhook(&self, row: &WebhookRegistrationRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE webhook_registrations SET url = ?2, events = ?3, secret = ?4, active = ?5 \
             WHERE id = ?1",
            params![
                row.id,
                row.url,
                serde_json::to_string(&row.events)?,
                row.secret,
                row.active,
            ],
        )?;
        if n == 0 {
            return Err(DbError::NotFound("webhook"));
        }
        Ok(())
    }

    pub fn delete_webhook(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM webhook_registrations WHERE id = ?1",
            params![id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound("webhook"));
        }
        Ok(())
    }

    pub fn record_webhook_delivery(&self, row: &WebhookDeliveryRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO webhook_deliveries (id, webhook_id, source, event_id, status, payload, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.webhook_id,
                row.source,
                row.event_id,
                row.status,
                row.payload,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    pub fn webhook_deliveries(
        &self,
        webhook_id: Option<&str>,
        limit: u32,
    ) -> DbResult<Vec<WebhookDeliveryRow>> {
        let conn = self.conn.lock().unwrap();
        let rows = match webhook_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, webhook_id, source, event_id, status, payload, created_at \
                     FROM webhook_deliveries WHERE webhook_id = ?1 \
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![id, limit], delivery_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, webhook_id, source, event_id, status, payload, created_at \
                     FROM webhook_deliveries ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], delivery_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }
}
