// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rusqlite::params;

use crate::{DbResult, Store};

impl Store {
    /// Record one on-chain message (either direction) for history views.
    #[allow(clippy::too_many_arguments)]
    pub fn record_algochat_message(
        &self,
        id: &str,
        tx_id: Option<&str>,
        sender: &str,
        recipient: &str,
        direction: &str,
        content: &str,
        round: u64,
        amount: u64,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO algochat_messages \
             (id, tx_id, sender, recipient, direction, content, round, amount, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                tx_id,
                sender,
                recipient,
                direction,
                content,
                round as i64,
                amount as i64,
                Self::now(),
            ],
        )?;
        Ok(())
    }
}
