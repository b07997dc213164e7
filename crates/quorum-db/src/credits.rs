// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::{DbResult, Store};

/// One credit-ledger entry (positive = grant, negative = charge).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransactionRow {
    pub id: i64,
    pub address: String,
    pub amount: f64,
    pub reason: String,
    pub created_at: String,
}

/// Runtime credit settings; a single-row table that overrides the file
/// config when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditConfigRow {
    pub enabled: bool,
    pub credits_per_turn: f64,
    pub credits_per_algo: f64,
    pub welcome_grant: f64,
}

impl Store {
    pub fn credit_balance(&self, address: &str) -> DbResult<f64> {
        let conn = self.conn.lock().unwrap();
        let balance = conn
            .query_row(
                "SELECT balance FROM credit_balances WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0.0))
    }

    /// True if the address has ever held a balance row (used to decide the
    /// one-time welcome grant).
    pub fn credit_account_exists(&self, address: &str) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT count(*) FROM credit_balances WHERE address = ?1",
            params![address],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Apply a signed credit delta and record the ledger entry atomically.
    pub fn adjust_credits(&self, address: &str, amount: f64, reason: &str) -> DbResult<f64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Self::now();
        tx.execute(
            "INSERT INTO credit_balances (address, balance, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?3) \
             ON CONFLICT(address) DO UPDATE SET balance = balance + ?2, updated_at = ?3",
            params![address, amount, now],
        )?;
        tx.execute(
            "INSERT INTO credit_transactions (address, amount, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![address, amount, reason, now],
        )?;
        let balance: f64 = tx.query_row(
            "SELECT balance FROM credit_balances WHERE address = ?1",
            params![address],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(balance)
    }

    /// Most recent ledger entries, newest first; `limit` is capped at 20.
    pub fn credit_history(&self, address: &str, limit: u32) -> DbResult<Vec<CreditTransactionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, address, amount, reason, created_at FROM credit_transactions \
             WHERE address = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![address, limit.min(20)], |row| {
                Ok(CreditTransactionRow {
                    id: row.get(0)?,
                    address: row.get(1)?,
                    amount: row.get(2)?,
                    reason: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn credit_config(&self) -> DbResult<Option<CreditConfigRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT enabled, credits_per_turn, credits_per_algo, welcome_grant \
                 FROM credit_config WHERE id = 1",
                [],
                |row| {
                    Ok(CreditConfigRow {
                        enabled: row.get(0)?,
                        credits_per_turn: row.get(1)?,
                        credits_per_algo: row.get(2)?,
                        welcome_grant: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_credit_config(&self, cfg: &CreditConfigRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO credit_config (id, enabled, credits_per_turn, credits_per_algo, \
             welcome_grant) VALUES (1, ?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET enabled = ?1, credits_per_turn = ?2, \
             credits_per_algo = ?3, welcome_grant = ?4",
            params![
                cfg.enabled,
                cfg.credits_per_turn,
                cfg.credits_per_algo,
                cfg.welcome_grant
            ],
        )?;
        Ok(())
    }

    // ── Owner allowlist ───────────────────────────────────────────────────────

    pub fn allowlist_contains(&self, address: &str) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT count(*) FROM allowlist WHERE address = ?1",
            params![address],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn allowlist_add(&self, address: &str, label: Option<&str>) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO allowlist (address, label, added_at) VALUES (?1, ?2, ?3)",
            params![address, label, Self::now()],
        )?;
        Ok(())
    }

    pub fn allowlist_remove(&self, address: &str) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM allowlist WHERE address = ?1", params![address])?;
        Ok(n > 0)
    }

    // ── Daily fee budget ledger ───────────────────────────────────────────────

    pub fn record_algo_spend(
        &self,
        day: &str,
        fee: i64,
        session_id: Option<&str>,
        participant: &str,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO algo_spend_ledger (day, fee, session_id, participant, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![day, fee, session_id, participant, Self::now()],
        )?;
        Ok(())
    }

    pub fn algo_spend_for_day(&self, day: &str) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        let total: Option<i64> = conn.query_row(
            "SELECT sum(fee) FROM algo_spend_ledger WHERE day = ?1",
            params![day],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_credits_tracks_balance_and_ledger() {
        let s = Store::open_in_memory().unwrap();
        assert_eq!(s.credit_balance("ADDR").unwrap(), 0.0);
        assert!(!s.credit_account_exists("ADDR").unwrap());

        let bal = s.adjust_credits("ADDR", 100.0, "welcome grant").unwrap();
        assert_eq!(bal, 100.0);
        let bal = s.adjust_credits("ADDR", -30.0, "turn charge").unwrap();
        assert_eq!(bal, 70.0);

        let hist = s.credit_history("ADDR", 10).unwrap();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].amount, -30.0); // newest first
    }

    #[test]
    fn history_limit_caps_at_twenty() {
        let s = Store::open_in_memory().unwrap();
        for i in 0..25 {
            s.adjust_credits("ADDR", 1.0, &format!("grant {i}")).unwrap();
        }
        assert_eq!(s.credit_history("ADDR", 100).unwrap().len(), 20);
    }

    #[test]
    fn daily_spend_sums_per_day() {
        let s = Store::open_in_memory().unwrap();
        s.record_algo_spend("2026-08-01", 1000, None, "P1").unwrap();
        s.record_algo_spend("2026-08-01", 2000, None, "P2").unwrap();
        s.record_algo_spend("2026-08-02", 500, None, "P1").unwrap();
        assert_eq!(s.algo_spend_for_day("2026-08-01").unwrap(), 3000);
        assert_eq!(s.algo_spend_for_day("2026-08-03").unwrap(), 0);
    }
}
