// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Persistence for the dedup service.  Each flush replaces a namespace's
//! whole key set (`DELETE` + bulk `INSERT` in one transaction) — the
//! in-memory LRU is authoritative and may change mid-flush, so incremental
//! writes would only chase a moving target.

use rusqlite::params;

use crate::{DbResult, Store};

impl Store {
    /// Replace the persisted key set for one namespace.
    pub fn flush_dedup_namespace(
        &self,
        namespace: &str,
        entries: &[(String, i64)],
    ) -> DbResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM dedup_state WHERE namespace = ?1",
            params![namespace],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO dedup_state (namespace, key, expires_at) VALUES (?1, ?2, ?3)",
            )?;
            for (key, expires_at) in entries {
                stmt.execute(params![namespace, key, expires_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Load the unexpired keys of a namespace and drop the expired rows.
    pub fn restore_dedup_namespace(
        &self,
        namespace: &str,
        now_ms: i64,
    ) -> DbResult<Vec<(String, i64)>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM dedup_state WHERE namespace = ?1 AND expires_at <= ?2",
            params![namespace, now_ms],
        )?;
        let entries = {
            let mut stmt = tx.prepare(
                "SELECT key, expires_at FROM dedup_state WHERE namespace = ?1 \
                 ORDER BY expires_at ASC",
            )?;
            let rows = stmt
                .query_map(params![namespace], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.commit()?;
        Ok(entries)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_replaces_namespace_wholesale() {
        let s = Store::open_in_memory().unwrap();
        s.flush_dedup_namespace("ns", &[("a".into(), 100), ("b".into(), 200)])
            .unwrap();
        s.flush_dedup_namespace("ns", &[("c".into(), 300)]).unwrap();
        let restored = s.restore_dedup_namespace("ns", 0).unwrap();
        assert_eq!(restored, vec![("c".to_string(), 300)]);
    }

    #[test]
    fn restore_drops_expired_rows() {
        let s = Store::open_in_memory().unwrap();
        s.flush_dedup_namespace("ns", &[("old".into(), 100), ("new".into(), 9000)])
            .unwrap();
        let restored = s.restore_dedup_namespace("ns", 500).unwrap();
        assert_eq!(restored, vec![("new".to_string(), 9000)]);
        // The expired row is gone from the table too.
        let again = s.restore_dedup_namespace("ns", 0).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn namespaces_are_isolated() {
        let s = Store::open_in_memory().unwrap();
        s.flush_dedup_namespace("a", &[("k".into(), 100)]).unwrap();
        s.flush_dedup_namespace("b", &[("k".into(), 100)]).unwrap();
        s.flush_dedup_namespace("a", &[]).unwrap();
        assert!(s.restore_dedup_namespace("a", 0).unwrap().is_empty());
        assert_eq!(s.restore_dedup_namespace("b", 0).unwrap().len(), 1);
    }
}
