// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Pre-shared-key contact and ratchet-state queries.
//!
//! Invariant: at most one contact may claim a given mobile address on a given
//! network.  Claiming an address inside [`Store::claim_mobile_address`]
//! unbinds any prior claimant and deletes its ratchet state in the same
//! transaction.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PskContactRow {
    pub id: String,
    pub nickname: String,
    pub network: String,
    /// Base64-encoded pre-shared key material.
    pub psk: String,
    pub mobile_address: Option<String>,
    pub active: bool,
    pub created_at: String,
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<PskContactRow> {
    Ok(PskContactRow {
        id: row.get(0)?,
        nickname: row.get(1)?,
        network: row.get(2)?,
        psk: row.get(3)?,
        mobile_address: row.get(4)?,
        active: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const CONTACT_COLS: &str = "id, nickname, network, psk, mobile_address, active, created_at";

impl Store {
    pub fn create_psk_contact(&self, row: &PskContactRow) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO psk_contacts (id, nickname, network, psk, mobile_address, active, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.nickname,
                row.network,
                row.psk,
                row.mobile_address,
                row.active,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_psk_contact(&self, id: &str) -> DbResult<PskContactRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {CONTACT_COLS} FROM psk_contacts WHERE id = ?1"),
            params![id],
            contact_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound("psk contact"))
    }

    pub fn list_psk_contacts(&self) -> DbResult<Vec<PskContactRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTACT_COLS} FROM psk_contacts WHERE active = 1"
        ))?;
        let rows = stmt
            .query_map([], contact_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Active contacts that have not yet discovered their partner address.
    pub fn unmatched_psk_contacts(&self) -> DbResult<Vec<PskContactRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTACT_COLS} FROM psk_contacts \
             WHERE active = 1 AND mobile_address IS NULL"
        ))?;
        let rows = stmt
            .query_map([], contact_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn psk_contact_for_address(
        &self,
        address: &str,
        network: &str,
    ) -> DbResult<Option<PskContactRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {CONTACT_COLS} FROM psk_contacts \
                     WHERE mobile_address = ?1 AND network = ?2 AND active = 1"
                ),
                params![address, network],
                contact_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Bind `address` to `contact_id`, unbinding any prior claimant on the
    /// same network and migrating ratchet state from the contact-id
    /// placeholder key to the real address key.
    pub fn claim_mobile_address(
        &self,
        contact_id: &str,
        network: &str,
        address: &str,
    ) -> DbResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        // Prior claimant loses the address and its ratchet state.
        tx.execute(
            "UPDATE psk_contacts SET mobile_address = NULL \
             WHERE mobile_address = ?1 AND network = ?2 AND id != ?3",
            params![address, network, contact_id],
        )?;
        tx.execute(
            "DELETE FROM algochat_psk_state WHERE address = ?1 AND network = ?2",
            params![address, network],
        )?;
        // Placeholder-keyed state (keyed by contact id before discovery)
        // moves to the real address.
        tx.execute(
            "UPDATE algochat_psk_state SET address = ?1, updated_at = ?3 \
             WHERE address = ?2 AND network = ?4",
            params![address, contact_id, Self::now(), network],
        )?;
        let n = tx.execute(
            "UPDATE psk_contacts SET mobile_address = ?2 WHERE id = ?1",
            params![contact_id, address],
        )?;
        tx.commit()?;
        if n == 0 {
            return Err(DbError::NotFound("psk contact"));
        }
        Ok(())
    }

    pub fn deactivate_psk_contact(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE psk_contacts SET active = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // ── Ratchet state ─────────────────────────────────────────────────────────

    pub fn psk_state(&self, address: &str, network: &str) -> DbResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT state FROM algochat_psk_state WHERE address = ?1 AND network = ?2",
                params![address, network],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    pub fn save_psk_state(&self, address: &str, network: &str, state: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO algochat_psk_state (address, network, state, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(address) DO UPDATE SET state = ?3, updated_at = ?4",
            params![address, network, state, Self::now()],
        )?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: &str, nickname: &str) -> PskContactRow {
        PskContactRow {
            id: id.to_string(),
            nickname: nickname.to_string(),
            network: "mainnet".to_string(),
            psk: "cHNrLWJ5dGVz".to_string(),
            mobile_address: None,
            active: true,
            created_at: String::new(),
        }
    }

    #[test]
    fn claim_unbinds_prior_claimant() {
        let s = Store::open_in_memory().unwrap();
        s.create_psk_contact(&contact("c1", "alice")).unwrap();
        s.create_psk_contact(&contact("c2", "bob")).unwrap();

        s.claim_mobile_address("c1", "mainnet", "ADDR").unwrap();
        s.claim_mobile_address("c2", "mainnet", "ADDR").unwrap();

        assert_eq!(s.get_psk_contact("c1").unwrap().mobile_address, None);
        assert_eq!(
            s.get_psk_contact("c2").unwrap().mobile_address.as_deref(),
            Some("ADDR")
        );
    }

    #[test]
    fn claim_migrates_placeholder_state() {
        let s = Store::open_in_memory().unwrap();
        s.create_psk_contact(&contact("c1", "alice")).unwrap();
        // Ratchet state keyed by contact id before the address is known.
        s.save_psk_state("c1", "mainnet", "{\"ctr\":7}").unwrap();

        s.claim_mobile_address("c1", "mainnet", "ADDR").unwrap();

        assert_eq!(s.psk_state("c1", "mainnet").unwrap(), None);
        assert_eq!(
            s.psk_state("ADDR", "mainnet").unwrap().as_deref(),
            Some("{\"ctr\":7}")
        );
    }

    #[test]
    fn unmatched_excludes_bound_contacts() {
        let s = Store::open_in_memory().unwrap();
        s.create_psk_contact(&contact("c1", "alice")).unwrap();
        s.create_psk_contact(&contact("c2", "bob")).unwrap();
        s.claim_mobile_address("c1", "mainnet", "ADDR").unwrap();
        let unmatched = s.unmatched_psk_contacts().unwrap();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].id, "c2");
    }
}
