// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Credit bookkeeping for non-owner senders.
//!
//! Credits carry no currency semantics — they are a rate-limiting ledger.
//! Owners (decided by the injected predicate at the call sites) bypass every
//! check and charge in this module.

use std::sync::Arc;

use quorum_config::CreditConfig;
use quorum_db::credits::CreditConfigRow;
use quorum_db::Store;
use tracing::debug;

/// Micro-units per whole payment unit.
const MICRO_PER_UNIT: f64 = 1_000_000.0;

#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    #[error("insufficient credits: balance {balance:.0}, need {needed:.0}")]
    Insufficient { balance: f64, needed: f64 },
    #[error(transparent)]
    Db(#[from] quorum_db::DbError),
}

pub struct CreditService {
    store: Arc<Store>,
    file_config: CreditConfig,
}

impl CreditService {
    pub fn new(store: Arc<Store>, file_config: CreditConfig) -> Self {
        Self { store, file_config }
    }

    /// Effective settings: the single-row DB table overrides the config file.
    pub fn effective_config(&self) -> CreditConfigRow {
        match self.store.credit_config() {
            Ok(Some(row)) => row,
            _ => CreditConfigRow {
                enabled: self.file_config.enabled,
                credits_per_turn: self.file_config.credits_per_turn,
                credits_per_algo: self.file_config.credits_per_algo,
                welcome_grant: self.file_config.welcome_grant,
            },
        }
    }

    /// Pre-flight check before spawning a session for a non-owner sender.
    pub fn can_start_session(&self, address: &str) -> Result<(), CreditError> {
        let cfg = self.effective_config();
        if !cfg.enabled {
            return Ok(());
        }
        let needed = cfg.credits_per_turn.ceil();
        let balance = self.store.credit_balance(address)?;
        if balance < needed {
            return Err(CreditError::Insufficient { balance, needed });
        }
        Ok(())
    }

    /// Charge one completed turn: `ceil(credits_per_turn) + extras`.
    /// Returns the amount charged (0.0 when credits are disabled).
    pub fn charge_turn(&self, address: &str, extras: f64) -> Result<f64, CreditError> {
        let cfg = self.effective_config();
        if !cfg.enabled {
            return Ok(0.0);
        }
        let charge = cfg.credits_per_turn.ceil() + extras;
        self.store.adjust_credits(address, -charge, "turn charge")?;
        debug!(address, charge, "credits charged");
        Ok(charge)
    }

    /// Credit the payment attached to an incoming message.  Only the excess
    /// over the minimum transport fee converts to credits; first-time senders
    /// may additionally receive the one-time welcome grant.
    pub fn credit_payment(
        &self,
        address: &str,
        amount_micro: u64,
        min_fee_micro: u64,
    ) -> Result<f64, CreditError> {
        let cfg = self.effective_config();
        if !cfg.enabled {
            return Ok(0.0);
        }
        let mut granted = 0.0;
        if cfg.welcome_grant > 0.0 && !self.store.credit_account_exists(address)? {
            self.store
                .adjust_credits(address, cfg.welcome_grant, "welcome grant")?;
            granted += cfg.welcome_grant;
        }
        if amount_micro > min_fee_micro {
            let excess_units = (amount_micro - min_fee_micro) as f64 / MICRO_PER_UNIT;
            let credits = excess_units * cfg.credits_per_algo;
            if credits > 0.0 {
                self.store.adjust_credits(address, credits, "payment")?;
                granted += credits;
            }
        }
        Ok(granted)
    }

    pub fn balance(&self, address: &str) -> Result<f64, CreditError> {
        Ok(self.store.credit_balance(address)?)
    }

    pub fn history(
        &self,
        address: &str,
        limit: u32,
    ) -> Result<Vec<quorum_db::CreditTransactionRow>, CreditError> {
        Ok(self.store.credit_history(address, limit)?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
