// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Cadence evaluation: next-occurrence computation and the minimum-interval
//! floor.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use quorum_db::ScheduleRow;

/// Minimum effective cadence.
pub const MIN_CADENCE_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CadenceError {
    #[error("invalid cron expression")]
    BadCron,
    #[error("cadence below the one-minute floor")]
    TooFrequent,
    #[error("schedule needs exactly one of cron_expression or interval_ms")]
    Ambiguous,
}

/// Next matching instant of a cron expression strictly after `after` (UTC).
pub fn next_cron_after(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = CronSchedule::from_str(expr).ok()?;
    schedule.after(&after).next()
}

pub fn next_interval_after(interval_ms: u64, after: DateTime<Utc>) -> DateTime<Utc> {
    after + Duration::milliseconds(interval_ms.max(MIN_CADENCE_MS) as i64)
}

/// Reject schedules that would fire more often than the floor allows.
pub fn validate_cadence(schedule: &ScheduleRow) -> Result<(), CadenceError> {
    match (&schedule.cron_expression, schedule.interval_ms) {
        (Some(expr), None) => {
            let cron = CronSchedule::from_str(expr).map_err(|_| CadenceError::BadCron)?;
            // Sample two consecutive occurrences; a sub-minute gap anywhere
            // near the head is representative for the fixed-field grammar.
            let mut upcoming = cron.upcoming(Utc);
            if let (Some(a), Some(b)) = (upcoming.next(), upcoming.next()) {
                if (b - a) < Duration::milliseconds(MIN_CADENCE_MS as i64) {
                    return Err(CadenceError::TooFrequent);
                }
            }
            Ok(())
        }
        (None, Some(ms)) => {
            if ms < MIN_CADENCE_MS {
                return Err(CadenceError::TooFrequent);
            }
            Ok(())
        }
        _ => Err(CadenceError::Ambiguous),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
