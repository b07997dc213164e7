// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Health-trend analytics over stored snapshots.
//!
//! Every metric is lower-is-better.  Classification splits the chronological
//! series at `ceil(n/2)` and compares half-means; a change below
//! `max(1, older_mean * 0.10)` counts as stable.

use serde::Serialize;

use quorum_db::HealthSnapshotRow;

/// Relative-change threshold fraction.
const THRESHOLD_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Regressing,
}

impl TrendDirection {
    fn label(&self) -> &'static str {
        match self {
            Self::Improving => "IMPROVING",
            Self::Stable => "STABLE",
            Self::Regressing => "REGRESSING",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Trend {
    pub name: &'static str,
    /// Chronological order (oldest first).
    pub values: Vec<i64>,
    pub direction: TrendDirection,
}

const METRICS: &[(&str, fn(&HealthSnapshotRow) -> i64)] = &[
    ("tsc_errors", |s| s.tsc_errors),
    ("test_failures", |s| s.test_failures),
    ("todos", |s| s.todos),
    ("fixmes", |s| s.fixmes),
    ("hacks", |s| s.hacks),
    ("large_files", |s| s.large_files),
    ("outdated_deps", |s| s.outdated_deps),
];

/// Classify trends over snapshots given newest-first (as stored queries
/// return them).  Fewer than two snapshots yield no trends.
pub fn compute_trends(snapshots: &[HealthSnapshotRow]) -> Vec<Trend> {
    if snapshots.len() < 2 {
        return Vec::new();
    }
    METRICS
        .iter()
        .map(|(name, extract)| {
            // Reverse into chronological order before splitting.
            let values: Vec<i64> = snapshots.iter().rev().map(extract).collect();
            let split = values.len().div_ceil(2);
            let older = &values[..split];
            let newer = &values[split..];
            let older_mean = mean(older);
            let newer_mean = mean(newer);
            let threshold = (older_mean * THRESHOLD_FRACTION).max(1.0);
            let direction = if (newer_mean - older_mean).abs() < threshold {
                TrendDirection::Stable
            } else if newer_mean < older_mean {
                TrendDirection::Improving
            } else {
                TrendDirection::Regressing
            };
            Trend {
                name,
                values,
                direction,
            }
        })
        .collect()
}

fn mean(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<i64>() as f64 / values.len() as f64
}

/// Render trends for inclusion in an agent prompt, one metric per line.
pub fn format_trends_for_prompt(trends: &[Trend]) -> String {
    if trends.is_empty() {
        return "No trend data available yet (need at least 2 improvement cycles).".to_string();
    }
    trends
        .iter()
        .map(|t| {
            let series = t
                .values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            format!("{}: {} [{}]", t.name, series, t.direction.label())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(tsc_errors: i64) -> HealthSnapshotRow {
        HealthSnapshotRow {
            id: String::new(),
            agent_id: "a1".to_string(),
            project_id: "p1".to_string(),
            tsc_errors,
            test_failures: 0,
            todos: 0,
            fixmes: 0,
            hacks: 0,
            large_files: 0,
            outdated_deps: 0,
            tsc_passed: tsc_errors == 0,
            tests_passed: true,
            collected_at: String::new(),
        }
    }

    #[test]
    fn single_snapshot_has_no_trends() {
        assert!(compute_trends(&[snapshot(3)]).is_empty());
        assert!(compute_trends(&[]).is_empty());
    }

    #[test]
    fn falling_error_count_is_improving() {
        // Newest-first input [2,5,8,10] ⇒ chronological [10,8,5,2].
        let snaps: Vec<_> = [2, 5, 8, 10].into_iter().map(snapshot).collect();
        let trends = compute_trends(&snaps);
        let tsc = trends.iter().find(|t| t.name == "tsc_errors").unwrap();
        assert_eq!(tsc.values, vec![10, 8, 5, 2]);
        assert_eq!(tsc.direction, TrendDirection::Improving);
    }

    #[test]
    fn rising_error_count_is_regressing() {
        let snaps: Vec<_> = [9, 6, 2, 1].into_iter().map(snapshot).collect();
        let tsc = &compute_trends(&snaps)[0];
        assert_eq!(tsc.direction, TrendDirection::Regressing);
    }

    #[test]
    fn small_change_is_stable() {
        // Means 100 vs 100.5 — below max(1, 10) threshold.
        let snaps: Vec<_> = [101, 100, 100, 100].into_iter().map(snapshot).collect();
        let tsc = &compute_trends(&snaps)[0];
        assert_eq!(tsc.direction, TrendDirection::Stable);
    }

    #[test]
    fn threshold_floor_is_one() {
        // Older mean 0 ⇒ threshold 1; going 0 → 1 is still stable,
        // 0 → 2 regresses.
        let stable: Vec<_> = [1, 0, 0, 0].into_iter().map(snapshot).collect();
        assert_eq!(compute_trends(&stable)[0].direction, TrendDirection::Stable);
        let worse: Vec<_> = [2, 2, 0, 0].into_iter().map(snapshot).collect();
        assert_eq!(
            compute_trends(&worse)[0].direction,
            TrendDirection::Regressing
        );
    }

    #[test]
    fn odd_count_splits_with_larger_older_half() {
        // Chronological [9, 9, 0]: older=[9,9], newer=[0].
        let snaps: Vec<_> = [0, 9, 9].into_iter().map(snapshot).collect();
        let tsc = &compute_trends(&snaps)[0];
        assert_eq!(tsc.values, vec![9, 9, 0]);
        assert_eq!(tsc.direction, TrendDirection::Improving);
    }

    #[test]
    fn format_empty_is_fixed_string() {
        assert_eq!(
            format_trends_for_prompt(&[]),
            "No trend data available yet (need at least 2 improvement cycles)."
        );
    }

    #[test]
    fn format_lists_values_and_direction() {
        let snaps: Vec<_> = [2, 5, 8, 10].into_iter().map(snapshot).collect();
        let out = format_trends_for_prompt(&compute_trends(&snaps));
        assert!(out.contains("tsc_errors: 10 -> 8 -> 5 -> 2 [IMPROVING]"));
        assert!(out.contains("todos: 0 -> 0 -> 0 -> 0 [STABLE]"));
    }
}
