// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Response aggregation across a launch's sessions.
//!
//! Reviewer sessions outrank member sessions: as soon as any reviewer has
//! produced an assistant message, only reviewers contribute.  Within the
//! contributing flavour, each agent is represented by the last assistant
//! message of its most recent session; empty sessions contribute nothing.

use std::collections::HashMap;

use quorum_db::{CouncilRole, SessionRow, Store};

/// Fallback synthesis when nobody said anything.
pub const EMPTY_AGGREGATE: &str = "(No responses were produced by council members)";

#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub agent_id: String,
    pub agent_name: String,
    pub content: String,
}

fn agent_name(store: &Store, agent_id: &str) -> String {
    store
        .get_agent(agent_id)
        .map(|a| a.name)
        .unwrap_or_else(|_| agent_id.to_string())
}

/// Latest per-agent responses for a launch, reviewer-preferred.
pub fn latest_responses(
    store: &Store,
    sessions: &[SessionRow],
) -> Result<Vec<AgentResponse>, quorum_db::DbError> {
    let collect = |role: CouncilRole| -> Result<Vec<AgentResponse>, quorum_db::DbError> {
        // Sessions arrive in creation order; later entries win per agent.
        let mut latest: HashMap<String, String> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for session in sessions.iter().filter(|s| s.council_role == Some(role)) {
            if let Some(content) = store.last_assistant_message(&session.id)? {
                if !latest.contains_key(&session.agent_id) {
                    order.push(session.agent_id.clone());
                }
                latest.insert(session.agent_id.clone(), content);
            }
        }
        Ok(order
            .into_iter()
            .map(|agent_id| {
                let content = latest.remove(&agent_id).expect("inserted above");
                AgentResponse {
                    agent_name: agent_name(store, &agent_id),
                    agent_id,
                    content,
                }
            })
            .collect())
    };

    let reviewers = collect(CouncilRole::Reviewer)?;
    if !reviewers.is_empty() {
        return Ok(reviewers);
    }
    collect(CouncilRole::Member)
}

/// Render responses as `### {agentName}` blocks joined by `---` rules.
pub fn aggregate_with_separators(responses: &[AgentResponse]) -> String {
    if responses.is_empty() {
        return EMPTY_AGGREGATE.to_string();
    }
    responses
        .iter()
        .map(|r| format!("### {}\n{}", r.agent_name, r.content))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
