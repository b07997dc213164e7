// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Prompt builders for the three staged session flavours.

use quorum_db::DiscussionMessageRow;

use crate::aggregate::AgentResponse;

/// Discussion round prompt: every member sees the same shared context.
pub fn discussion_prompt(question: &str, round: u32, responses: &[AgentResponse]) -> String {
    let mut out = format!(
        "The council is deliberating on:\n\n{question}\n\n\
         Responses so far (round {round} of discussion):\n\n"
    );
    for r in responses {
        out.push_str(&format!("### {}\n{}\n\n", r.agent_name, r.content));
    }
    out.push_str(
        "Considering the other members' responses, refine or defend your position. \
         Be concrete about where you agree and disagree.",
    );
    out
}

/// Review prompt for one member: every *other* member's latest response,
/// never the reviewer's own.
pub fn review_prompt(question: &str, reviewer_agent_id: &str, responses: &[AgentResponse]) -> String {
    let mut out = format!(
        "The council was asked:\n\n{question}\n\n\
         Review the other members' responses below. Identify the strongest \
         points, factual errors, and anything missing, then give your own \
         final recommendation.\n\n"
    );
    for r in responses.iter().filter(|r| r.agent_id != reviewer_agent_id) {
        out.push_str(&format!("### {}\n{}\n\n", r.agent_name, r.content));
    }
    out
}

/// Chairman synthesis prompt.
pub fn synthesis_prompt(
    question: &str,
    responses: &[AgentResponse],
    discussion: Option<&[DiscussionMessageRow]>,
) -> String {
    let mut out = format!(
        "You are the chairman of this council. The question was:\n\n{question}\n\n\
         Member responses:\n\n"
    );
    for r in responses {
        out.push_str(&format!("### {}\n{}\n\n", r.agent_name, r.content));
    }
    if let Some(messages) = discussion {
        if !messages.is_empty() {
            out.push_str("Discussion transcript:\n\n");
            for m in messages {
                out.push_str(&format!("[round {}] {}: {}\n", m.round, m.agent_name, m.content));
            }
            out.push('\n');
        }
    }
    out.push_str(
        "Write the council's single final answer. Resolve disagreements \
         explicitly rather than averaging over them.",
    );
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
