// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Prompt builders for scheduled actions.

use quorum_db::schedules::ActionConfig;

/// Build the `star_repos` research prompt from the action config.
pub fn star_repos_prompt(action: &ActionConfig) -> String {
    let topic = action
        .config
        .get("topic")
        .and_then(|v| v.as_str())
        .unwrap_or("recently active repositories in this project's ecosystem");
    let limit = action
        .config
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(5);
    format!(
        "Survey {topic}. Pick up to {limit} repositories worth starring and \
         summarise in one line each why. Do not take any action beyond \
         producing the list.",
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_uses_config_topic_and_limit() {
        let action = ActionConfig {
            action_type: "star_repos".to_string(),
            prompt: None,
            config: serde_json::json!({"topic": "rust async runtimes", "limit": 3}),
        };
        let prompt = star_repos_prompt(&action);
        assert!(prompt.contains("rust async runtimes"));
        assert!(prompt.contains("up to 3"));
    }

    #[test]
    fn prompt_has_sane_defaults() {
        let action = ActionConfig {
            action_type: "star_repos".to_string(),
            prompt: None,
            config: serde_json::Value::Null,
        };
        let prompt = star_repos_prompt(&action);
        assert!(prompt.contains("up to 5"));
    }
}
