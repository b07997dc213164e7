// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Slash commands on the chat channel.  Privileged commands require owner
//! status; an unknown `/x` falls through to the agent as plain text.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use quorum_core::approvals::{ApprovalDecision, ApprovalMode};
use quorum_council::CouncilEvent;
use quorum_db::{CouncilRow, CouncilStage, WorkTaskRow};

use crate::bridge::AlgoChatBridge;

/// Synthesis replies are cut to this many characters on-chain.
const SYNTHESIS_REPLY_CHARS: usize = 3000;

#[derive(Debug)]
pub enum CommandOutcome {
    /// The command was consumed; optionally reply with this text.
    Handled(Option<String>),
    /// Not a known command — deliver to the agent as plain text.
    Unhandled,
}

impl AlgoChatBridge {
    pub(crate) async fn handle_command(
        &self,
        participant: &str,
        text: &str,
        is_owner: bool,
    ) -> CommandOutcome {
        let mut parts = text.splitn(2, char::is_whitespace);
        let verb = parts.next().unwrap_or("").to_ascii_lowercase();
        let rest = parts.next().unwrap_or("").trim();

        // Owner-only commands answered uniformly for everyone else.
        let owner_only = matches!(
            verb.as_str(),
            "/stop" | "/agent" | "/queue" | "/approve" | "/deny" | "/mode" | "/work" | "/council"
        );
        if owner_only && !is_owner {
            warn!(participant, verb, "privileged command from non-owner");
            return CommandOutcome::Handled(Some(
                "That command needs owner authority.".to_string(),
            ));
        }

        match verb.as_str() {
            "/status" => {
                let sessions = self.processes.active_session_ids().len();
                let conversations = self.store.count_conversations().unwrap_or(0);
                CommandOutcome::Handled(Some(format!(
                    "Active sessions: {sessions}, conversations: {conversations}"
                )))
            }

            "/stop" => {
                if rest.is_empty() {
                    return CommandOutcome::Handled(Some("Usage: /stop <sessionId>".to_string()));
                }
                if self.processes.is_running(rest) {
                    self.processes.stop_process(rest).await;
                    CommandOutcome::Handled(Some(format!("Stopping session {rest}")))
                } else {
                    CommandOutcome::Handled(Some(format!("Session {rest} is not running")))
                }
            }

            "/agent" => {
                if rest.is_empty() {
                    let agents = self.store.list_algochat_agents().unwrap_or_default();
                    if agents.is_empty() {
                        return CommandOutcome::Handled(Some(
                            "No algochat-enabled agents.".to_string(),
                        ));
                    }
                    let default = self.default_agent_id.lock().unwrap().clone();
                    let lines: Vec<String> = agents
                        .iter()
                        .map(|a| {
                            let marker = if Some(&a.id) == default.as_ref() {
                                " (default)"
                            } else {
                                ""
                            };
                            format!("{}{marker}", a.name)
                        })
                        .collect();
                    CommandOutcome::Handled(Some(format!("Agents: {}", lines.join(", "))))
                } else {
                    let agents = self.store.list_algochat_agents().unwrap_or_default();
                    match agents
                        .iter()
                        .find(|a| a.name.eq_ignore_ascii_case(rest))
                    {
                        Some(agent) => {
                            *self.default_agent_id.lock().unwrap() = Some(agent.id.clone());
                            CommandOutcome::Handled(Some(format!(
                                "Default agent set to {}",
                                agent.name
                            )))
                        }
                        None => CommandOutcome::Handled(Some(format!(
                            "No algochat-enabled agent named {rest:?}"
                        ))),
                    }
                }
            }

            "/queue" => {
                let pending = self.processes.approvals().pending();
                if pending.is_empty() {
                    return CommandOutcome::Handled(Some("No pending approvals.".to_string()));
                }
                let lines: Vec<String> = pending
                    .iter()
                    .map(|p| {
                        format!(
                            "#{} [{}] {} (session {})",
                            p.queue_no,
                            p.short_id,
                            p.tool,
                            &p.session_id[..8.min(p.session_id.len())],
                        )
                    })
                    .collect();
                CommandOutcome::Handled(Some(format!("Pending approvals:\n{}", lines.join("\n"))))
            }

            "/approve" | "/deny" => {
                let decision = if verb == "/approve" {
                    ApprovalDecision::Approve
                } else {
                    ApprovalDecision::Deny
                };
                let Ok(queue_no) = rest.parse::<u64>() else {
                    return CommandOutcome::Handled(Some(format!("Usage: {verb} <number>")));
                };
                // Owner status already gated above; the per-request sender
                // match only applies to bare chain replies.
                match self
                    .processes
                    .approvals()
                    .resolve_by_queue_no(queue_no, decision, None)
                {
                    Ok(()) => CommandOutcome::Handled(Some(format!(
                        "Approval #{queue_no} {}",
                        if decision == ApprovalDecision::Approve {
                            "approved"
                        } else {
                            "denied"
                        }
                    ))),
                    Err(e) => CommandOutcome::Handled(Some(format!("#{queue_no}: {e}"))),
                }
            }

            "/mode" => match ApprovalMode::parse(&rest.to_ascii_lowercase()) {
                Some(mode) => {
                    self.processes.approvals().set_mode(mode);
                    CommandOutcome::Handled(Some(format!("Approval mode: {}", mode.as_str())))
                }
                None => {
                    CommandOutcome::Handled(Some("Usage: /mode normal|queued|paused".to_string()))
                }
            },

            "/credits" => {
                let balance = self
                    .processes
                    .credits()
                    .balance(participant)
                    .unwrap_or(0.0);
                CommandOutcome::Handled(Some(format!("Credit balance: {balance:.0}")))
            }

            "/history" => {
                let limit: u32 = rest.parse().unwrap_or(10);
                let entries = self
                    .processes
                    .credits()
                    .history(participant, limit.min(20))
                    .unwrap_or_default();
                if entries.is_empty() {
                    return CommandOutcome::Handled(Some("No credit history.".to_string()));
                }
                let lines: Vec<String> = entries
                    .iter()
                    .map(|e| format!("{:+.0} {} ({})", e.amount, e.reason, e.created_at))
                    .collect();
                CommandOutcome::Handled(Some(lines.join("\n")))
            }

            "/work" => {
                if rest.is_empty() {
                    return CommandOutcome::Handled(Some("Usage: /work <description>".to_string()));
                }
                let cap = *self.work_task_cap.lock().unwrap();
                let since = (chrono::Utc::now() - chrono::Duration::days(1)).to_rfc3339();
                let today = self.store.count_work_tasks_since(&since).unwrap_or(0);
                if today >= cap {
                    return CommandOutcome::Handled(Some(format!(
                        "Daily work-task limit reached ({cap}). Try again tomorrow."
                    )));
                }
                let id = Uuid::new_v4().to_string();
                let branch = format!("work/{}", &id[..8]);
                let task = WorkTaskRow {
                    id: id.clone(),
                    agent_id: self.pick_agent(None),
                    description: rest.to_string(),
                    branch: branch.clone(),
                    status: "created".to_string(),
                    created_at: String::new(),
                };
                match self.store.create_work_task(&task) {
                    Ok(()) => CommandOutcome::Handled(Some(format!(
                        "Work task created on branch {branch}"
                    ))),
                    Err(e) => CommandOutcome::Handled(Some(format!("Work task failed: {e}"))),
                }
            }

            "/council" => self.command_council(participant, rest).await,

            _ => CommandOutcome::Unhandled,
        }
    }

    /// `/council [Name -- ] <prompt>`: launch a named council, or auto-create
    /// one from every algochat-enabled agent (first member chairs).
    async fn command_council(&self, participant: &str, rest: &str) -> CommandOutcome {
        let Some(engine) = self.councils.lock().unwrap().clone() else {
            return CommandOutcome::Handled(Some("Councils are not available.".to_string()));
        };
        if rest.is_empty() {
            return CommandOutcome::Handled(Some(
                "Usage: /council [CouncilName -- ] <prompt>".to_string(),
            ));
        }

        let (council_name, prompt) = match rest.split_once("--") {
            Some((name, prompt)) if !prompt.trim().is_empty() => {
                (Some(name.trim().to_string()), prompt.trim().to_string())
            }
            _ => (None, rest.to_string()),
        };

        let council = match council_name {
            Some(name) => match self.store.find_council_by_name(&name) {
                Ok(Some(council)) => council,
                Ok(None) => {
                    return CommandOutcome::Handled(Some(format!("No council named {name:?}")))
                }
                Err(e) => return CommandOutcome::Handled(Some(format!("Council lookup: {e}"))),
            },
            None => {
                // Ad-hoc council of every algochat-enabled agent.
                let agents = self.store.list_algochat_agents().unwrap_or_default();
                if agents.is_empty() {
                    return CommandOutcome::Handled(Some(
                        "No algochat-enabled agents to form a council.".to_string(),
                    ));
                }
                let council = CouncilRow {
                    id: Uuid::new_v4().to_string(),
                    name: format!("adhoc-{}", &Uuid::new_v4().to_string()[..8]),
                    description: "auto-created from the chat channel".to_string(),
                    member_agent_ids: agents.iter().map(|a| a.id.clone()).collect(),
                    chairman_agent_id: agents.first().map(|a| a.id.clone()),
                    discussion_rounds: 0,
                    created_at: String::new(),
                };
                if let Err(e) = self.store.create_council(&council) {
                    return CommandOutcome::Handled(Some(format!("Council create failed: {e}")));
                }
                council
            }
        };

        let mut events = engine.subscribe();
        let started = match engine.launch(&council.id, None, &prompt).await {
            Ok(started) => started,
            Err(e) => return CommandOutcome::Handled(Some(format!("Council launch failed: {e}"))),
        };
        info!(launch_id = %started.launch_id, participant, "council launched from chat");

        // Stream stage notices back to the participant; deliver the synthesis
        // at completion.
        let bridge = self.arc();
        let launch_id = started.launch_id.clone();
        let store = Arc::clone(&self.store);
        let participant = participant.to_string();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                };
                let CouncilEvent::StageChange { launch_id: lid, stage, .. } = event else {
                    continue;
                };
                if lid != launch_id {
                    continue;
                }
                match stage {
                    CouncilStage::Complete => {
                        let synthesis = store
                            .get_launch(&launch_id)
                            .ok()
                            .and_then(|l| l.synthesis)
                            .unwrap_or_else(|| "(no synthesis)".to_string());
                        let reply = clip_chars(&synthesis, SYNTHESIS_REPLY_CHARS);
                        bridge
                            .send_response(&participant, &format!("Council synthesis:\n{reply}"), None, 0)
                            .await;
                        break;
                    }
                    CouncilStage::Failed => {
                        bridge
                            .send_response(&participant, "Council failed.", None, 0)
                            .await;
                        break;
                    }
                    stage => {
                        bridge
                            .send_response(
                                &participant,
                                &format!("Council stage: {}", stage.as_str()),
                                None,
                                0,
                            )
                            .await;
                    }
                }
            }
        });

        CommandOutcome::Handled(Some(format!(
            "Council \"{}\" launched with {} members.",
            council.name,
            started.session_ids.len(),
        )))
    }
}

fn clip_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let clipped: String = text.chars().take(limit).collect();
    format!("{clipped}\n[truncated]")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_marks_truncation() {
        let long = "x".repeat(3500);
        let out = clip_chars(&long, 3000);
        assert!(out.ends_with("[truncated]"));
        assert!(out.chars().count() <= 3000 + "\n[truncated]".chars().count());
        assert_eq!(clip_chars("short", 3000), "short");
    }
}
