// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use quorum_core::process::{ProcessManager, StartOptions};
use quorum_core::ProcessEvent;
use quorum_db::sessions::NewSession;
use quorum_db::{CouncilLaunchRow, CouncilRole, CouncilStage, SessionSource, Store};

use crate::aggregate::{aggregate_with_separators, latest_responses, AgentResponse};
use crate::prompts;

/// Placeholder synthesis when the chairman session produced no text.
const NO_SYNTHESIS: &str = "(no synthesis produced)";

/// Public events, broadcast once per true transition.
#[derive(Debug, Clone)]
pub enum CouncilEvent {
    StageChange {
        launch_id: String,
        stage: CouncilStage,
        session_ids: Option<Vec<String>>,
    },
    Log {
        launch_id: String,
        session_id: Option<String>,
        level: &'static str,
        message: String,
        detail: Option<String>,
    },
    DiscussionMessage {
        launch_id: String,
        agent_id: String,
        agent_name: String,
        round: u32,
        content: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CouncilError {
    #[error("council not found")]
    CouncilNotFound,
    #[error("council launch not found")]
    LaunchNotFound,
    #[error("chairman must be a member of the council")]
    ChairmanNotMember,
    #[error("Cannot start discussion from stage {0}")]
    DiscussionStage(String),
    #[error("no discussion rounds remaining")]
    RoundsExhausted,
    #[error("Cannot start review from stage {0}")]
    ReviewStage(String),
    #[error("Cannot synthesize from stage {0}")]
    SynthesisStage(String),
    #[error("no chairman configured for this council")]
    NoChairman,
    #[error(transparent)]
    Db(#[from] quorum_db::DbError),
}

impl CouncilError {
    /// HTTP-ish status for the `{ok:false, status, error}` result shape.
    pub fn status(&self) -> u16 {
        match self {
            Self::CouncilNotFound | Self::LaunchNotFound => 404,
            Self::Db(quorum_db::DbError::NotFound(_)) => 404,
            Self::Db(_) => 500,
            _ => 400,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchStarted {
    pub launch_id: String,
    pub session_ids: Vec<String>,
}

/// Which watched session set just drained, and what follows.
enum WatchRole {
    Members,
    Discussion { round: u32 },
    Reviewers,
}

pub struct CouncilEngine {
    store: Arc<Store>,
    processes: Arc<ProcessManager>,
    events_tx: broadcast::Sender<CouncilEvent>,
    self_ref: std::sync::Weak<Self>,
}

impl CouncilEngine {
    pub fn new(store: Arc<Store>, processes: Arc<ProcessManager>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new_cyclic(|me| Self {
            store,
            processes,
            events_tx,
            self_ref: me.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("council engine alive")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CouncilEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: CouncilEvent) {
        let _ = self.events_tx.send(event);
    }

    fn log(&self, launch_id: &str, session_id: Option<&str>, level: &'static str, message: String) {
        self.emit(CouncilEvent::Log {
            launch_id: launch_id.to_string(),
            session_id: session_id.map(str::to_string),
            level,
            message,
            detail: None,
        });
    }

    fn set_stage(&self, launch_id: &str, stage: CouncilStage, session_ids: Option<Vec<String>>) {
        if let Err(e) = self.store.set_launch_stage(launch_id, stage) {
            error!(launch_id, "stage update failed: {e}");
            return;
        }
        self.emit(CouncilEvent::StageChange {
            launch_id: launch_id.to_string(),
            stage,
            session_ids,
        });
    }

    // ── Triggers ──────────────────────────────────────────────────────────────

    /// Create a launch, spawn one member session per member with the shared
    /// prompt, and move to `responding`.
    pub async fn launch(
        &self,
        council_id: &str,
        project_id: Option<&str>,
        prompt: &str,
    ) -> Result<LaunchStarted, CouncilError> {
        let council = self
            .store
            .get_council(council_id)
            .map_err(|_| CouncilError::CouncilNotFound)?;
        if let Some(chairman) = &council.chairman_agent_id {
            if !council.member_agent_ids.contains(chairman) {
                return Err(CouncilError::ChairmanNotMember);
            }
        }

        let launch_id = Uuid::new_v4().to_string();
        let launch = self
            .store
            .create_launch(&launch_id, &council, project_id, prompt)?;
        info!(launch_id, council = %council.name, "council launched");

        let mut session_ids = Vec::new();
        for agent_id in &launch.member_agent_ids {
            if let Some(sid) = self
                .spawn_stage_session(&launch, agent_id, CouncilRole::Member, prompt)
                .await
            {
                session_ids.push(sid);
            }
        }

        self.set_stage(&launch_id, CouncilStage::Responding, Some(session_ids.clone()));
        self.watch(&launch_id, session_ids.clone(), WatchRole::Members);

        Ok(LaunchStarted {
            launch_id,
            session_ids,
        })
    }

    /// Start the next discussion round from `responding` or `discussing`.
    pub async fn trigger_discussion(
        &self,
        launch_id: &str,
    ) -> Result<Vec<String>, CouncilError> {
        let launch = self
            .store
            .get_launch(launch_id)
            .map_err(|_| CouncilError::LaunchNotFound)?;
        if !matches!(
            launch.stage,
            CouncilStage::Responding | CouncilStage::Discussing
        ) {
            return Err(CouncilError::DiscussionStage(
                launch.stage.as_str().to_string(),
            ));
        }
        let rounds_done = self.recorded_rounds(launch_id)?;
        let round = rounds_done + 1;
        if round > launch.discussion_rounds {
            return Err(CouncilError::RoundsExhausted);
        }

        let sessions = self.store.sessions_for_launch(launch_id)?;
        let responses = latest_responses(&self.store, &sessions)?;
        let prompt = prompts::discussion_prompt(&launch.prompt, round, &responses);

        let mut session_ids = Vec::new();
        for agent_id in &launch.member_agent_ids {
            if let Some(sid) = self
                .spawn_stage_session(&launch, agent_id, CouncilRole::Member, &prompt)
                .await
            {
                session_ids.push(sid);
            }
        }
        self.log(
            launch_id,
            None,
            "info",
            format!("discussion round {round} started with {} sessions", session_ids.len()),
        );
        self.set_stage(launch_id, CouncilStage::Discussing, Some(session_ids.clone()));
        self.watch(launch_id, session_ids.clone(), WatchRole::Discussion { round });
        Ok(session_ids)
    }

    /// Start the review stage: each member reviews everyone else's latest
    /// response (never its own).
    pub async fn trigger_review(
        &self,
        launch_id: &str,
    ) -> Result<Vec<String>, CouncilError> {
        let launch = self
            .store
            .get_launch(launch_id)
            .map_err(|_| CouncilError::LaunchNotFound)?;
        if !matches!(
            launch.stage,
            CouncilStage::Responding | CouncilStage::Discussing
        ) {
            return Err(CouncilError::ReviewStage(launch.stage.as_str().to_string()));
        }

        let sessions = self.store.sessions_for_launch(launch_id)?;
        let responses = latest_responses(&self.store, &sessions)?;

        let mut session_ids = Vec::new();
        for agent_id in &launch.member_agent_ids {
            let prompt = prompts::review_prompt(&launch.prompt, agent_id, &responses);
            if let Some(sid) = self
                .spawn_stage_session(&launch, agent_id, CouncilRole::Reviewer, &prompt)
                .await
            {
                session_ids.push(sid);
            }
        }
        self.set_stage(launch_id, CouncilStage::Reviewing, Some(session_ids.clone()));
        self.watch(launch_id, session_ids.clone(), WatchRole::Reviewers);
        Ok(session_ids)
    }

    /// Start the chairman synthesis session from `reviewing`.
    pub async fn trigger_synthesis(
        &self,
        launch_id: &str,
        format_discussion: bool,
        chairman_override: Option<&str>,
    ) -> Result<String, CouncilError> {
        let launch = self
            .store
            .get_launch(launch_id)
            .map_err(|_| CouncilError::LaunchNotFound)?;
        if launch.stage != CouncilStage::Reviewing {
            return Err(CouncilError::SynthesisStage(
                launch.stage.as_str().to_string(),
            ));
        }
        let chairman = chairman_override
            .map(str::to_string)
            .or_else(|| launch.chairman_agent_id.clone())
            .ok_or(CouncilError::NoChairman)?;

        let sessions = self.store.sessions_for_launch(launch_id)?;
        let responses = latest_responses(&self.store, &sessions)?;
        let discussion = if format_discussion {
            Some(self.store.discussion_messages(launch_id)?)
        } else {
            None
        };
        let prompt = prompts::synthesis_prompt(&launch.prompt, &responses, discussion.as_deref());

        let session_id = self
            .spawn_stage_session(&launch, &chairman, CouncilRole::Chairman, &prompt)
            .await
            .ok_or_else(|| {
                // Chairman spawn failure means no synthesis can happen;
                // fall to the aggregated path via the caller.
                CouncilError::NoChairman
            })?;

        self.set_stage(
            launch_id,
            CouncilStage::Synthesizing,
            Some(vec![session_id.clone()]),
        );
        self.watch_chairman(launch_id, &session_id);
        Ok(session_id)
    }

    /// Terminal fallback: concatenate per-agent latest responses and complete.
    pub fn finish_with_aggregated_synthesis(&self, launch_id: &str) -> Result<(), CouncilError> {
        let launch = self
            .store
            .get_launch(launch_id)
            .map_err(|_| CouncilError::LaunchNotFound)?;
        if launch.stage.is_terminal() {
            return Ok(());
        }
        let sessions = self.store.sessions_for_launch(launch_id)?;
        let responses = latest_responses(&self.store, &sessions)?;
        let synthesis = aggregate_with_separators(&responses);
        self.store.complete_launch(launch_id, &synthesis)?;
        self.emit(CouncilEvent::StageChange {
            launch_id: launch_id.to_string(),
            stage: CouncilStage::Complete,
            session_ids: None,
        });
        self.log(launch_id, None, "info", "completed with aggregated synthesis".into());
        Ok(())
    }

    pub fn fail(&self, launch_id: &str, error: &str) {
        if let Err(e) = self.store.fail_launch(launch_id, error) {
            warn!(launch_id, "fail_launch: {e}");
            return;
        }
        self.emit(CouncilEvent::StageChange {
            launch_id: launch_id.to_string(),
            stage: CouncilStage::Failed,
            session_ids: None,
        });
        self.log(launch_id, None, "error", error.to_string());
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn recorded_rounds(&self, launch_id: &str) -> Result<u32, quorum_db::DbError> {
        Ok(self
            .store
            .discussion_messages(launch_id)?
            .iter()
            .map(|m| m.round)
            .max()
            .unwrap_or(0))
    }

    /// Create and start one session for a stage.  A failure is logged and
    /// the stage proceeds without the session.
    async fn spawn_stage_session(
        &self,
        launch: &CouncilLaunchRow,
        agent_id: &str,
        role: CouncilRole,
        prompt: &str,
    ) -> Option<String> {
        let session_id = Uuid::new_v4().to_string();
        let work_dir = launch
            .project_id
            .as_deref()
            .and_then(|pid| self.store.get_project(pid).ok())
            .map(|p| p.path);
        let session = match self.store.create_session(NewSession {
            id: session_id.clone(),
            project_id: launch.project_id.clone(),
            agent_id: agent_id.to_string(),
            name: format!("council {} {}", role.as_str(), agent_id),
            source: Some(SessionSource::Agent),
            initial_prompt: prompt.to_string(),
            council_launch_id: Some(launch.id.clone()),
            council_role: Some(role),
            work_dir,
        }) {
            Ok(s) => s,
            Err(e) => {
                self.log(
                    &launch.id,
                    None,
                    "error",
                    format!("session create failed for agent {agent_id}: {e}"),
                );
                return None;
            }
        };
        if let Err(e) = self
            .processes
            .start_process(&session, prompt, StartOptions::default())
            .await
        {
            self.log(
                &launch.id,
                Some(&session_id),
                "error",
                format!("spawn failed for agent {agent_id}: {e}"),
            );
            return None;
        }
        Some(session_id)
    }

    /// Watch a session set; when every member has exited, advance the stage.
    /// An empty set advances immediately.
    fn watch(&self, launch_id: &str, session_ids: Vec<String>, role: WatchRole) {
        let engine = self.arc();
        let launch_id = launch_id.to_string();
        tokio::spawn(async move {
            let mut remaining: HashSet<String> = session_ids.iter().cloned().collect();
            if !remaining.is_empty() {
                let mut sub = engine.processes.subscribe_all();
                let token = sub.token;
                // Subscribe first, then prune sessions that already exited;
                // anything exiting after this point reaches the subscription.
                remaining.retain(|sid| {
                    engine.processes.is_running(sid)
                        || matches!(
                            engine.store.get_session(sid).map(|s| s.status),
                            Ok(quorum_db::SessionStatus::Created)
                                | Ok(quorum_db::SessionStatus::Running)
                        )
                });
                while !remaining.is_empty() {
                    let Some(ev) = sub.rx.recv().await else { break };
                    if matches!(*ev.event, ProcessEvent::SessionExited { .. }) {
                        remaining.remove(&ev.session_id);
                    }
                }
                engine.processes.unsubscribe_all(token);
            }
            engine.advance(&launch_id, session_ids, role).await;
        });
    }

    async fn advance(&self, launch_id: &str, session_ids: Vec<String>, role: WatchRole) {
        match role {
            WatchRole::Members => {
                let Ok(launch) = self.store.get_launch(launch_id) else {
                    return;
                };
                if launch.stage.is_terminal() {
                    return;
                }
                let next = if launch.discussion_rounds > 0 {
                    self.trigger_discussion(launch_id).await.map(|_| ())
                } else {
                    self.trigger_review(launch_id).await.map(|_| ())
                };
                if let Err(e) = next {
                    self.fail(launch_id, &format!("auto-advance failed: {e}"));
                }
            }
            WatchRole::Discussion { round } => {
                self.record_discussion_round(launch_id, &session_ids, round);
                let Ok(launch) = self.store.get_launch(launch_id) else {
                    return;
                };
                if launch.stage.is_terminal() {
                    return;
                }
                let next = if round < launch.discussion_rounds {
                    self.trigger_discussion(launch_id).await.map(|_| ())
                } else {
                    self.trigger_review(launch_id).await.map(|_| ())
                };
                if let Err(e) = next {
                    self.fail(launch_id, &format!("auto-advance failed: {e}"));
                }
            }
            WatchRole::Reviewers => {
                match self.trigger_synthesis(launch_id, true, None).await {
                    Ok(_) => {}
                    Err(CouncilError::NoChairman) => {
                        if let Err(e) = self.finish_with_aggregated_synthesis(launch_id) {
                            self.fail(launch_id, &format!("aggregated finish failed: {e}"));
                        }
                    }
                    Err(e) => {
                        self.log(
                            launch_id,
                            None,
                            "error",
                            format!("synthesis trigger failed: {e}"),
                        );
                        if let Err(e) = self.finish_with_aggregated_synthesis(launch_id) {
                            self.fail(launch_id, &format!("aggregated finish failed: {e}"));
                        }
                    }
                }
            }
        }
    }

    /// Persist each round session's output as that agent's discussion message.
    fn record_discussion_round(&self, launch_id: &str, session_ids: &[String], round: u32) {
        for sid in session_ids {
            let Ok(session) = self.store.get_session(sid) else {
                continue;
            };
            let Ok(Some(content)) = self.store.last_assistant_message(sid) else {
                continue;
            };
            let agent_name = self
                .store
                .get_agent(&session.agent_id)
                .map(|a| a.name)
                .unwrap_or_else(|_| session.agent_id.clone());
            if let Err(e) = self.store.add_discussion_message(
                launch_id,
                &session.agent_id,
                &agent_name,
                round,
                &content,
            ) {
                warn!(launch_id, "discussion message write failed: {e}");
                continue;
            }
            self.emit(CouncilEvent::DiscussionMessage {
                launch_id: launch_id.to_string(),
                agent_id: session.agent_id.clone(),
                agent_name,
                round,
                content,
            });
        }
    }

    /// Adopt the chairman's last assistant text as the synthesis when its
    /// session exits.
    fn watch_chairman(&self, launch_id: &str, session_id: &str) {
        let engine = self.arc();
        let launch_id = launch_id.to_string();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let mut sub = engine.processes.subscribe(&session_id);
            let token = sub.token;
            let already_done = !engine.processes.is_running(&session_id)
                && !matches!(
                    engine.store.get_session(&session_id).map(|s| s.status),
                    Ok(quorum_db::SessionStatus::Created)
                        | Ok(quorum_db::SessionStatus::Running)
                );
            if !already_done {
                loop {
                    let Some(ev) = sub.rx.recv().await else { break };
                    if matches!(*ev.event, ProcessEvent::SessionExited { .. }) {
                        break;
                    }
                }
            }
            engine.processes.unsubscribe(&session_id, token);

            let synthesis = engine
                .store
                .last_assistant_message(&session_id)
                .ok()
                .flatten()
                .unwrap_or_else(|| NO_SYNTHESIS.to_string());
            match engine.store.complete_launch(&launch_id, &synthesis) {
                Ok(()) => {
                    engine.emit(CouncilEvent::StageChange {
                        launch_id: launch_id.clone(),
                        stage: CouncilStage::Complete,
                        session_ids: None,
                    });
                    info!(launch_id, "synthesis complete");
                }
                Err(e) => engine.fail(&launch_id, &format!("synthesis write failed: {e}")),
            }
        });
    }
}
