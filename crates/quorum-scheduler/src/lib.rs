// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Cron/interval scheduler.
//!
//! One task ticks every second.  Each due schedule is claimed by moving its
//! `next_run_at` forward with a compare-and-set, so overlapping ticks (or a
//! second server sharing the database) cannot double-fire.  Claimed
//! schedules run their actions in order in a spawned task; every action
//! leaves an execution row behind.
//!
//! Missed windows are not back-filled: recovery at startup advances stale
//! schedules to their next future slot.

mod actions;
mod cadence;

pub use actions::star_repos_prompt;
pub use cadence::{next_cron_after, next_interval_after, validate_cadence, CadenceError};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quorum_core::notify::{AskOwnerRequest, AskOwnerResult, NotificationBus};
use quorum_core::process::{ProcessManager, StartOptions};
use quorum_council::CouncilEngine;
use quorum_db::schedules::ActionConfig;
use quorum_db::{ApprovalPolicy, CouncilStage, ScheduleRow, SessionSource, Store};

const TICK: Duration = Duration::from_secs(1);
/// Sessions launched by `star_repos` actions get a short leash.
const STAR_REPOS_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// `custom` actions may run longer.
const CUSTOM_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// How long a gating council may deliberate before the action is skipped.
const COUNCIL_GATE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    ScheduleUpdate { schedule_id: String },
    ExecutionRecorded { schedule_id: String, action_type: String, outcome: String },
    ApprovalRequested { schedule_id: String },
}

pub struct Scheduler {
    store: Arc<Store>,
    processes: Arc<ProcessManager>,
    councils: Arc<CouncilEngine>,
    notifications: Arc<NotificationBus>,
    events_tx: broadcast::Sender<SchedulerEvent>,
    self_ref: std::sync::Weak<Self>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        processes: Arc<ProcessManager>,
        councils: Arc<CouncilEngine>,
        notifications: Arc<NotificationBus>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new_cyclic(|me| Self {
            store,
            processes,
            councils,
            notifications,
            events_tx,
            self_ref: me.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("scheduler alive")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Advance stale schedules to their next future slot without firing.
    pub fn recover(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        for schedule in self.store.all_active_schedules()? {
            let stale = match &schedule.next_run_at {
                None => true,
                Some(next) => DateTime::parse_from_rfc3339(next)
                    .map(|t| t.with_timezone(&Utc) <= now)
                    .unwrap_or(true),
            };
            if stale {
                let next = self.compute_next(&schedule, now);
                info!(schedule_id = %schedule.id, ?next, "advancing missed schedule");
                self.store
                    .set_schedule_next_run(&schedule.id, next.as_deref())?;
            }
        }
        Ok(())
    }

    /// Run the tick loop until the task is aborted.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.arc();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                scheduler.tick().await;
            }
        })
    }

    /// One evaluation pass: claim and fire everything due.
    pub async fn tick(&self) {
        let now = Utc::now();
        let due = match self.store.due_schedules(&now.to_rfc3339()) {
            Ok(due) => due,
            Err(e) => {
                warn!("schedule query failed: {e}");
                return;
            }
        };
        for schedule in due {
            if let Err(e) = validate_cadence(&schedule) {
                warn!(schedule_id = %schedule.id, "invalid cadence, skipping: {e}");
                continue;
            }
            let Some(expected) = schedule.next_run_at.clone() else {
                continue;
            };
            let new_next = self.compute_next(&schedule, now);
            match self
                .store
                .claim_schedule(&schedule.id, &expected, new_next.as_deref())
            {
                Ok(true) => {
                    self.emit(SchedulerEvent::ScheduleUpdate {
                        schedule_id: schedule.id.clone(),
                    });
                    let scheduler = self.arc();
                    tokio::spawn(async move {
                        scheduler.run_schedule(schedule).await;
                    });
                }
                Ok(false) => debug!(schedule_id = %schedule.id, "lost the claim race"),
                Err(e) => warn!(schedule_id = %schedule.id, "claim failed: {e}"),
            }
        }
    }

    fn compute_next(&self, schedule: &ScheduleRow, after: DateTime<Utc>) -> Option<String> {
        match (&schedule.cron_expression, schedule.interval_ms) {
            (Some(expr), _) => next_cron_after(expr, after).map(|t| t.to_rfc3339()),
            (None, Some(ms)) => Some(next_interval_after(ms, after).to_rfc3339()),
            (None, None) => None,
        }
    }

    async fn run_schedule(self: Arc<Self>, schedule: ScheduleRow) {
        info!(schedule_id = %schedule.id, name = %schedule.name, "schedule firing");
        if !self.approved(&schedule).await {
            self.record(&schedule, "schedule", None, "not approved");
            return;
        }
        for action in &schedule.actions {
            let outcome = self.run_action(&schedule, action).await;
            match outcome {
                Ok((session_id, outcome)) => {
                    self.record(&schedule, &action.action_type, session_id.as_deref(), &outcome)
                }
                Err(e) => {
                    warn!(schedule_id = %schedule.id, action = %action.action_type, "action failed: {e}");
                    self.record(&schedule, &action.action_type, None, &format!("error: {e}"));
                }
            }
        }
    }

    async fn approved(&self, schedule: &ScheduleRow) -> bool {
        match schedule.approval_policy {
            ApprovalPolicy::Auto => true,
            ApprovalPolicy::OwnerApprove => {
                self.emit(SchedulerEvent::ApprovalRequested {
                    schedule_id: schedule.id.clone(),
                });
                let result = self
                    .notifications
                    .ask_owner(AskOwnerRequest {
                        agent_id: schedule
                            .agent_id
                            .clone()
                            .unwrap_or_else(|| "scheduler".to_string()),
                        session_id: None,
                        question: format!("Run schedule \"{}\" now?", schedule.name),
                        options: vec!["yes".to_string(), "no".to_string()],
                        context: Some(schedule.description.clone()),
                        timeout_minutes: 10,
                    })
                    .await;
                matches!(
                    result,
                    AskOwnerResult::Answer { ref text, .. }
                        if text.eq_ignore_ascii_case("yes") || text.eq_ignore_ascii_case("y")
                )
            }
            ApprovalPolicy::CouncilApprove => self.council_approved(schedule).await,
        }
    }

    /// Gate on a council deliberation: the action runs iff the launch
    /// reaches `complete` within the window.
    async fn council_approved(&self, schedule: &ScheduleRow) -> bool {
        let council_id = schedule
            .actions
            .iter()
            .find_map(|a| a.config.get("council_id").and_then(|v| v.as_str()))
            .map(str::to_string);
        let Some(council_id) = council_id else {
            warn!(schedule_id = %schedule.id, "council_approve without council_id");
            return false;
        };
        let prompt = format!(
            "The schedule \"{}\" is about to run. Deliberate on whether it should.\n\n{}",
            schedule.name, schedule.description,
        );
        let launch = match self.councils.launch(&council_id, None, &prompt).await {
            Ok(l) => l,
            Err(e) => {
                warn!(schedule_id = %schedule.id, "gating council launch failed: {e}");
                return false;
            }
        };
        let deadline = tokio::time::Instant::now() + COUNCIL_GATE_TIMEOUT;
        loop {
            if tokio::time::Instant::now() >= deadline {
                warn!(schedule_id = %schedule.id, "gating council timed out");
                return false;
            }
            match self.store.get_launch(&launch.launch_id) {
                Ok(l) if l.stage == CouncilStage::Complete => return true,
                Ok(l) if l.stage == CouncilStage::Failed => return false,
                Ok(_) => tokio::time::sleep(Duration::from_secs(2)).await,
                Err(_) => return false,
            }
        }
    }

    /// Execute one action; returns (session id, outcome label).
    async fn run_action(
        &self,
        schedule: &ScheduleRow,
        action: &ActionConfig,
    ) -> anyhow::Result<(Option<String>, String)> {
        match action.action_type.as_str() {
            "star_repos" => {
                let prompt = star_repos_prompt(action);
                let sid = self
                    .spawn_action_session(schedule, &prompt, STAR_REPOS_TIMEOUT)
                    .await?;
                Ok((Some(sid), "session started".to_string()))
            }
            "custom" => {
                let prompt = action
                    .prompt
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("custom action without prompt"))?;
                let sid = self
                    .spawn_action_session(schedule, &prompt, CUSTOM_TIMEOUT)
                    .await?;
                Ok((Some(sid), "session started".to_string()))
            }
            // Declared but delegated elsewhere; the execution row documents
            // that the tick saw them.
            "review_prs" | "work_task" | "council_launch" | "send_message"
            | "github_suggest" => Ok((None, "delegated".to_string())),
            other => Ok((None, format!("unknown action type {other}; skipped"))),
        }
    }

    async fn spawn_action_session(
        &self,
        schedule: &ScheduleRow,
        prompt: &str,
        timeout: Duration,
    ) -> anyhow::Result<String> {
        let agent_id = schedule
            .agent_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("schedule has no agent"))?;
        let session_id = Uuid::new_v4().to_string();
        let session = self.store.create_session(quorum_db::sessions::NewSession {
            id: session_id.clone(),
            agent_id,
            name: format!("schedule {}", schedule.name),
            source: Some(SessionSource::Agent),
            initial_prompt: prompt.to_string(),
            ..Default::default()
        })?;
        self.processes
            .start_process(
                &session,
                prompt,
                StartOptions {
                    scheduler_mode: true,
                    timeout: Some(timeout),
                    ..StartOptions::default()
                },
            )
            .await?;
        Ok(session_id)
    }

    fn record(
        &self,
        schedule: &ScheduleRow,
        action_type: &str,
        session_id: Option<&str>,
        outcome: &str,
    ) {
        let id = Uuid::new_v4().to_string();
        if let Err(e) = self.store.record_schedule_execution(
            &id,
            &schedule.id,
            action_type,
            session_id,
            outcome,
        ) {
            warn!(schedule_id = %schedule.id, "execution record failed: {e}");
        }
        self.emit(SchedulerEvent::ExecutionRecorded {
            schedule_id: schedule.id.clone(),
            action_type: action_type.to_string(),
            outcome: outcome.to_string(),
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_config::CreditConfig;
    use quorum_core::approvals::ApprovalManager;
    use quorum_core::credits::CreditService;
    use quorum_core::mock::MockLauncher;
    use quorum_core::process::ChildLauncher;
    use quorum_db::schedules::ActionConfig;
    use quorum_db::ScheduleStatus;

    struct Fixture {
        store: Arc<Store>,
        launcher: Arc<MockLauncher>,
        scheduler: Arc<Scheduler>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let launcher = Arc::new(MockLauncher::new());
        let processes = ProcessManager::new(
            Arc::clone(&store),
            Arc::clone(&launcher) as Arc<dyn ChildLauncher>,
            Arc::new(ApprovalManager::new()),
            Arc::new(CreditService::new(
                Arc::clone(&store),
                CreditConfig::default(),
            )),
            Duration::from_secs(3600),
        );
        let councils = CouncilEngine::new(Arc::clone(&store), Arc::clone(&processes));
        let notifications = NotificationBus::new(Arc::clone(&store), Vec::new());
        let scheduler = Scheduler::new(store.clone(), processes, councils, notifications);
        Fixture {
            store,
            launcher,
            scheduler,
        }
    }

    fn due_schedule(store: &Store, id: &str) -> ScheduleRow {
        let row = ScheduleRow {
            id: id.to_string(),
            agent_id: Some("agent-1".to_string()),
            name: "every-minute".to_string(),
            description: String::new(),
            status: ScheduleStatus::Active,
            cron_expression: None,
            interval_ms: Some(60_000),
            actions: vec![ActionConfig {
                action_type: "custom".to_string(),
                prompt: Some("do the nightly chores".to_string()),
                config: serde_json::json!({}),
            }],
            approval_policy: ApprovalPolicy::Auto,
            next_run_at: Some((Utc::now() - chrono::Duration::seconds(5)).to_rfc3339()),
            execution_count: 0,
            created_at: String::new(),
        };
        store.create_schedule(&row).unwrap();
        row
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn due_schedule_fires_and_spawns_session() {
        let f = fixture();
        due_schedule(&f.store, "s1");
        f.scheduler.tick().await;

        wait_until(|| {
            f.store
                .list_sessions()
                .map(|s| !s.is_empty())
                .unwrap_or(false)
        })
        .await;

        let sessions = f.store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].source, SessionSource::Agent);
        // The child got the prompt.
        let child = f.launcher.handle(&sessions[0].id);
        let line = child.next_stdin().await.unwrap();
        assert!(line.contains("nightly chores"));
        // Claimed exactly once.
        assert_eq!(f.store.get_schedule("s1").unwrap().execution_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_tick_does_not_double_fire() {
        let f = fixture();
        due_schedule(&f.store, "s1");
        f.scheduler.tick().await;
        f.scheduler.tick().await;
        wait_until(|| f.store.get_schedule("s1").unwrap().execution_count >= 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.store.get_schedule("s1").unwrap().execution_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn next_run_moves_into_the_future() {
        let f = fixture();
        due_schedule(&f.store, "s1");
        f.scheduler.tick().await;
        let next = f.store.get_schedule("s1").unwrap().next_run_at.unwrap();
        let next = DateTime::parse_from_rfc3339(&next).unwrap().with_timezone(&Utc);
        assert!(next > Utc::now());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_advances_without_firing() {
        let f = fixture();
        due_schedule(&f.store, "s1");
        f.scheduler.recover().unwrap();
        let sched = f.store.get_schedule("s1").unwrap();
        let next = DateTime::parse_from_rfc3339(&sched.next_run_at.unwrap())
            .unwrap()
            .with_timezone(&Utc);
        assert!(next > Utc::now());
        assert_eq!(sched.execution_count, 0, "recovery must not execute");
        assert!(f.store.list_sessions().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn execution_row_is_recorded() {
        let f = fixture();
        due_schedule(&f.store, "s1");
        let mut events = f.scheduler.subscribe();
        f.scheduler.tick().await;

        loop {
            match events.recv().await.unwrap() {
                SchedulerEvent::ExecutionRecorded {
                    schedule_id,
                    action_type,
                    outcome,
                } => {
                    assert_eq!(schedule_id, "s1");
                    assert_eq!(action_type, "custom");
                    assert!(outcome.contains("session started"));
                    break;
                }
                _ => continue,
            }
        }
    }
}
