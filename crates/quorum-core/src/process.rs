// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Process manager — owns the population of agent sub-processes.
//!
//! # Design
//!
//! ```text
//!   start_process(session, prompt)
//!       │ launcher.spawn() → SpawnedChild {stdin_tx, events_rx, exit_rx, kill_tx}
//!       ▼
//!   reader task (one per session)
//!       │ parses NDJSON lines into ProcessEvent
//!       │ re-arms the inactivity deadline on activity events
//!       │ intercepts approval_request / result
//!       ▼
//!   subscriber registry — one unbounded mpsc per subscriber, keyed by an
//!   opaque token.  Dispatch snapshots the sender list before sending, so a
//!   consumer may unsubscribe from within its own callback task without
//!   deadlocking the registry.
//! ```
//!
//! Timeout semantics: every session carries a deadline that is re-armed by
//! each activity event.  On expiry the manager emits a synthetic
//! `session_exited`, kills the child, and marks the session `error`.
//! `extend_timeout` pushes the deadline forward while the session runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use quorum_db::{SessionRow, SessionStatus, Store};

use crate::approvals::{ApprovalDecision, ApprovalManager};
use crate::credits::CreditService;
use crate::events::ProcessEvent;

/// Grace period between SIGTERM and SIGKILL at shutdown.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Predicate deciding whether an external address has owner privileges.
pub type OwnerCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Per-start options.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// External address that caused this session (None for local ingress).
    /// Non-owner origins are charged credits per completed turn.
    pub origin_address: Option<String>,
    /// Restrict the child's tool palette to side-effect-free tools.
    pub scheduler_mode: bool,
    /// Restart a previously stopped session, replaying context.
    pub resume: bool,
    /// Inactivity timeout override.
    pub timeout: Option<Duration>,
}

/// Everything the manager needs to drive one child.
pub struct SpawnedChild {
    pub pid: u32,
    /// Lines sent here reach the child's stdin (newline appended).
    pub stdin_tx: mpsc::Sender<String>,
    /// Newline-delimited JSON events read from the child's stdout.
    pub events_rx: mpsc::Receiver<String>,
    /// Resolves with the exit code when the child terminates.
    pub exit_rx: oneshot::Receiver<Option<i32>>,
    /// Fired once to terminate the child (SIGTERM, then SIGKILL after grace).
    pub kill_tx: oneshot::Sender<()>,
}

/// Launches one agent sub-process for a session.
pub trait ChildLauncher: Send + Sync {
    fn spawn(&self, session: &SessionRow, opts: &StartOptions) -> anyhow::Result<SpawnedChild>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("a process is already running for session {0}")]
    AlreadyRunning(String),
    #[error("spawn failed: {0}")]
    Spawn(#[source] anyhow::Error),
    #[error(transparent)]
    Db(#[from] quorum_db::DbError),
}

/// One event as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub event: Arc<ProcessEvent>,
}

/// Handle returned by `subscribe*`; keep the token for unsubscription.
pub struct Subscription {
    pub token: u64,
    pub rx: mpsc::UnboundedReceiver<SessionEvent>,
}

type Sender = mpsc::UnboundedSender<SessionEvent>;

struct RunningChild {
    pid: u32,
    stdin_tx: mpsc::Sender<String>,
    kill_tx: Option<oneshot::Sender<()>>,
    deadline: Arc<Mutex<Instant>>,
    stop_requested: Arc<AtomicBool>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

pub struct ProcessManager {
    store: Arc<Store>,
    launcher: Arc<dyn ChildLauncher>,
    approvals: Arc<ApprovalManager>,
    credits: Arc<CreditService>,
    children: Mutex<HashMap<String, RunningChild>>,
    session_subs: Mutex<HashMap<String, HashMap<u64, Sender>>>,
    all_subs: Mutex<HashMap<u64, Sender>>,
    next_token: AtomicU64,
    owner_check: Mutex<Option<OwnerCheck>>,
    default_timeout: Duration,
    self_ref: Weak<Self>,
}

impl ProcessManager {
    pub fn new(
        store: Arc<Store>,
        launcher: Arc<dyn ChildLauncher>,
        approvals: Arc<ApprovalManager>,
        credits: Arc<CreditService>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            store,
            launcher,
            approvals,
            credits,
            children: Mutex::new(HashMap::new()),
            session_subs: Mutex::new(HashMap::new()),
            all_subs: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            owner_check: Mutex::new(None),
            default_timeout,
            self_ref: me.clone(),
        })
    }

    /// Owned handle for spawned tasks.  The manager is only reachable
    /// through an `Arc`, so the upgrade cannot fail while a method runs.
    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("manager alive")
    }

    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }

    pub fn credits(&self) -> &Arc<CreditService> {
        &self.credits
    }

    /// Inject the owner predicate.  Owner origins skip all credit effects.
    pub fn set_owner_check(&self, check: OwnerCheck) {
        *self.owner_check.lock().unwrap() = Some(check);
    }

    fn is_owner(&self, address: &str) -> bool {
        self.owner_check
            .lock()
            .unwrap()
            .as_ref()
            .map(|f| f(address))
            .unwrap_or(false)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Launch a new child for `session`.  Rejected when one is already
    /// running for the same id; a spawn failure marks the session `error`
    /// and propagates.
    pub async fn start_process(
        &self,
        session: &SessionRow,
        initial_prompt: &str,
        opts: StartOptions,
    ) -> Result<(), ProcessError> {
        if self.is_running(&session.id) {
            return Err(ProcessError::AlreadyRunning(session.id.clone()));
        }

        let spawned = match self.launcher.spawn(session, &opts) {
            Ok(s) => s,
            Err(e) => {
                self.store
                    .mark_session_ended(&session.id, SessionStatus::Error)?;
                return Err(ProcessError::Spawn(e));
            }
        };

        self.store.mark_session_running(&session.id, spawned.pid)?;
        if !initial_prompt.is_empty() {
            self.store
                .append_session_message(&session.id, "user", initial_prompt, 0.0)?;
            let envelope = json!({"type": "user_message", "text": initial_prompt}).to_string();
            let _ = spawned.stdin_tx.send(envelope).await;
        }

        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let deadline = Arc::new(Mutex::new(Instant::now() + timeout));
        let stop_requested = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(Self::run_reader(
            self.arc(),
            session.id.clone(),
            spawned.events_rx,
            spawned.exit_rx,
            Arc::clone(&deadline),
            timeout,
            opts.origin_address.clone(),
            Arc::clone(&stop_requested),
        ));

        let child = RunningChild {
            pid: spawned.pid,
            stdin_tx: spawned.stdin_tx,
            kill_tx: Some(spawned.kill_tx),
            deadline,
            stop_requested,
            reader: Some(reader),
        };
        self.children
            .lock()
            .unwrap()
            .insert(session.id.clone(), child);

        info!(session_id = %session.id, pid = spawned.pid, "sub-process started");
        Ok(())
    }

    /// Restart a previously stopped session, replaying its context.
    pub async fn resume_process(
        &self,
        session: &SessionRow,
        next_prompt: &str,
    ) -> Result<(), ProcessError> {
        self.start_process(
            session,
            next_prompt,
            StartOptions {
                resume: true,
                ..StartOptions::default()
            },
        )
        .await
    }

    /// Write a user message to the child's stdin iff it is running.
    /// Returns false otherwise — callers decide whether to resume instead.
    pub async fn send_message(&self, session_id: &str, text: &str) -> bool {
        let stdin_tx = {
            let children = self.children.lock().unwrap();
            match children.get(session_id) {
                Some(c) => c.stdin_tx.clone(),
                None => return false,
            }
        };
        let _ = self
            .store
            .append_session_message(session_id, "user", text, 0.0);
        let envelope = json!({"type": "user_message", "text": text}).to_string();
        stdin_tx.send(envelope).await.is_ok()
    }

    /// Cancel the child.  The terminal `session_exited` reaches subscribers
    /// through the reader task once the child is gone.
    pub async fn stop_process(&self, session_id: &str) {
        let (kill_tx, pid) = {
            let mut children = self.children.lock().unwrap();
            match children.get_mut(session_id) {
                Some(c) => {
                    c.stop_requested.store(true, Ordering::SeqCst);
                    (c.kill_tx.take(), c.pid)
                }
                None => (None, 0),
            }
        };
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
            info!(session_id, pid, "stop requested");
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.children.lock().unwrap().contains_key(session_id)
    }

    pub fn active_session_ids(&self) -> Vec<String> {
        self.children.lock().unwrap().keys().cloned().collect()
    }

    /// Push the inactivity deadline forward.  Only succeeds while running.
    pub fn extend_timeout(&self, session_id: &str, additional: Duration) -> bool {
        let children = self.children.lock().unwrap();
        match children.get(session_id) {
            Some(c) => {
                let mut dl = c.deadline.lock().unwrap();
                *dl += additional;
                true
            }
            None => false,
        }
    }

    /// Resolve a pending approval by its short id, on behalf of `sender`.
    pub fn resolve_approval(
        &self,
        short_id: &str,
        decision: ApprovalDecision,
        sender: Option<&str>,
    ) -> Result<(), crate::approvals::ApprovalError> {
        self.approvals.resolve_by_short_id(short_id, decision, sender)
    }

    /// Stop every child and wait (bounded) for their readers to finish.
    pub async fn shutdown(&self) {
        let ids = self.active_session_ids();
        info!(count = ids.len(), "process manager shutting down");
        for id in &ids {
            self.stop_process(id).await;
        }
        let readers: Vec<_> = {
            let mut children = self.children.lock().unwrap();
            children
                .values_mut()
                .filter_map(|c| c.reader.take())
                .collect()
        };
        for reader in readers {
            if tokio::time::timeout(KILL_GRACE, reader).await.is_err() {
                warn!("reader task did not finish within grace period");
            }
        }
        self.children.lock().unwrap().clear();
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.session_subs
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .insert(token, tx);
        Subscription { token, rx }
    }

    pub fn unsubscribe(&self, session_id: &str, token: u64) {
        let mut subs = self.session_subs.lock().unwrap();
        if let Some(map) = subs.get_mut(session_id) {
            map.remove(&token);
            if map.is_empty() {
                subs.remove(session_id);
            }
        }
    }

    pub fn subscribe_all(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.all_subs.lock().unwrap().insert(token, tx);
        Subscription { token, rx }
    }

    pub fn unsubscribe_all(&self, token: u64) {
        self.all_subs.lock().unwrap().remove(&token);
    }

    /// Deliver one event to per-session and catch-all subscribers.  The
    /// sender lists are snapshotted first; closed receivers are dropped on
    /// the next dispatch.
    fn dispatch(&self, session_id: &str, event: ProcessEvent) {
        let event = Arc::new(event);
        let msg = SessionEvent {
            session_id: session_id.to_string(),
            event,
        };

        let targets: Vec<Sender> = {
            let subs = self.session_subs.lock().unwrap();
            subs.get(session_id)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        };
        let all: Vec<Sender> = {
            let subs = self.all_subs.lock().unwrap();
            subs.values().cloned().collect()
        };
        for tx in targets.iter().chain(all.iter()) {
            let _ = tx.send(msg.clone());
        }
    }

    // ── Reader task ───────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn run_reader(
        mgr: Arc<Self>,
        session_id: String,
        mut events_rx: mpsc::Receiver<String>,
        mut exit_rx: oneshot::Receiver<Option<i32>>,
        deadline: Arc<Mutex<Instant>>,
        timeout: Duration,
        origin_address: Option<String>,
        stop_requested: Arc<AtomicBool>,
    ) {
        loop {
            let dl = *deadline.lock().unwrap();
            tokio::select! {
                _ = tokio::time::sleep_until(dl) => {
                    let current = *deadline.lock().unwrap();
                    if Instant::now() < current {
                        continue; // extended meanwhile
                    }
                    warn!(session_id, "inactivity timeout; killing sub-process");
                    mgr.dispatch(&session_id, ProcessEvent::SessionExited { code: None });
                    mgr.kill_child(&session_id);
                    if let Err(e) = mgr.store.mark_session_ended(&session_id, SessionStatus::Error) {
                        error!(session_id, "mark error failed: {e}");
                    }
                    mgr.remove_child(&session_id);
                    return;
                }
                line = events_rx.recv() => match line {
                    Some(line) => {
                        let Some(event) = ProcessEvent::parse(&line) else {
                            debug!(session_id, "dropping unparseable event line");
                            continue;
                        };
                        if event.is_activity() {
                            *deadline.lock().unwrap() = Instant::now() + timeout;
                        }
                        if mgr.handle_event(&session_id, &event, origin_address.as_deref()) {
                            // terminal event handled; reader is done
                            let code = match &event {
                                ProcessEvent::SessionExited { code } => *code,
                                _ => None,
                            };
                            let ended = if stop_requested.load(Ordering::SeqCst)
                                || code == Some(0)
                            {
                                SessionStatus::Stopped
                            } else {
                                SessionStatus::Error
                            };
                            let _ = mgr.store.mark_session_ended(&session_id, ended);
                            mgr.remove_child(&session_id);
                            return;
                        }
                    }
                    None => {
                        // stdout EOF: the child is gone; pick up the code.
                        let code = (&mut exit_rx).await.ok().flatten();
                        mgr.dispatch(&session_id, ProcessEvent::SessionExited { code });
                        let ended = if stop_requested.load(Ordering::SeqCst) || code == Some(0) {
                            SessionStatus::Stopped
                        } else {
                            SessionStatus::Error
                        };
                        if let Err(e) = mgr.store.mark_session_ended(&session_id, ended) {
                            error!(session_id, "mark ended failed: {e}");
                        }
                        mgr.remove_child(&session_id);
                        return;
                    }
                }
            }
        }
    }

    /// Apply side effects for one event and forward it.  Returns true when
    /// the event is terminal.
    fn handle_event(
        &self,
        session_id: &str,
        event: &ProcessEvent,
        origin_address: Option<&str>,
    ) -> bool {
        match event {
            ProcessEvent::Assistant { .. } => {
                if let Some(text) = event.assistant_text() {
                    let _ = self
                        .store
                        .append_session_message(session_id, "assistant", &text, 0.0);
                }
            }
            ProcessEvent::Result {
                cost_usd,
                num_turns,
                extra_credits,
                ..
            } => {
                let _ = self
                    .store
                    .add_session_result(session_id, *cost_usd, *num_turns as i64);
                if let Some(origin) = origin_address {
                    if !self.is_owner(origin) {
                        match self.credits.charge_turn(origin, *extra_credits) {
                            Ok(charged) if charged > 0.0 => {
                                let _ = self.store.add_session_credits(session_id, charged);
                            }
                            Ok(_) => {}
                            Err(e) => warn!(session_id, "credit charge failed: {e}"),
                        }
                    }
                }
            }
            ProcessEvent::ApprovalRequest {
                short_id,
                tool,
                input,
                timeout_ms,
            } => {
                let rx = self.approvals.register(
                    session_id,
                    short_id,
                    tool,
                    input.clone(),
                    origin_address.map(str::to_string),
                    timeout_ms.map(Duration::from_millis),
                );
                // Relay the decision to the child's stdin once it arrives.
                let stdin_tx = {
                    let children = self.children.lock().unwrap();
                    children.get(session_id).map(|c| c.stdin_tx.clone())
                };
                if let Some(stdin_tx) = stdin_tx {
                    let short = short_id.clone();
                    tokio::spawn(async move {
                        let decision = rx.await.unwrap_or(ApprovalDecision::Deny);
                        let behavior = match decision {
                            ApprovalDecision::Approve => "allow",
                            ApprovalDecision::Deny => "deny",
                        };
                        let line = json!({
                            "type": "approval_response",
                            "short_id": short,
                            "behavior": behavior,
                        })
                        .to_string();
                        let _ = stdin_tx.send(line).await;
                    });
                }
            }
            ProcessEvent::SessionExited { .. } => {
                self.dispatch(session_id, event.clone());
                return true;
            }
            _ => {}
        }
        self.dispatch(session_id, event.clone());
        false
    }

    fn kill_child(&self, session_id: &str) {
        let kill_tx = {
            let mut children = self.children.lock().unwrap();
            children.get_mut(session_id).and_then(|c| c.kill_tx.take())
        };
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }
    }

    fn remove_child(&self, session_id: &str) {
        self.children.lock().unwrap().remove(session_id);
    }
}

// ── Real launcher ─────────────────────────────────────────────────────────────

/// Launches the configured agent binary with piped stdio.
///
/// The child receives `--session <id>` (plus `--resume` / `--restricted`
/// flags as applicable), runs in the session's working directory, and speaks
/// the NDJSON event protocol on stdout.  A pump task owns the process handle:
/// kill requests send SIGTERM, escalating to SIGKILL after a grace period.
pub struct CommandLauncher {
    pub program: String,
    pub base_args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }
}

impl ChildLauncher for CommandLauncher {
    fn spawn(&self, session: &SessionRow, opts: &StartOptions) -> anyhow::Result<SpawnedChild> {
        use std::process::Stdio;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--session")
            .arg(&session.id)
            .arg("--agent")
            .arg(&session.agent_id);
        if opts.resume {
            cmd.arg("--resume");
        }
        if opts.scheduler_mode {
            cmd.arg("--restricted");
        }
        if let Some(dir) = &session.work_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or_default();

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdout not piped"))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        let (events_tx, events_rx) = mpsc::channel::<String>(256);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        // stdin pump
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // stdout pump
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if events_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        // process owner: waits for exit or kill request
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = &mut kill_rx => {
                    #[cfg(unix)]
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                        Ok(status) => status.ok().and_then(|s| s.code()),
                        Err(_) => {
                            let _ = child.start_kill();
                            child.wait().await.ok().and_then(|s| s.code())
                        }
                    }
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedChild {
            pid,
            stdin_tx,
            events_rx,
            exit_rx,
            kill_tx,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLauncher;
    use quorum_config::CreditConfig;
    use quorum_db::sessions::NewSession;

    struct Fixture {
        store: Arc<Store>,
        launcher: Arc<MockLauncher>,
        mgr: Arc<ProcessManager>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let launcher = Arc::new(MockLauncher::new());
        let approvals = Arc::new(ApprovalManager::new());
        let credits = Arc::new(CreditService::new(
            Arc::clone(&store),
            CreditConfig {
                enabled: true,
                credits_per_turn: 10.0,
                credits_per_algo: 100.0,
                welcome_grant: 0.0,
            },
        ));
        let mgr = ProcessManager::new(
            Arc::clone(&store),
            Arc::clone(&launcher) as Arc<dyn ChildLauncher>,
            approvals,
            credits,
            Duration::from_secs(60),
        );
        Fixture {
            store,
            launcher,
            mgr,
        }
    }

    fn session(store: &Store, id: &str) -> SessionRow {
        store
            .create_session(NewSession {
                id: id.to_string(),
                agent_id: "agent-1".to_string(),
                ..NewSession::default()
            })
            .unwrap()
    }

    async fn recv_event(sub: &mut Subscription) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), sub.rx.recv())
            .await
            .expect("no event received")
            .expect("subscription closed")
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_subscribers_in_order() {
        let f = fixture();
        let s = session(&f.store, "s1");
        let mut sub = f.mgr.subscribe("s1");

        f.mgr
            .start_process(&s, "hello", StartOptions::default())
            .await
            .unwrap();
        let child = f.launcher.handle("s1");

        child
            .send_line(r#"{"type":"tool_status","message":"working"}"#)
            .await;
        child.send_line(r#"{"type":"content_block_stop"}"#).await;

        let first = recv_event(&mut sub).await;
        assert!(matches!(
            *first.event,
            ProcessEvent::ToolStatus { ref message } if message == "working"
        ));
        let second = recv_event(&mut sub).await;
        assert!(matches!(*second.event, ProcessEvent::ContentBlockStop));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_is_rejected() {
        let f = fixture();
        let s = session(&f.store, "s1");
        f.mgr
            .start_process(&s, "hi", StartOptions::default())
            .await
            .unwrap();
        let err = f
            .mgr
            .start_process(&s, "again", StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyRunning(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failure_marks_session_error() {
        let f = fixture();
        let s = session(&f.store, "s1");
        f.launcher.fail_next_spawn();
        let err = f
            .mgr
            .start_process(&s, "hi", StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn(_)));
        assert_eq!(
            f.store.get_session("s1").unwrap().status,
            SessionStatus::Error
        );
        assert!(!f.mgr.is_running("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_exit_marks_stopped_and_emits_exited() {
        let f = fixture();
        let s = session(&f.store, "s1");
        let mut sub = f.mgr.subscribe("s1");
        f.mgr
            .start_process(&s, "hi", StartOptions::default())
            .await
            .unwrap();
        let child = f.launcher.handle("s1");
        child.exit(Some(0)).await;

        let ev = recv_event(&mut sub).await;
        assert!(matches!(
            *ev.event,
            ProcessEvent::SessionExited { code: Some(0) }
        ));
        // Reader marks the session after dispatching; wait for it to settle.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let row = f.store.get_session("s1").unwrap();
        assert_eq!(row.status, SessionStatus::Stopped);
        assert_eq!(row.pid, None);
        assert!(!f.mgr.is_running("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn crash_exit_marks_error() {
        let f = fixture();
        let s = session(&f.store, "s1");
        let mut sub = f.mgr.subscribe("s1");
        f.mgr
            .start_process(&s, "hi", StartOptions::default())
            .await
            .unwrap();
        let child = f.launcher.handle("s1");
        child.exit(Some(2)).await;

        let ev = recv_event(&mut sub).await;
        assert!(matches!(
            *ev.event,
            ProcessEvent::SessionExited { code: Some(2) }
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            f.store.get_session("s1").unwrap().status,
            SessionStatus::Error
        );
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_timeout_emits_synthetic_exit() {
        let f = fixture();
        let s = session(&f.store, "s1");
        let mut sub = f.mgr.subscribe("s1");
        f.mgr
            .start_process(
                &s,
                "hi",
                StartOptions {
                    timeout: Some(Duration::from_secs(10)),
                    ..StartOptions::default()
                },
            )
            .await
            .unwrap();
        let _child = f.launcher.handle("s1");

        tokio::time::sleep(Duration::from_secs(11)).await;
        let ev = recv_event(&mut sub).await;
        assert!(matches!(*ev.event, ProcessEvent::SessionExited { code: None }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            f.store.get_session("s1").unwrap().status,
            SessionStatus::Error
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activity_rearms_the_timeout() {
        let f = fixture();
        let s = session(&f.store, "s1");
        f.mgr
            .start_process(
                &s,
                "hi",
                StartOptions {
                    timeout: Some(Duration::from_secs(10)),
                    ..StartOptions::default()
                },
            )
            .await
            .unwrap();
        let child = f.launcher.handle("s1");

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(7)).await;
            child.send_line(r#"{"type":"tool_status","message":"tick"}"#).await;
            // Let the reader process the line before sleeping again.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.mgr.is_running("s1"), "activity must keep the session alive");
    }

    #[tokio::test(start_paused = true)]
    async fn extend_timeout_defers_expiry() {
        let f = fixture();
        let s = session(&f.store, "s1");
        f.mgr
            .start_process(
                &s,
                "hi",
                StartOptions {
                    timeout: Some(Duration::from_secs(10)),
                    ..StartOptions::default()
                },
            )
            .await
            .unwrap();
        let _child = f.launcher.handle("s1");

        assert!(f.mgr.extend_timeout("s1", Duration::from_secs(30)));
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(f.mgr.is_running("s1"));

        assert!(!f.mgr.extend_timeout("missing", Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn send_message_false_when_not_running() {
        let f = fixture();
        assert!(!f.mgr.send_message("ghost", "hello").await);
    }

    #[tokio::test(start_paused = true)]
    async fn send_message_reaches_child_stdin() {
        let f = fixture();
        let s = session(&f.store, "s1");
        f.mgr
            .start_process(&s, "first", StartOptions::default())
            .await
            .unwrap();
        let child = f.launcher.handle("s1");

        // Initial prompt envelope arrives first.
        let line = child.next_stdin().await.unwrap();
        assert!(line.contains("first"));

        assert!(f.mgr.send_message("s1", "follow-up").await);
        let line = child.next_stdin().await.unwrap();
        assert!(line.contains("follow-up"));
    }

    #[tokio::test(start_paused = true)]
    async fn result_event_accumulates_and_charges_non_owner() {
        let f = fixture();
        let s = session(&f.store, "s1");
        f.mgr
            .start_process(
                &s,
                "hi",
                StartOptions {
                    origin_address: Some("SENDER".to_string()),
                    ..StartOptions::default()
                },
            )
            .await
            .unwrap();
        let child = f.launcher.handle("s1");
        child
            .send_line(r#"{"type":"result","cost_usd":0.4,"num_turns":1}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let row = f.store.get_session("s1").unwrap();
        assert!((row.total_cost_usd - 0.4).abs() < 1e-9);
        assert_eq!(row.total_turns, 1);
        assert_eq!(row.credits_consumed, 10.0);
        assert_eq!(f.store.credit_balance("SENDER").unwrap(), -10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn owner_origin_skips_credit_charge() {
        let f = fixture();
        f.mgr
            .set_owner_check(Arc::new(|addr: &str| addr == "OWNER"));
        let s = session(&f.store, "s1");
        f.mgr
            .start_process(
                &s,
                "hi",
                StartOptions {
                    origin_address: Some("OWNER".to_string()),
                    ..StartOptions::default()
                },
            )
            .await
            .unwrap();
        let child = f.launcher.handle("s1");
        child
            .send_line(r#"{"type":"result","cost_usd":0.1,"num_turns":1}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.store.credit_balance("OWNER").unwrap(), 0.0);
        assert_eq!(f.store.get_session("s1").unwrap().credits_consumed, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn approval_is_registered_and_decision_reaches_stdin() {
        let f = fixture();
        let s = session(&f.store, "s1");
        let mut sub = f.mgr.subscribe("s1");
        f.mgr
            .start_process(
                &s,
                "hi",
                StartOptions {
                    origin_address: Some("SENDER".to_string()),
                    ..StartOptions::default()
                },
            )
            .await
            .unwrap();
        let child = f.launcher.handle("s1");
        let _ = child.next_stdin().await; // drain initial prompt

        child
            .send_line(
                r#"{"type":"approval_request","short_id":"ab12","tool":"shell","input":{}}"#,
            )
            .await;

        // Forwarded unchanged to subscribers.
        let ev = recv_event(&mut sub).await;
        assert!(matches!(*ev.event, ProcessEvent::ApprovalRequest { .. }));
        assert_eq!(f.mgr.approvals().outstanding(), 1);

        // Only the registered sender may resolve.
        assert!(f
            .mgr
            .resolve_approval("ab12", ApprovalDecision::Approve, Some("INTRUDER"))
            .is_err());
        f.mgr
            .resolve_approval("ab12", ApprovalDecision::Approve, Some("SENDER"))
            .unwrap();

        let line = child.next_stdin().await.unwrap();
        assert!(line.contains("approval_response"));
        assert!(line.contains("allow"));
    }

    #[tokio::test(start_paused = true)]
    async fn assistant_text_is_persisted() {
        let f = fixture();
        let s = session(&f.store, "s1");
        f.mgr
            .start_process(&s, "hi", StartOptions::default())
            .await
            .unwrap();
        let child = f.launcher.handle("s1");
        child
            .send_line(
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"answer"}]}}"#,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            f.store.last_assistant_message("s1").unwrap().as_deref(),
            Some("answer")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_process_yields_stopped_status() {
        let f = fixture();
        let s = session(&f.store, "s1");
        let mut sub = f.mgr.subscribe("s1");
        f.mgr
            .start_process(&s, "hi", StartOptions::default())
            .await
            .unwrap();
        let _child = f.launcher.handle("s1");

        f.mgr.stop_process("s1").await;
        let ev = recv_event(&mut sub).await;
        assert!(matches!(*ev.event, ProcessEvent::SessionExited { .. }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            f.store.get_session("s1").unwrap().status,
            SessionStatus::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_all_sees_every_session() {
        let f = fixture();
        let s1 = session(&f.store, "s1");
        let s2 = session(&f.store, "s2");
        let mut sub = f.mgr.subscribe_all();

        f.mgr
            .start_process(&s1, "a", StartOptions::default())
            .await
            .unwrap();
        f.mgr
            .start_process(&s2, "b", StartOptions::default())
            .await
            .unwrap();
        let c1 = f.launcher.handle("s1");
        let c2 = f.launcher.handle("s2");
        c1.send_line(r#"{"type":"content_block_stop"}"#).await;
        c2.send_line(r#"{"type":"content_block_stop"}"#).await;

        let a = recv_event(&mut sub).await;
        let b = recv_event(&mut sub).await;
        let mut ids = vec![a.session_id, b.session_id];
        ids.sort();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_from_within_consumer_does_not_deadlock() {
        let f = fixture();
        let s = session(&f.store, "s1");
        let sub = f.mgr.subscribe("s1");
        let token = sub.token;
        f.mgr
            .start_process(&s, "hi", StartOptions::default())
            .await
            .unwrap();
        let child = f.launcher.handle("s1");

        // Consumer task unsubscribes as soon as it sees one event.
        let mgr = Arc::clone(&f.mgr);
        let mut rx = sub.rx;
        let consumer = tokio::spawn(async move {
            let _ = rx.recv().await;
            mgr.unsubscribe("s1", token);
        });

        child.send_line(r#"{"type":"content_block_stop"}"#).await;
        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consumer deadlocked")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_all_children() {
        let f = fixture();
        let s1 = session(&f.store, "s1");
        let s2 = session(&f.store, "s2");
        f.mgr
            .start_process(&s1, "a", StartOptions::default())
            .await
            .unwrap();
        f.mgr
            .start_process(&s2, "b", StartOptions::default())
            .await
            .unwrap();
        let _c1 = f.launcher.handle("s1");
        let _c2 = f.launcher.handle("s2");

        f.mgr.shutdown().await;
        assert!(f.mgr.active_session_ids().is_empty());
    }
}
