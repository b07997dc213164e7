// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Pending tool-approval registry.
//!
//! When a sub-process emits `approval_request`, the process manager records
//! the request here and forwards the event to subscribers so every ingress
//! channel can surface it to the owner.  Whichever channel answers first wins;
//! the decision travels back through a oneshot and the manager writes it to
//! the child's stdin.
//!
//! Two id spaces exist side by side: the sub-process's `short_id` (opaque
//! token, used for correlation on the chain) and a small queue number (used by
//! `/approve <n>` style commands).  Their allocators share nothing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default wait before an unanswered request is treated as denied.
const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// How incoming approval requests are handled.
///
/// - `Normal`: forwarded immediately, denied on timeout.
/// - `Queued`: forwarded and held in the numbered FIFO; denied on timeout.
/// - `Paused`: held with the timeout suspended until the mode changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalMode {
    #[default]
    Normal,
    Queued,
    Paused,
}

impl ApprovalMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "queued" => Some(Self::Queued),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Queued => "queued",
            Self::Paused => "paused",
        }
    }
}

/// Public view of one pending request.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub short_id: String,
    pub queue_no: u64,
    pub session_id: String,
    pub tool: String,
    pub input: Value,
    /// Address that is allowed to resolve this request (when the request
    /// originated from an addressed channel).
    pub sender_address: Option<String>,
}

struct Entry {
    info: PendingApproval,
    resolve_tx: oneshot::Sender<ApprovalDecision>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Entry>,
    /// FIFO of short ids, oldest first.
    order: Vec<String>,
    mode: ApprovalMode,
    next_queue_no: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("no pending approval with that id")]
    NotFound,
    #[error("sender is not authorised to resolve this approval")]
    SenderMismatch,
}

#[derive(Default)]
pub struct ApprovalManager {
    /// Shared with the timeout watchdog tasks, which outlive any one borrow
    /// of the manager.
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending request.  The returned receiver resolves exactly once:
    /// with the owner's decision, or with `Deny` when the timeout fires first
    /// (suspended while the mode is `Paused`).
    pub fn register(
        &self,
        session_id: &str,
        short_id: &str,
        tool: &str,
        input: Value,
        sender_address: Option<String>,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let queue_no = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_queue_no += 1;
            let queue_no = inner.next_queue_no;
            inner.pending.insert(
                short_id.to_string(),
                Entry {
                    info: PendingApproval {
                        short_id: short_id.to_string(),
                        queue_no,
                        session_id: session_id.to_string(),
                        tool: tool.to_string(),
                        input,
                        sender_address,
                    },
                    resolve_tx: tx,
                },
            );
            inner.order.push(short_id.to_string());
            queue_no
        };
        debug!(short_id, queue_no, tool, "approval registered");

        // Timeout watchdog: deny if still pending when it fires.  Re-checks
        // while paused rather than firing.
        let shared = std::sync::Arc::clone(&self.inner);
        let short = short_id.to_string();
        let timeout = timeout.unwrap_or(DEFAULT_APPROVAL_TIMEOUT);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;
                {
                    let inner = shared.lock().unwrap();
                    if inner.mode == ApprovalMode::Paused
                        && inner.pending.contains_key(&short)
                    {
                        continue;
                    }
                }
                match resolve_in(&shared, &short, ApprovalDecision::Deny, None) {
                    Ok(()) => warn!(short_id = %short, "approval timed out; denied"),
                    Err(_) => {} // already resolved
                }
                break;
            }
        });

        rx
    }

    /// Resolve by the sub-process's short id.  When `sender` is given, it
    /// must match the address the request was registered with.
    pub fn resolve_by_short_id(
        &self,
        short_id: &str,
        decision: ApprovalDecision,
        sender: Option<&str>,
    ) -> Result<(), ApprovalError> {
        resolve_in(&self.inner, short_id, decision, sender)
    }

    /// Resolve by queue number (`/approve 3`).
    pub fn resolve_by_queue_no(
        &self,
        queue_no: u64,
        decision: ApprovalDecision,
        sender: Option<&str>,
    ) -> Result<(), ApprovalError> {
        let short_id = {
            let inner = self.inner.lock().unwrap();
            inner
                .pending
                .values()
                .find(|e| e.info.queue_no == queue_no)
                .map(|e| e.info.short_id.clone())
                .ok_or(ApprovalError::NotFound)?
        };
        self.resolve_by_short_id(&short_id, decision, sender)
    }

    /// Pending requests, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|short| inner.pending.get(short).map(|e| e.info.clone()))
            .collect()
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn mode(&self) -> ApprovalMode {
        self.inner.lock().unwrap().mode
    }

    pub fn set_mode(&self, mode: ApprovalMode) {
        self.inner.lock().unwrap().mode = mode;
    }
}

fn resolve_in(
    inner: &Mutex<Inner>,
    short_id: &str,
    decision: ApprovalDecision,
    sender: Option<&str>,
) -> Result<(), ApprovalError> {
    let mut inner = inner.lock().unwrap();
    let entry = inner.pending.get(short_id).ok_or(ApprovalError::NotFound)?;
    if let (Some(expected), Some(actual)) = (entry.info.sender_address.as_deref(), sender) {
        if expected != actual {
            warn!(short_id, "approval resolve rejected: sender mismatch");
            return Err(ApprovalError::SenderMismatch);
        }
    }
    let entry = inner.pending.remove(short_id).expect("checked above");
    inner.order.retain(|s| s != short_id);
    let _ = entry.resolve_tx.send(decision);
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn resolve_delivers_decision_once() {
        let mgr = Arc::new(ApprovalManager::new());
        let rx = mgr.register("s1", "ab12", "shell", Value::Null, None, None);
        mgr.resolve_by_short_id("ab12", ApprovalDecision::Approve, None)
            .unwrap();
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Approve);
        // Second resolve of the same id fails.
        assert_eq!(
            mgr.resolve_by_short_id("ab12", ApprovalDecision::Deny, None),
            Err(ApprovalError::NotFound)
        );
    }

    #[tokio::test]
    async fn sender_mismatch_is_rejected() {
        let mgr = Arc::new(ApprovalManager::new());
        let _rx = mgr.register(
            "s1",
            "ab12",
            "shell",
            Value::Null,
            Some("OWNER".to_string()),
            None,
        );
        assert_eq!(
            mgr.resolve_by_short_id("ab12", ApprovalDecision::Approve, Some("MALLORY")),
            Err(ApprovalError::SenderMismatch)
        );
        // The registered sender succeeds.
        mgr.resolve_by_short_id("ab12", ApprovalDecision::Approve, Some("OWNER"))
            .unwrap();
    }

    #[tokio::test]
    async fn queue_numbers_are_sequential_and_resolvable() {
        let mgr = Arc::new(ApprovalManager::new());
        let rx1 = mgr.register("s1", "aaaa", "shell", Value::Null, None, None);
        let _rx2 = mgr.register("s1", "bbbb", "write", Value::Null, None, None);
        let pending = mgr.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].queue_no, 1);
        assert_eq!(pending[1].queue_no, 2);

        mgr.resolve_by_queue_no(1, ApprovalDecision::Deny, None)
            .unwrap();
        assert_eq!(rx1.await.unwrap(), ApprovalDecision::Deny);
        assert_eq!(mgr.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_denies_unanswered_request() {
        let mgr = Arc::new(ApprovalManager::new());
        let rx = mgr.register(
            "s1",
            "ab12",
            "shell",
            Value::Null,
            None,
            Some(Duration::from_secs(5)),
        );
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Deny);
        assert_eq!(mgr.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_mode_suspends_timeout() {
        let mgr = Arc::new(ApprovalManager::new());
        mgr.set_mode(ApprovalMode::Paused);
        let rx = mgr.register(
            "s1",
            "ab12",
            "shell",
            Value::Null,
            None,
            Some(Duration::from_secs(5)),
        );
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(mgr.outstanding(), 1, "paused request must survive timeout");

        mgr.set_mode(ApprovalMode::Normal);
        mgr.resolve_by_short_id("ab12", ApprovalDecision::Approve, None)
            .unwrap();
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Approve);
    }
}
