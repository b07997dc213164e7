// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Scriptable launcher for tests.  No processes are spawned; each "child" is
//! a pair of channels the test drives by hand: push stdout lines with
//! [`MockChildHandle::send_line`], end the child with
//! [`MockChildHandle::exit`], and inspect stdin writes with
//! [`MockChildHandle::next_stdin`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};

use quorum_db::SessionRow;

use crate::process::{ChildLauncher, SpawnedChild, StartOptions};

pub struct MockChildHandle {
    pub session_id: String,
    pub resumed: bool,
    pub scheduler_mode: bool,
    events_tx: mpsc::Sender<String>,
    exit_code_tx: mpsc::Sender<Option<i32>>,
    stdin_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl MockChildHandle {
    /// Push one stdout line (an NDJSON event) into the child's stream.
    pub async fn send_line(&self, line: &str) {
        let _ = self.events_tx.send(line.to_string()).await;
    }

    /// Terminate the child with the given exit code (stdout closes).
    pub async fn exit(&self, code: Option<i32>) {
        let _ = self.exit_code_tx.send(code).await;
    }

    /// Next line the manager wrote to the child's stdin.
    pub async fn next_stdin(&self) -> Option<String> {
        self.stdin_rx.lock().await.recv().await
    }
}

#[derive(Default)]
pub struct MockLauncher {
    handles: Mutex<HashMap<String, MockChildHandle>>,
    next_pid: AtomicU32,
    fail_next: AtomicBool,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Self::default()
        }
    }

    /// Make the next spawn fail synchronously.
    pub fn fail_next_spawn(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Take the handle for a spawned session (panics when missing — the
    /// test forgot to start the session first).
    pub fn handle(&self, session_id: &str) -> MockChildHandle {
        self.handles
            .lock()
            .unwrap()
            .remove(session_id)
            .expect("no mock child for session")
    }
}

impl ChildLauncher for MockLauncher {
    fn spawn(&self, session: &SessionRow, opts: &StartOptions) -> anyhow::Result<SpawnedChild> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("mock spawn failure");
        }

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(64);
        let (test_events_tx, mut test_events_rx) = mpsc::channel::<String>(64);
        let (events_tx, events_rx) = mpsc::channel::<String>(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_code_tx, mut exit_code_rx) = mpsc::channel::<Option<i32>>(1);

        // Child body: forward scripted lines until killed or exited.
        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    _ = &mut kill_rx => break Some(0),
                    code = exit_code_rx.recv() => break code.flatten(),
                    line = test_events_rx.recv() => match line {
                        Some(line) => {
                            if events_tx.send(line).await.is_err() {
                                break None;
                            }
                        }
                        None => break Some(0),
                    },
                }
            };
            let _ = exit_tx.send(code);
            // events_tx drops here, closing the manager's stream.
        });

        let handle = MockChildHandle {
            session_id: session.id.clone(),
            resumed: opts.resume,
            scheduler_mode: opts.scheduler_mode,
            events_tx: test_events_tx,
            exit_code_tx,
            stdin_rx: tokio::sync::Mutex::new(stdin_rx),
        };
        self.handles
            .lock()
            .unwrap()
            .insert(session.id.clone(), handle);

        Ok(SpawnedChild {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            stdin_tx,
            events_rx,
            exit_rx,
            kill_tx,
        })
    }
}
