// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Server entry point — assembles all subsystems and runs until a signal.
//!
//! # Startup sequence
//!
//! 1. Load the layered YAML config (env overrides win).
//! 2. Open the SQLite store and run migrations.
//! 3. Install the process-wide dedup service and its prune/flush loops.
//! 4. Build the process manager with the configured agent launcher and the
//!    owner predicate (config allowlist ∪ database allowlist).
//! 5. Wire councils, workflows (with the `agent_session` executor), the
//!    notification bus, the scheduler (recover, then tick), and — when
//!    enabled — the AlgoChat bridge.
//! 6. Pump every component event stream into the WebSocket topic hub.
//! 7. Serve HTTP/WS until SIGINT (exit 0) or SIGTERM (exit non-zero).

mod cli;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use quorum_algochat::transport::{UnconfiguredChain, UnconfiguredPsk};
use quorum_algochat::AlgoChatBridge;
use quorum_core::approvals::ApprovalManager;
use quorum_core::credits::CreditService;
use quorum_core::process::{ChildLauncher, CommandLauncher, ProcessManager};
use quorum_core::subscription::SubscriptionManager;
use quorum_core::NotificationBus;
use quorum_council::CouncilEngine;
use quorum_db::Store;
use quorum_dedup::DedupOptions;
use quorum_node::hub::{self, WsHub};
use quorum_node::{adapters, NodeState, ProviderInfo};
use quorum_scheduler::Scheduler;
use quorum_workflow::{AgentSessionExecutor, WorkflowEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ShowConfig => {
                let config = quorum_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::Completions { shell } => {
                cli::print_completions(*shell);
                return Ok(());
            }
        }
    }

    let config = quorum_config::load(cli.config.as_deref())?;
    run_server(config).await
}

async fn run_server(config: quorum_config::Config) -> anyhow::Result<()> {
    let started = Instant::now();
    let store = Arc::new(
        Store::open(&config.database.path)
            .with_context(|| format!("opening database {}", config.database.path))?,
    );

    // ── Dedup service ─────────────────────────────────────────────────────────
    let dedup = quorum_dedup::init_global(Some(Arc::clone(&store)));
    dedup.register("webhook-delivery", DedupOptions::default());
    dedup.register("slack-event", DedupOptions::default());
    dedup.register(
        "algochat-tx",
        DedupOptions {
            persist: true,
            ..DedupOptions::default()
        },
    );
    let mut background = dedup.spawn_background_tasks();

    // ── Process manager ───────────────────────────────────────────────────────
    let approvals = Arc::new(ApprovalManager::new());
    let credits = Arc::new(CreditService::new(
        Arc::clone(&store),
        config.credits.clone(),
    ));
    let launcher: Arc<dyn ChildLauncher> =
        Arc::new(CommandLauncher::new(config.sessions.agent_command.clone()));
    let processes = ProcessManager::new(
        Arc::clone(&store),
        launcher,
        approvals,
        credits,
        Duration::from_secs(config.sessions.inactivity_timeout_secs),
    );
    {
        // Owner authority: static config list plus the mutable DB allowlist.
        let owners: Vec<String> = config.algochat.owner_addresses.clone();
        let store = Arc::clone(&store);
        processes.set_owner_check(Arc::new(move |address: &str| {
            owners.iter().any(|a| a == address)
                || store.allowlist_contains(address).unwrap_or(false)
        }));
    }
    let subscriptions = SubscriptionManager::new(
        Arc::clone(&processes),
        Duration::from_secs(config.sessions.subscription_timeout_secs),
    );

    // ── Coordination engines ──────────────────────────────────────────────────
    let councils = CouncilEngine::new(Arc::clone(&store), Arc::clone(&processes));
    let workflows = WorkflowEngine::new(Arc::clone(&store));
    workflows.register_executor(
        "agent_session",
        Arc::new(AgentSessionExecutor::new(
            Arc::clone(&store),
            Arc::clone(&processes),
        )),
    );
    let notifications = NotificationBus::new(Arc::clone(&store), adapters::default_adapters());

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&processes),
        Arc::clone(&councils),
        Arc::clone(&notifications),
    );
    scheduler.recover().context("schedule recovery")?;
    background.push(scheduler.spawn());

    // ── AlgoChat bridge ───────────────────────────────────────────────────────
    // The chain client (crypto, signing, indexer) is provided by an external
    // library binding; without one the bridge stays constructible but inert.
    let bridge = AlgoChatBridge::new(
        config.algochat.clone(),
        Arc::clone(&store),
        Arc::clone(&processes),
        Arc::clone(&subscriptions),
        Arc::clone(&dedup),
        Arc::new(UnconfiguredChain),
        Arc::new(UnconfiguredPsk),
    );
    bridge.set_council_engine(Arc::clone(&councils));
    bridge.set_work_task_cap(config.work_tasks.max_per_day);
    if config.algochat.enabled {
        background.extend(bridge.start_background_tasks());
        info!("algochat bridge enabled");
    }

    // ── WS topic hub ──────────────────────────────────────────────────────────
    let ws_hub = WsHub::new();
    hub::pump_council(Arc::clone(&ws_hub), councils.subscribe());
    hub::pump_workflows(Arc::clone(&ws_hub), workflows.subscribe());
    hub::pump_scheduler(Arc::clone(&ws_hub), scheduler.subscribe());
    hub::pump_json(Arc::clone(&ws_hub), "algochat", bridge.subscribe_events());
    hub::pump_json(
        Arc::clone(&ws_hub),
        "owner",
        notifications.subscribe_owner_topic(),
    );

    // ── Node state & HTTP server ──────────────────────────────────────────────
    let state = Arc::new(NodeState {
        config: config.clone(),
        store: Arc::clone(&store),
        processes: Arc::clone(&processes),
        subscriptions,
        councils,
        workflows,
        scheduler,
        bridge,
        notifications,
        dedup: Arc::clone(&dedup),
        hub: ws_hub,
        providers: build_providers(&store),
        started_at: started,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(quorum_node::serve(Arc::clone(&state), async {
        let _ = shutdown_rx.await;
    }));

    // ── Wait for a signal ─────────────────────────────────────────────────────
    // Supervisors infer intent from the exit code: SIGINT is an intentional
    // stop (exit 0), SIGTERM and fatal errors exit non-zero.
    let terminated = wait_for_signal().await;

    log_shutdown_diagnostics(&state, started);
    let _ = shutdown_tx.send(());
    state.processes.shutdown().await;
    dedup.flush();
    for handle in background {
        handle.abort();
    }
    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("http server error: {e}"),
        Ok(Err(e)) => error!("http server task failed: {e}"),
        Err(_) => error!("http server did not stop within the grace period"),
    }

    if terminated {
        std::process::exit(1);
    }
    Ok(())
}

/// Returns true when the signal was SIGTERM.
async fn wait_for_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("signal handler setup failed: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return false;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("signal handler setup failed: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return false;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                true
            }
            _ = sigint.recv() => {
                info!("SIGINT received");
                false
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        false
    }
}

fn log_shutdown_diagnostics(state: &NodeState, started: Instant) {
    let uptime = humantime::format_duration(Duration::from_secs(started.elapsed().as_secs()));
    let parent = parent_pid();
    let active = state.processes.active_session_ids().len();
    let rss = rss_kb()
        .map(|kb| format!("{} MiB", kb / 1024))
        .unwrap_or_else(|| "unknown".to_string());
    info!(
        %uptime,
        parent_pid = parent,
        active_sessions = active,
        rss = %rss,
        "shutting down"
    );
}

fn parent_pid() -> i32 {
    #[cfg(unix)]
    unsafe {
        libc::getppid()
    }
    #[cfg(not(unix))]
    0
}

/// Resident set size from /proc, linux only.
fn rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// The provider picker for the local UI: one entry per distinct agent
/// runtime, models drawn from the agents table.
fn build_providers(store: &Store) -> Vec<ProviderInfo> {
    let models: BTreeSet<String> = store
        .list_agents()
        .unwrap_or_default()
        .into_iter()
        .map(|a| a.model)
        .filter(|m| !m.is_empty())
        .collect();
    vec![ProviderInfo {
        id: "subprocess".to_string(),
        name: "Agent subprocess".to_string(),
        models: models.into_iter().collect(),
    }]
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
