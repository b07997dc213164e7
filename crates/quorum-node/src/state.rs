// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use quorum_algochat::AlgoChatBridge;
use quorum_config::Config;
use quorum_core::process::ProcessManager;
use quorum_core::subscription::SubscriptionManager;
use quorum_core::NotificationBus;
use quorum_council::CouncilEngine;
use quorum_db::Store;
use quorum_dedup::DedupService;
use quorum_scheduler::Scheduler;
use quorum_workflow::WorkflowEngine;

use crate::hub::WsHub;

/// One advertised model provider (for the local UI's provider picker).
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub models: Vec<String>,
}

/// Everything the HTTP/WS layer can reach, assembled once at startup.
pub struct NodeState {
    pub config: Config,
    pub store: Arc<Store>,
    pub processes: Arc<ProcessManager>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub councils: Arc<CouncilEngine>,
    pub workflows: Arc<WorkflowEngine>,
    pub scheduler: Arc<Scheduler>,
    pub bridge: Arc<AlgoChatBridge>,
    pub notifications: Arc<NotificationBus>,
    pub dedup: Arc<DedupService>,
    pub hub: Arc<WsHub>,
    pub providers: Vec<ProviderInfo>,
    pub started_at: Instant,
}

impl NodeState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
