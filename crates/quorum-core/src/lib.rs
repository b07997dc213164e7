// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Core supervision layer: the process manager and everything it feeds.
//!
//! ```text
//!   ingress (WS / chain / Slack / scheduler)
//!       │  start_process / send_message
//!       ▼
//!   ProcessManager ── spawns agent sub-process, reads NDJSON events
//!       │  per-subscriber mpsc channels
//!       ├──► ChainResponseBuilder (one per session+participant)
//!       ├──► WsStreamer           (one per session)
//!       └──► council / workflow auto-advance watchers
//! ```

pub mod approvals;
pub mod credits;
pub mod events;
pub mod health;
pub mod mock;
pub mod notify;
pub mod process;
pub mod subscription;

pub use approvals::{ApprovalDecision, ApprovalManager, ApprovalMode, PendingApproval};
pub use credits::CreditService;
pub use events::{AssistantMessage, ContentBlock, ContentPart, Delta, ProcessEvent};
pub use health::{compute_trends, format_trends_for_prompt, Trend, TrendDirection};
pub use notify::{
    AskOwnerRequest, AskOwnerResult, ChannelAdapter, NotificationBus, Notify, NotifyLevel,
};
pub use process::{
    ChildLauncher, CommandLauncher, OwnerCheck, ProcessError, ProcessManager, SessionEvent,
    SpawnedChild, StartOptions, Subscription,
};
pub use subscription::{ChainFeed, ChainFeedEvent, SubscriptionManager, WsSink};
