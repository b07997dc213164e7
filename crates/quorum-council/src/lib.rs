// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Council engine — staged multi-agent deliberation.
//!
//! ```text
//! queued ──launch──► responding ──┬──► discussing (× rounds) ──┐
//!                                 │                            │
//!                                 └────────────────────────────┴──► reviewing
//!                                                                       │
//!                                              synthesizing ◄───────────┤
//!                                                   │        (chairman) │
//!                                                   ▼                   ▼
//!                                               complete ◄── aggregated finish
//! ```
//!
//! Every stage spawns a set of sessions through the process manager and
//! watches for their `session_exited` events; when the whole set has exited
//! the next trigger fires automatically.  A spawn failure never rolls a
//! stage back — the launch proceeds with the sessions that did start, and a
//! stage that spawned zero sessions advances immediately.

mod aggregate;
mod engine;
mod prompts;

pub use aggregate::{aggregate_with_separators, latest_responses, AgentResponse};
pub use engine::{CouncilEngine, CouncilError, CouncilEvent, LaunchStarted};
