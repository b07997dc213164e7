// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! AlgoChat bridge — the adapter between the agent system and an
//! append-only, recipient-addressed, payment-carrying transport.
//!
//! The transport's properties this crate is built around: strictly-monotonic
//! round numbers with best-effort ordering, a ~1 KB per-message byte cap,
//! atomic all-or-nothing groups sharing one round, and external decryption.
//! See [`bridge::AlgoChatBridge`] for the pipeline.

pub mod bridge;
pub mod commands;
pub mod envelope;
pub mod group;
pub mod transport;

pub use bridge::AlgoChatBridge;
pub use commands::CommandOutcome;
pub use envelope::{group_chunk_budget, single_budget, GROUP_PREFIX_RESERVE, TAG_SIZE};
pub use group::{parse_group_prefix, reassemble, split_message, GroupBuffer, GroupChunk};
pub use transport::{
    ChainTransport, Direction, IncomingMessage, OutgoingChunk, PskTransport, SendReceipt,
    SyncHandle,
};
