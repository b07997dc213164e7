// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Workflow engine — a concurrent DAG executor.
//!
//! A trigger freezes the workflow's nodes and edges into the run row; the
//! executor task only ever reads the snapshot.  At most `max_concurrency`
//! node runs are `running`/`waiting` at any instant; completed nodes fire
//! their outgoing edges (conditions evaluated against the node's output)
//! and enqueue the targets.  `(run_id, node_id)` is unique, so re-visiting
//! a node is a no-op.

pub mod expr;

mod engine;
mod executors;

pub use engine::{NodeContext, NodeExecutor, WorkflowEngine, WorkflowError, WorkflowEvent};
pub use executors::AgentSessionExecutor;
