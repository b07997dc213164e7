// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `[GRP:i/N]` group message codec and the reassembly buffer.
//!
//! A long plaintext is split into chunks that each fit a single envelope;
//! every chunk carries a 1-based index prefix and all chunks of one message
//! share a round (they travel in one atomic transaction group).  The
//! receiver buffers chunks per `(sender, round)` and delivers exactly one
//! reassembled message once indices `1..N` are all present.  Incomplete
//! buckets are dropped after five minutes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use regex::Regex;
use std::sync::OnceLock;

/// How long an incomplete bucket may wait for its missing chunks.
const BUCKET_TTL: Duration = Duration::from_secs(5 * 60);

fn prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[GRP:(\d+)/(\d+)\]").expect("static regex"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupChunk {
    pub index: u32,
    pub total: u32,
    pub body: String,
}

/// Parse a `[GRP:i/N]` prefix.  Non-prefixed content returns `None`.
pub fn parse_group_prefix(content: &str) -> Option<GroupChunk> {
    let caps = prefix_regex().captures(content)?;
    let index: u32 = caps[1].parse().ok()?;
    let total: u32 = caps[2].parse().ok()?;
    let body = content[caps[0].len()..].to_string();
    Some(GroupChunk { index, total, body })
}

/// Render one chunk with its prefix, natural order (1-based).
pub fn format_group_chunk(index: u32, total: u32, body: &str) -> String {
    format!("[GRP:{index}/{total}]{body}")
}

/// Split text into bodies of at most `chunk_budget` bytes, cutting on UTF-8
/// boundaries.  The prefix is NOT included — callers add it with
/// [`format_group_chunk`].
pub fn split_message(text: &str, chunk_budget: usize) -> Vec<String> {
    assert!(chunk_budget > 0, "chunk budget must be positive");
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= chunk_budget {
            chunks.push(rest.to_string());
            break;
        }
        let mut cut = chunk_budget;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

/// Reassemble chunk bodies in index order.
pub fn reassemble(chunks: &[GroupChunk]) -> Option<String> {
    if chunks.is_empty() {
        return None;
    }
    let total = chunks[0].total;
    if chunks.len() != total as usize {
        return None;
    }
    let mut sorted: Vec<&GroupChunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.index);
    for (i, chunk) in sorted.iter().enumerate() {
        if chunk.index != (i as u32) + 1 || chunk.total != total {
            return None;
        }
    }
    Some(sorted.into_iter().map(|c| c.body.as_str()).collect())
}

// ── Reassembly buffer ─────────────────────────────────────────────────────────

struct Bucket {
    chunks: Vec<GroupChunk>,
    first_seen: Instant,
}

/// Per-`(sender, round)` chunk collector.
#[derive(Default)]
pub struct GroupBuffer {
    buckets: Mutex<HashMap<(String, u64), Bucket>>,
}

impl GroupBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one chunk.  Returns the reassembled message when and only when
    /// this chunk completed its group.
    pub fn add(&self, sender: &str, round: u64, chunk: GroupChunk) -> Option<String> {
        let key = (sender.to_string(), round);
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
            chunks: Vec::new(),
            first_seen: Instant::now(),
        });
        // Same index twice (duplicate delivery inside the dedup window's
        // blind spot): keep the first.
        if bucket.chunks.iter().any(|c| c.index == chunk.index) {
            return None;
        }
        bucket.chunks.push(chunk);
        let assembled = reassemble(&bucket.chunks);
        if assembled.is_some() {
            buckets.remove(&key);
        }
        assembled
    }

    /// Drop incomplete buckets older than the TTL.  Returns how many were
    /// discarded.
    pub fn expire(&self) -> usize {
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, b| b.first_seen.elapsed() < BUCKET_TTL);
        before - buckets.len()
    }

    pub fn pending(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    pub fn contains(&self, sender: &str, round: u64) -> bool {
        self.buckets
            .lock()
            .unwrap()
            .contains_key(&(sender.to_string(), round))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
