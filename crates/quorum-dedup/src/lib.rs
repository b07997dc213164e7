// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Dedup service — the shared "have I seen this key?" primitive.
//!
//! Every ingress path (on-chain transactions, webhooks, Slack retries) is
//! at-least-once; this service degrades them to exactly-once within a
//! configured window.  Each namespace is a bounded LRU with per-entry TTL:
//!
//! - `is_duplicate` is an atomic check-and-set: true iff the key was already
//!   present and unexpired, otherwise the key is recorded.
//! - Accessing an unexpired key promotes it to MRU.
//! - Inserting at capacity evicts the LRU entry.
//!
//! Two background loops run per service: a 60 s prune walk that removes
//! expired entries, and (when a database handle is present) a 30 s flush that
//! replaces each persisted namespace's row set wholesale.  On startup,
//! persisted namespaces are restored from rows whose expiry is in the future.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use serde::Serialize;
use tracing::{debug, warn};

use quorum_db::Store;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Per-namespace tuning.
#[derive(Debug, Clone, Copy)]
pub struct DedupOptions {
    pub max_size: usize,
    pub ttl_ms: u64,
    pub persist: bool,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl_ms: 5 * 60 * 1000,
            persist: false,
        }
    }
}

/// Point-in-time counters for one namespace.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceMetrics {
    pub namespace: String,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Namespace {
    entries: LruCache<String, u64>,
    opts: DedupOptions,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Namespace {
    fn new(opts: DedupOptions) -> Self {
        let cap = NonZeroUsize::new(opts.max_size.max(1)).expect("max(1) is non-zero");
        Self {
            entries: LruCache::new(cap),
            opts,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }
}

pub struct DedupService {
    namespaces: Mutex<HashMap<String, Namespace>>,
    store: Option<Arc<Store>>,
    self_ref: std::sync::Weak<Self>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl DedupService {
    pub fn new(store: Option<Arc<Store>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            namespaces: Mutex::new(HashMap::new()),
            store,
            self_ref: me.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("dedup service alive")
    }

    /// Register (or re-tune) a namespace.  Persisted namespaces are restored
    /// from the database immediately.
    pub fn register(&self, namespace: &str, opts: DedupOptions) {
        let restored = if opts.persist {
            self.store.as_ref().and_then(|store| {
                match store.restore_dedup_namespace(namespace, now_ms() as i64) {
                    Ok(entries) => Some(entries),
                    Err(e) => {
                        warn!(namespace, "dedup restore failed: {e}");
                        None
                    }
                }
            })
        } else {
            None
        };

        let mut map = self.namespaces.lock().unwrap();
        let ns = map
            .entry(namespace.to_string())
            .or_insert_with(|| Namespace::new(opts));
        ns.opts = opts;
        if let Some(entries) = restored {
            debug!(namespace, count = entries.len(), "dedup namespace restored");
            for (key, expires_at) in entries {
                ns.entries.put(key, expires_at as u64);
            }
        }
    }

    /// Atomic check-and-set.  Returns true iff the key was already present
    /// and unexpired; otherwise records it (evicting the LRU entry at
    /// capacity) and returns false.
    pub fn is_duplicate(&self, namespace: &str, key: &str) -> bool {
        let mut map = self.namespaces.lock().unwrap();
        let ns = map
            .entry(namespace.to_string())
            .or_insert_with(|| Namespace::new(DedupOptions::default()));

        let now = now_ms();
        match ns.entries.get(key) {
            Some(&expires_at) if expires_at > now => {
                ns.hits += 1;
                return true;
            }
            Some(_) => {
                // Expired entry: membership is false, the slot is reused.
                ns.entries.pop(key);
            }
            None => {}
        }
        ns.misses += 1;
        if let Some((evicted_key, _)) = ns.entries.push(key.to_string(), now + ns.opts.ttl_ms) {
            if evicted_key != key {
                ns.evictions += 1;
            }
        }
        false
    }

    /// Probe without recording.
    pub fn has(&self, namespace: &str, key: &str) -> bool {
        let mut map = self.namespaces.lock().unwrap();
        let Some(ns) = map.get_mut(namespace) else {
            return false;
        };
        let now = now_ms();
        match ns.entries.get(key) {
            Some(&expires_at) if expires_at > now => {
                ns.hits += 1;
                true
            }
            Some(_) => {
                ns.entries.pop(key);
                ns.misses += 1;
                false
            }
            None => {
                ns.misses += 1;
                false
            }
        }
    }

    pub fn delete(&self, namespace: &str, key: &str) {
        let mut map = self.namespaces.lock().unwrap();
        if let Some(ns) = map.get_mut(namespace) {
            ns.entries.pop(key);
        }
    }

    pub fn clear(&self, namespace: &str) {
        let mut map = self.namespaces.lock().unwrap();
        if let Some(ns) = map.get_mut(namespace) {
            ns.entries.clear();
        }
    }

    pub fn metrics(&self) -> Vec<NamespaceMetrics> {
        let map = self.namespaces.lock().unwrap();
        let mut out: Vec<_> = map
            .iter()
            .map(|(name, ns)| NamespaceMetrics {
                namespace: name.clone(),
                size: ns.entries.len(),
                hits: ns.hits,
                misses: ns.misses,
                evictions: ns.evictions,
            })
            .collect();
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        out
    }

    /// Remove expired entries from every namespace.  Called by the prune loop
    /// and directly from tests.
    pub fn prune_expired(&self) {
        let now = now_ms();
        let mut map = self.namespaces.lock().unwrap();
        for ns in map.values_mut() {
            let expired: Vec<String> = ns
                .entries
                .iter()
                .filter(|(_, &expires_at)| expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                ns.entries.pop(&key);
                ns.evictions += 1;
            }
        }
    }

    /// Write every persisted namespace's unexpired key set to the database.
    pub fn flush(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let now = now_ms();
        // Snapshot under the lock, write outside it: the flush tolerates the
        // in-memory state changing beneath it.
        let snapshots: Vec<(String, Vec<(String, i64)>)> = {
            let map = self.namespaces.lock().unwrap();
            map.iter()
                .filter(|(_, ns)| ns.opts.persist)
                .map(|(name, ns)| {
                    let entries = ns
                        .entries
                        .iter()
                        .filter(|(_, &expires_at)| expires_at > now)
                        .map(|(k, &v)| (k.clone(), v as i64))
                        .collect();
                    (name.clone(), entries)
                })
                .collect()
        };
        for (namespace, entries) in snapshots {
            if let Err(e) = store.flush_dedup_namespace(&namespace, &entries) {
                warn!(namespace, "dedup flush failed: {e}");
            }
        }
    }

    /// Spawn the prune and flush loops.  Returns handles so the caller can
    /// abort them on shutdown.
    pub fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let svc = self.arc();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                svc.prune_expired();
            }
        }));

        if self.store.is_some() {
            let svc = self.arc();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    svc.flush();
                }
            }));
        }

        handles
    }
}

// ── Process-wide instance ─────────────────────────────────────────────────────

static GLOBAL: Mutex<Option<Arc<DedupService>>> = Mutex::new(None);

/// Install the process-wide instance.  Call once at startup.
pub fn init_global(store: Option<Arc<Store>>) -> Arc<DedupService> {
    let svc = DedupService::new(store);
    *GLOBAL.lock().unwrap() = Some(Arc::clone(&svc));
    svc
}

/// The process-wide instance.  Panics if [`init_global`] has not run — every
/// caller is downstream of server assembly, so this is a programming error,
/// not a runtime condition.
pub fn global() -> Arc<DedupService> {
    GLOBAL
        .lock()
        .unwrap()
        .as_ref()
        .cloned()
        .expect("dedup service not initialised")
}

/// Drop the process-wide instance (tests).
pub fn reset_global() {
    *GLOBAL.lock().unwrap() = None;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
