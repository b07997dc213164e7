// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The AlgoChat bridge — ingress pipeline, conversation routing, and egress.
//!
//! # Ingress
//!
//! ```text
//! sync batch ─► drop sent ─► drop own-wallet senders ─► tx-id dedup
//!            ─► [GRP:i/N]? ──yes──► reassembly buffer ──complete──┐
//!            │                                                    │
//!            └──no────────────────────────────────────────────────┴─►
//!     handle_incoming_message: guard ► device envelope ► approval reply
//!     ► remote-agent drop ► owner gate ► credits ► command ► route to agent
//! ```
//!
//! # Egress
//!
//! `send_response` pre-checks the daily fee budget, prefers the PSK channel
//! for PSK contacts (≤ 800-byte chunks, ≥ 4.5 s apart so rounds stay
//! ordered), otherwise attempts one atomic `[GRP:i/N]` group and falls back
//! to a truncated single transaction.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use quorum_config::AlgoChatConfig;
use quorum_core::approvals::ApprovalDecision;
use quorum_core::process::{ProcessManager, StartOptions};
use quorum_core::subscription::{ChainFeed, ChainFeedEvent, SubscriptionManager};
use quorum_core::ProcessEvent;
use quorum_db::sessions::NewSession;
use quorum_db::{SessionSource, Store};
use quorum_dedup::DedupService;

use crate::envelope;
use crate::group::{self, GroupBuffer};
use crate::transport::{
    ChainTransport, Direction, IncomingMessage, OutgoingChunk, PskTransport, SyncHandle,
};

/// Bounded set of processed transaction ids.
const TXID_CACHE_SIZE: usize = 500;
/// Agent wallet cache refresh interval.
const WALLET_CACHE_TTL: Duration = Duration::from_secs(60);
/// Recipient public key cache TTL.
const PUBKEY_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Fast-poll cadence while approvals are outstanding.
const FAST_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// PSK chunk ceiling (bytes).
const PSK_CHUNK_BYTES: usize = 800;
/// Inter-chunk settle delay on the PSK channel.
const PSK_CHUNK_DELAY: Duration = Duration::from_millis(4_500);
/// Discovery cursor starts this many rounds back on the first poll.
const DISCOVERY_LOOKBACK: u64 = 750;

pub struct AlgoChatBridge {
    pub(crate) config: AlgoChatConfig,
    pub(crate) store: Arc<Store>,
    pub(crate) processes: Arc<ProcessManager>,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    pub(crate) dedup: Arc<DedupService>,
    pub(crate) chain: Arc<dyn ChainTransport>,
    pub(crate) psk: Arc<dyn PskTransport>,
    sync: Mutex<Option<Arc<dyn SyncHandle>>>,
    pub(crate) default_agent_id: Mutex<Option<String>>,
    processed_txids: Mutex<LruCache<String, ()>>,
    groups: GroupBuffer,
    group_amounts: Mutex<HashMap<(String, u64), u64>>,
    wallet_cache: Mutex<(Option<Instant>, HashSet<String>)>,
    pubkey_cache: Mutex<HashMap<String, (Instant, String)>>,
    remote_agents: Mutex<HashSet<String>>,
    device_names: Mutex<HashMap<String, String>>,
    fast_poll_running: AtomicBool,
    discovery_cursor: Mutex<Option<u64>>,
    events_tx: tokio::sync::broadcast::Sender<serde_json::Value>,
    pub(crate) councils: Mutex<Option<Arc<quorum_council::CouncilEngine>>>,
    pub(crate) work_task_cap: Mutex<u32>,
    self_ref: std::sync::Weak<Self>,
}

impl AlgoChatBridge {
    pub fn new(
        config: AlgoChatConfig,
        store: Arc<Store>,
        processes: Arc<ProcessManager>,
        subscriptions: Arc<SubscriptionManager>,
        dedup: Arc<DedupService>,
        chain: Arc<dyn ChainTransport>,
        psk: Arc<dyn PskTransport>,
    ) -> Arc<Self> {
        let (events_tx, _) = tokio::sync::broadcast::channel(256);
        let default_agent_id = config.default_agent_id.clone();
        Arc::new_cyclic(|me| Self {
            config,
            store,
            processes,
            subscriptions,
            dedup,
            chain,
            psk,
            sync: Mutex::new(None),
            default_agent_id: Mutex::new(default_agent_id),
            processed_txids: Mutex::new(LruCache::new(
                NonZeroUsize::new(TXID_CACHE_SIZE).expect("non-zero"),
            )),
            groups: GroupBuffer::new(),
            group_amounts: Mutex::new(HashMap::new()),
            wallet_cache: Mutex::new((None, HashSet::new())),
            pubkey_cache: Mutex::new(HashMap::new()),
            remote_agents: Mutex::new(HashSet::new()),
            device_names: Mutex::new(HashMap::new()),
            fast_poll_running: AtomicBool::new(false),
            discovery_cursor: Mutex::new(None),
            events_tx,
            councils: Mutex::new(None),
            work_task_cap: Mutex::new(100),
            self_ref: me.clone(),
        })
    }

    pub(crate) fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("bridge alive")
    }

    /// Inject the council engine (used by the `/council` command).
    pub fn set_council_engine(&self, engine: Arc<quorum_council::CouncilEngine>) {
        *self.councils.lock().unwrap() = Some(engine);
    }

    /// Daily `/work` task ceiling (WORK_TASK_MAX_PER_DAY).
    pub fn set_work_task_cap(&self, cap: u32) {
        *self.work_task_cap.lock().unwrap() = cap;
    }

    /// WS `algochat` topic feed.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<serde_json::Value> {
        self.events_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: serde_json::Value) {
        let _ = self.events_tx.send(event);
    }

    /// Register the sync manager handle used for fast-polling.
    pub fn set_sync_handle(&self, sync: Arc<dyn SyncHandle>) {
        *self.sync.lock().unwrap() = Some(sync);
    }

    /// Addresses the agent-to-agent channel handles elsewhere.
    pub fn set_remote_agents(&self, addresses: HashSet<String>) {
        *self.remote_agents.lock().unwrap() = addresses;
    }

    /// Spawn the long-lived helper tasks (approval forwarding, discovery
    /// polling, group-buffer expiry).  Returns the handles for shutdown.
    pub fn start_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        // Approval requests from algochat sessions go to the participant.
        let bridge = self.arc();
        handles.push(tokio::spawn(async move {
            bridge.run_approval_forwarder().await;
        }));

        // Discovery polling for unmatched PSK contacts.
        let bridge = self.arc();
        handles.push(tokio::spawn(async move {
            let interval = Duration::from_secs(bridge.config.sync_interval_secs.max(1));
            loop {
                tokio::time::sleep(interval).await;
                bridge.discovery_poll().await;
            }
        }));

        // Expire incomplete group buckets.
        let bridge = self.arc();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                let dropped = bridge.groups.expire();
                if dropped > 0 {
                    debug!(dropped, "expired incomplete group buckets");
                }
                bridge
                    .group_amounts
                    .lock()
                    .unwrap()
                    .retain(|(sender, round), _| bridge.groups.contains(sender, *round));
            }
        }));

        handles
    }

    // ── Ingress pipeline ──────────────────────────────────────────────────────

    /// Process one batch from the sync manager.
    pub async fn handle_sync_batch(&self, batch: Vec<IncomingMessage>) {
        let own_wallets = self.agent_wallets();
        for message in batch {
            if message.direction == Direction::Sent {
                continue;
            }
            if own_wallets.contains(&message.sender) {
                continue;
            }
            {
                let mut seen = self.processed_txids.lock().unwrap();
                if seen.contains(&message.tx_id) {
                    continue;
                }
                seen.put(message.tx_id.clone(), ());
            }
            // The persisted namespace catches replays across restarts.
            if self.dedup.is_duplicate("algochat-tx", &message.tx_id) {
                continue;
            }

            match group::parse_group_prefix(&message.content) {
                Some(chunk) => {
                    {
                        let mut amounts = self.group_amounts.lock().unwrap();
                        let entry = amounts
                            .entry((message.sender.clone(), message.round))
                            .or_insert(0);
                        *entry = (*entry).max(message.amount_micro);
                    }
                    if let Some(assembled) =
                        self.groups.add(&message.sender, message.round, chunk)
                    {
                        let amount = self
                            .group_amounts
                            .lock()
                            .unwrap()
                            .remove(&(message.sender.clone(), message.round))
                            .unwrap_or(0);
                        self.handle_incoming_message(
                            &message.sender,
                            &assembled,
                            message.round,
                            amount,
                        )
                        .await;
                    }
                }
                None => {
                    self.handle_incoming_message(
                        &message.sender,
                        &message.content,
                        message.round,
                        message.amount_micro,
                    )
                    .await;
                }
            }
        }
    }

    /// One fully reassembled participant message.
    pub async fn handle_incoming_message(
        &self,
        participant: &str,
        content: &str,
        round: u64,
        amount_micro: u64,
    ) {
        // Reassembly guard: a chunk prefix here means the pipeline above was
        // bypassed.
        if group::parse_group_prefix(content).is_some() {
            error!(participant, "raw group chunk reached message handling; dropped");
            return;
        }

        // Multi-device envelope {m, d}.
        let mut text = content.to_string();
        if let Ok(envelope) = serde_json::from_str::<serde_json::Value>(content) {
            if let Some(m) = envelope.get("m").and_then(|v| v.as_str()) {
                text = m.to_string();
                if let Some(d) = envelope.get("d").and_then(|v| v.as_str()) {
                    self.device_names
                        .lock()
                        .unwrap()
                        .insert(participant.to_string(), d.to_string());
                }
            }
        }

        // Approval replies resolve a pending request and stop there.
        if let Some((short_id, decision)) = parse_approval_response(&text) {
            match self
                .processes
                .resolve_approval(&short_id, decision, Some(participant))
            {
                Ok(()) => {
                    info!(participant, short_id, "approval resolved from chain");
                    self.record_message(participant, &text, round, amount_micro);
                }
                Err(e) => {
                    warn!(participant, short_id, "approval reply rejected: {e}");
                    self.send_response(
                        participant,
                        &format!("Could not apply approval {short_id}: {e}"),
                        None,
                        0,
                    )
                    .await;
                }
            }
            return;
        }

        // Remote agents converse on the agent-to-agent channel.
        if self.remote_agents.lock().unwrap().contains(participant) {
            debug!(participant, "dropping remote-agent message");
            return;
        }

        // Owner gate: PSK contacts are authorised by key possession, owners
        // by allowlist; everyone else is turned away.
        let is_owner = self.is_owner(participant);
        let is_psk = self
            .store
            .psk_contact_for_address(participant, &self.network())
            .ok()
            .flatten()
            .is_some();
        if !is_owner && !is_psk {
            warn!(participant, "unauthorised sender");
            self.send_response(
                participant,
                "This address is not authorised to talk to the agents here.",
                None,
                0,
            )
            .await;
            return;
        }

        self.record_message(participant, &text, round, amount_micro);

        // Paid messages top up the sender's credit balance (owners bypass
        // all credit effects).
        if !is_owner {
            if let Err(e) = self.processes.credits().credit_payment(
                participant,
                amount_micro,
                self.config.min_fee_micro,
            ) {
                warn!(participant, "credit update failed: {e}");
            }
        }

        // Slash commands; unknown ones fall through to the agent as text.
        if text.starts_with('/') {
            match self.handle_command(participant, &text, is_owner).await {
                crate::commands::CommandOutcome::Handled(reply) => {
                    if let Some(reply) = reply {
                        self.send_response(participant, &reply, None, 0).await;
                    }
                    return;
                }
                crate::commands::CommandOutcome::Unhandled => {}
            }
        }

        // Credit pre-flight before any sub-process work (owners bypass).
        if !is_owner {
            if let Err(e) = self.processes.credits().can_start_session(participant) {
                self.send_response(
                    participant,
                    &format!("{e}. Attach a payment to top up."),
                    None,
                    0,
                )
                .await;
                return;
            }
        }

        self.route_to_agent(participant, &text, round).await;
    }

    /// Resolve or create the conversation and deliver the text to its agent
    /// session.
    async fn route_to_agent(&self, participant: &str, text: &str, round: u64) {
        let convo = self.store.get_conversation(participant).ok().flatten();
        let agent_id = match self.pick_agent(convo.as_ref().and_then(|c| c.agent_id.clone())) {
            Some(id) => id,
            None => {
                warn!(participant, "no algochat-capable agent available");
                self.send_response(
                    participant,
                    "No agent is available on this channel right now.",
                    None,
                    0,
                )
                .await;
                return;
            }
        };

        let prompt = match self.device_names.lock().unwrap().get(participant) {
            Some(device) => format!("[From: {device}] {text}"),
            None => text.to_string(),
        };

        // Reuse the bound session when it still exists; otherwise start a
        // fresh one (the conversation keeps its round high-water mark).
        let existing = convo
            .as_ref()
            .and_then(|c| c.session_id.clone())
            .and_then(|sid| self.store.get_session(&sid).ok());

        let session_id = match existing {
            Some(session) if self.processes.is_running(&session.id) => {
                self.attach_feed(&session.id, participant);
                if !self.processes.send_message(&session.id, &prompt).await {
                    warn!(session_id = %session.id, "stdin write failed");
                }
                session.id
            }
            Some(session) => {
                self.attach_feed(&session.id, participant);
                if let Err(e) = self.processes.resume_process(&session, &prompt).await {
                    error!(session_id = %session.id, "resume failed: {e}");
                    self.send_response(participant, "[Error: could not resume session]", None, 0)
                        .await;
                    return;
                }
                session.id
            }
            None => {
                let session_id = Uuid::new_v4().to_string();
                let session = match self.store.create_session(NewSession {
                    id: session_id.clone(),
                    agent_id: agent_id.clone(),
                    name: format!("chat with {}", short_addr(participant)),
                    source: Some(SessionSource::Algochat),
                    initial_prompt: prompt.clone(),
                    ..NewSession::default()
                }) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(participant, "session create failed: {e}");
                        return;
                    }
                };
                self.attach_feed(&session_id, participant);
                if let Err(e) = self
                    .processes
                    .start_process(
                        &session,
                        &prompt,
                        StartOptions {
                            origin_address: Some(participant.to_string()),
                            ..StartOptions::default()
                        },
                    )
                    .await
                {
                    error!(participant, "session start failed: {e}");
                    self.send_response(participant, "[Error: could not start session]", None, 0)
                        .await;
                    return;
                }
                session_id
            }
        };

        if let Err(e) =
            self.store
                .upsert_conversation(participant, Some(&agent_id), Some(&session_id), round)
        {
            warn!(participant, "conversation update failed: {e}");
        }
    }

    fn attach_feed(&self, session_id: &str, participant: &str) {
        let feed: Arc<dyn ChainFeed> = self.arc() as Arc<dyn ChainFeed>;
        self.subscriptions.attach_chain(session_id, participant, feed);
    }

    /// Agent selection order: conversation binding, configured default, the
    /// first auto-routable agent, the first algochat-enabled agent.
    pub(crate) fn pick_agent(&self, bound: Option<String>) -> Option<String> {
        if let Some(id) = bound {
            return Some(id);
        }
        if let Some(id) = self.default_agent_id.lock().unwrap().clone() {
            return Some(id);
        }
        let agents = self.store.list_algochat_agents().ok()?;
        agents
            .iter()
            .find(|a| a.algochat_auto)
            .or_else(|| agents.first())
            .map(|a| a.id.clone())
    }

    pub(crate) fn is_owner(&self, address: &str) -> bool {
        if self.config.owner_addresses.iter().any(|a| a == address) {
            return true;
        }
        self.store.allowlist_contains(address).unwrap_or(false)
    }

    fn network(&self) -> String {
        "mainnet".to_string()
    }

    fn agent_wallets(&self) -> HashSet<String> {
        let mut cache = self.wallet_cache.lock().unwrap();
        let stale = cache
            .0
            .map(|at| at.elapsed() >= WALLET_CACHE_TTL)
            .unwrap_or(true);
        if stale {
            if let Ok(wallets) = self.store.agent_wallet_addresses() {
                cache.1 = wallets.into_iter().collect();
                cache.0 = Some(Instant::now());
            }
        }
        cache.1.clone()
    }

    fn record_message(&self, participant: &str, content: &str, round: u64, amount: u64) {
        let conn_id = Uuid::new_v4().to_string();
        let _ = self.store.record_algochat_message(
            &conn_id,
            None,
            participant,
            "main",
            "received",
            content,
            round,
            amount,
        );
        self.emit(json!({
            "type": "algochat_message",
            "direction": "received",
            "participant": participant,
            "content": content,
            "round": round,
        }));
    }

    // ── Egress ────────────────────────────────────────────────────────────────

    /// Deliver a response to a participant, preferring the PSK channel and
    /// falling back from group send to a truncated single transaction.
    pub async fn send_response(
        &self,
        participant: &str,
        content: &str,
        session_id: Option<&str>,
        amount_micro: u64,
    ) {
        // Daily fee budget gate: over-limit responses are dead-lettered.
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let spent = self.store.algo_spend_for_day(&today).unwrap_or(0);
        if spent as u64 >= self.config.daily_fee_budget_micro {
            error!(
                participant,
                session_id = session_id.unwrap_or("-"),
                spent,
                budget = self.config.daily_fee_budget_micro,
                preview = %preview(content),
                "daily fee budget exhausted; dead-lettering response"
            );
            return;
        }

        // PSK contacts get the PSK channel.
        if let Ok(Some(contact)) = self
            .store
            .psk_contact_for_address(participant, &self.network())
        {
            let chunks = split_psk_chunks(content, PSK_CHUNK_BYTES);
            let total = chunks.len();
            for (i, chunk) in chunks.iter().enumerate() {
                if let Err(e) = self.psk.send_chunk(&contact.id, chunk).await {
                    error!(
                        participant,
                        contact = %contact.id,
                        chunk = i + 1,
                        total,
                        preview = %preview(content),
                        "psk send failed; dead-lettering remainder: {e}"
                    );
                    return;
                }
                if i + 1 < total {
                    // Distinct rounds keep natural order on the receiver.
                    tokio::time::sleep(PSK_CHUNK_DELAY).await;
                }
            }
            self.emit(json!({
                "type": "algochat_message",
                "direction": "sent",
                "participant": participant,
                "chunks": total,
                "via": "psk",
            }));
            return;
        }

        // Per-agent wallet when the conversation's agent has one.
        let from_wallet = self
            .store
            .get_conversation(participant)
            .ok()
            .flatten()
            .and_then(|c| c.agent_id)
            .and_then(|aid| self.store.get_agent(&aid).ok())
            .and_then(|a| a.wallet_address);

        let pubkey = match self.lookup_pubkey_cached(participant).await {
            Ok(pk) => pk,
            Err(e) => {
                error!(participant, "pubkey resolution failed; dead-lettering: {e}");
                return;
            }
        };

        let receipt = match self
            .try_group_send(from_wallet.as_deref(), participant, &pubkey, content, amount_micro)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(participant, "group send failed, falling back to truncation: {e}");
                let truncated =
                    truncate_to_bytes(content, envelope::TRUNCATE_FALLBACK_BYTES);
                match self
                    .chain
                    .send_message(
                        from_wallet.as_deref(),
                        participant,
                        &pubkey,
                        &truncated,
                        amount_micro.max(self.chain.min_fee_micro()),
                    )
                    .await
                {
                    Ok(receipt) => receipt,
                    Err(e) => {
                        error!(
                            participant,
                            session_id = session_id.unwrap_or("-"),
                            preview = %preview(content),
                            "final send failed; dead-lettering: {e}"
                        );
                        return;
                    }
                }
            }
        };

        let _ = self.store.record_algo_spend(
            &today,
            receipt.fee_micro as i64,
            session_id,
            participant,
        );
        if let Some(sid) = session_id {
            let _ = self
                .store
                .add_session_algo_spent(sid, receipt.fee_micro as i64);
        }
        let _ = self.store.record_algochat_message(
            &Uuid::new_v4().to_string(),
            receipt.tx_ids.first().map(String::as_str),
            "main",
            participant,
            "sent",
            content,
            receipt.round,
            amount_micro,
        );
        self.emit(json!({
            "type": "algochat_message",
            "direction": "sent",
            "participant": participant,
            "round": receipt.round,
            "txns": receipt.tx_ids.len(),
        }));
    }

    /// Split into envelope-sized chunks and submit as one atomic group; a
    /// single chunk goes out as a plain transaction.
    async fn try_group_send(
        &self,
        from_wallet: Option<&str>,
        to: &str,
        pubkey: &str,
        content: &str,
        amount_micro: u64,
    ) -> anyhow::Result<crate::transport::SendReceipt> {
        let budget = envelope::group_chunk_budget(self.chain.max_payload());
        let bodies = group::split_message(content, budget);
        if bodies.len() == 1 {
            return self
                .chain
                .send_message(
                    from_wallet,
                    to,
                    pubkey,
                    content,
                    amount_micro.max(self.chain.min_fee_micro()),
                )
                .await;
        }
        let total = bodies.len() as u32;
        let min_fee = self.chain.min_fee_micro();
        let chunks: Vec<OutgoingChunk> = bodies
            .iter()
            .enumerate()
            .map(|(i, body)| OutgoingChunk {
                content: group::format_group_chunk(i as u32 + 1, total, body),
                amount_micro: if i == 0 {
                    amount_micro.max(min_fee)
                } else {
                    min_fee
                },
            })
            .collect();
        self.chain.send_group(from_wallet, to, pubkey, &chunks).await
    }

    async fn lookup_pubkey_cached(&self, address: &str) -> anyhow::Result<String> {
        {
            let cache = self.pubkey_cache.lock().unwrap();
            if let Some((at, pk)) = cache.get(address) {
                if at.elapsed() < PUBKEY_CACHE_TTL {
                    return Ok(pk.clone());
                }
            }
        }
        let pk = self.chain.lookup_pubkey(address).await?;
        self.pubkey_cache
            .lock()
            .unwrap()
            .insert(address.to_string(), (Instant::now(), pk.clone()));
        Ok(pk)
    }

    // ── Approval forwarding & fast-poll ───────────────────────────────────────

    async fn run_approval_forwarder(&self) {
        let mut sub = self.processes.subscribe_all();
        while let Some(ev) = sub.rx.recv().await {
            let ProcessEvent::ApprovalRequest { short_id, tool, .. } = &*ev.event else {
                continue;
            };
            // Only sessions bound to an on-chain conversation go out here;
            // local sessions surface approvals over the WS.
            let Ok(Some(convo)) = self.store.conversation_for_session(&ev.session_id) else {
                continue;
            };
            let text = format!(
                "Approval needed [{short_id}]: tool `{tool}`. \
                 Reply \"{short_id} allow\" or \"{short_id} deny\".",
            );
            self.send_response(&convo.participant_addr, &text, Some(&ev.session_id), 0)
                .await;
            self.ensure_fast_poll();
        }
    }

    /// While approvals are outstanding, nudge the sync manager every 5 s so
    /// the owner's reply is picked up promptly.
    pub(crate) fn ensure_fast_poll(&self) {
        if self.fast_poll_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let bridge = self.arc();
        tokio::spawn(async move {
            loop {
                if bridge.processes.approvals().outstanding() == 0 {
                    break;
                }
                if let Some(sync) = bridge.sync.lock().unwrap().clone() {
                    sync.request_sync();
                }
                tokio::time::sleep(FAST_POLL_INTERVAL).await;
            }
            bridge.fast_poll_running.store(false, Ordering::SeqCst);
            debug!("fast-poll stopped; no approvals outstanding");
        });
    }

    // ── PSK discovery ─────────────────────────────────────────────────────────

    /// Look for payment notes from unknown senders that decrypt with an
    /// unmatched contact's key, then bind the contact to that address.
    pub async fn discovery_poll(&self) {
        let unmatched = match self.store.unmatched_psk_contacts() {
            Ok(contacts) if !contacts.is_empty() => contacts,
            _ => return,
        };

        let known_cursor = *self.discovery_cursor.lock().unwrap();
        let cursor = match known_cursor {
            Some(c) => c,
            None => {
                // First poll: look a bounded window back.
                let current = match self.chain.current_round().await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("discovery: current round unavailable: {e}");
                        return;
                    }
                };
                let start = current.saturating_sub(DISCOVERY_LOOKBACK);
                *self.discovery_cursor.lock().unwrap() = Some(start);
                start
            }
        };

        let payments = match self.chain.payments_to_main_since(cursor).await {
            Ok(p) => p,
            Err(e) => {
                warn!("discovery poll failed: {e}");
                return;
            }
        };
        let mut max_round = cursor;

        // Newest message per sender wins; older traffic is never replayed.
        let mut latest_per_sender: HashMap<String, IncomingMessage> = HashMap::new();
        for payment in payments {
            max_round = max_round.max(payment.round);
            let entry = latest_per_sender
                .entry(payment.sender.clone())
                .or_insert_with(|| payment.clone());
            if payment.round >= entry.round {
                *entry = payment;
            }
        }

        for (sender, message) in latest_per_sender {
            // Known senders are handled by the regular sync path.
            if self
                .store
                .psk_contact_for_address(&sender, &self.network())
                .ok()
                .flatten()
                .is_some()
            {
                continue;
            }
            for contact in &unmatched {
                let Some(plaintext) = self.psk.try_decrypt(contact, &message.content) else {
                    continue;
                };
                info!(contact = %contact.id, sender = %sender, "psk contact discovered");
                if let Err(e) = self
                    .store
                    .claim_mobile_address(&contact.id, &contact.network, &sender)
                {
                    warn!(contact = %contact.id, "address claim failed: {e}");
                    break;
                }
                self.psk.stop_address(&sender).await;
                if let Err(e) = self.psk.rebind(&contact.id, &sender).await {
                    warn!(contact = %contact.id, "psk rebind failed: {e}");
                }
                // Only the most recent message is delivered; history stays
                // history.
                self.handle_incoming_message(
                    &sender,
                    &plaintext,
                    message.round,
                    message.amount_micro,
                )
                .await;
                break;
            }
        }

        *self.discovery_cursor.lock().unwrap() = Some(max_round);
    }
}

// ── ChainFeed: consumer A output lands on the chain ───────────────────────────

#[async_trait::async_trait]
impl ChainFeed for AlgoChatBridge {
    async fn deliver(&self, session_id: &str, participant: &str, event: ChainFeedEvent) {
        match event {
            ChainFeedEvent::Status(text) => {
                self.send_response(participant, &text, Some(session_id), 0)
                    .await;
            }
            ChainFeedEvent::Final(text) => {
                let text = if text.is_empty() {
                    "(session ended without a response)".to_string()
                } else {
                    text
                };
                self.send_response(participant, &text, Some(session_id), 0)
                    .await;
            }
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// `"<short id> allow|deny"` replies from the chain.
pub(crate) fn parse_approval_response(text: &str) -> Option<(String, ApprovalDecision)> {
    let mut parts = text.split_whitespace();
    let id = parts.next()?;
    let verb = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if id.len() != 4 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let decision = match verb.to_ascii_lowercase().as_str() {
        "allow" | "approve" | "yes" | "ok" => ApprovalDecision::Approve,
        "deny" | "reject" | "no" => ApprovalDecision::Deny,
        _ => return None,
    };
    Some((id.to_ascii_lowercase(), decision))
}

/// Split on newline boundaries where possible, hard-cutting only when one
/// line alone exceeds the budget.
pub(crate) fn split_psk_chunks(content: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in content.split_inclusive('\n') {
        if current.len() + line.len() > budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > budget {
            for piece in group::split_message(line, budget) {
                if piece.len() == budget {
                    chunks.push(piece);
                } else {
                    current = piece;
                }
            }
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

/// Byte-budget truncation with a `...` marker, on a char boundary.
pub(crate) fn truncate_to_bytes(content: &str, budget: usize) -> String {
    if content.len() <= budget {
        return content.to_string();
    }
    let mut cut = budget.saturating_sub(3);
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &content[..cut])
}

fn preview(content: &str) -> String {
    let mut p: String = content.chars().take(80).collect();
    if content.chars().count() > 80 {
        p.push('…');
    }
    p
}

fn short_addr(address: &str) -> String {
    if address.len() > 8 {
        format!("{}…", &address[..8])
    } else {
        address.to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_response_accepts_both_orders_of_case() {
        let (id, decision) = parse_approval_response("AB12 Allow").unwrap();
        assert_eq!(id, "ab12");
        assert_eq!(decision, ApprovalDecision::Approve);
        assert_eq!(
            parse_approval_response("ab12 deny").unwrap().1,
            ApprovalDecision::Deny
        );
        assert!(parse_approval_response("hello there").is_none());
        assert!(parse_approval_response("ab12 allow extra").is_none());
        assert!(parse_approval_response("zzzz allow").is_none());
    }

    #[test]
    fn psk_chunks_prefer_newline_boundaries() {
        let text = "line one\nline two\nline three\n";
        let chunks = split_psk_chunks(text, 12);
        assert_eq!(chunks, vec!["line one\n", "line two\n", "line three\n"]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn psk_chunks_hard_cut_overlong_lines() {
        let text = "x".repeat(25);
        let chunks = split_psk_chunks(&text, 10);
        assert!(chunks.iter().all(|c| c.len() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn truncation_appends_marker_within_budget() {
        let text = "a".repeat(900);
        let out = truncate_to_bytes(&text, 850);
        assert!(out.len() <= 850);
        assert!(out.ends_with("..."));
        assert_eq!(truncate_to_bytes("short", 850), "short");
    }
}
