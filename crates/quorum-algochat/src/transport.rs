// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Transport-facing interfaces.
//!
//! The chain client (envelope crypto, signing, indexer pagination) and the
//! PSK ratchet are external collaborators; the bridge talks to them through
//! the traits below and is constructed with concrete implementations — no
//! lazy imports, no globals.

use async_trait::async_trait;

use quorum_db::PskContactRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One decrypted message (or raw payment note) from the transport layer.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub tx_id: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub round: u64,
    pub amount_micro: u64,
    pub direction: Direction,
}

/// One outgoing chunk of an atomic group.
#[derive(Debug, Clone)]
pub struct OutgoingChunk {
    pub content: String,
    pub amount_micro: u64,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub tx_ids: Vec<String>,
    pub round: u64,
    pub fee_micro: u64,
}

#[async_trait]
pub trait ChainTransport: Send + Sync {
    /// Ciphertext capacity of one envelope.
    fn max_payload(&self) -> usize;
    /// Minimum per-transaction fee/amount in microunits.
    fn min_fee_micro(&self) -> u64;

    async fn lookup_pubkey(&self, address: &str) -> anyhow::Result<String>;

    /// Send one standard transaction carrying an encrypted note.
    /// `from_wallet = None` uses the main chat account.
    async fn send_message(
        &self,
        from_wallet: Option<&str>,
        to: &str,
        to_pubkey: &str,
        content: &str,
        amount_micro: u64,
    ) -> anyhow::Result<SendReceipt>;

    /// Sign and submit all chunks as one atomic group sharing a round.
    async fn send_group(
        &self,
        from_wallet: Option<&str>,
        to: &str,
        to_pubkey: &str,
        chunks: &[OutgoingChunk],
    ) -> anyhow::Result<SendReceipt>;

    async fn current_round(&self) -> anyhow::Result<u64>;

    /// Payment transactions to the main account since a round cursor
    /// (discovery polling).
    async fn payments_to_main_since(&self, round: u64)
        -> anyhow::Result<Vec<IncomingMessage>>;
}

/// The pre-shared-key channel (ratchet state lives behind it).
#[async_trait]
pub trait PskTransport: Send + Sync {
    /// Send one chunk to a contact over its PSK channel.
    async fn send_chunk(&self, contact_id: &str, content: &str) -> anyhow::Result<()>;

    /// Attempt to decrypt a payment note with a contact's key material.
    fn try_decrypt(&self, contact: &PskContactRow, note: &str) -> Option<String>;

    /// Stop any channel manager bound to this address (prior claimant).
    async fn stop_address(&self, address: &str);

    /// Start a manager for `contact_id` bound to the discovered address.
    async fn rebind(&self, contact_id: &str, address: &str) -> anyhow::Result<()>;
}

/// Handle to the external sync manager; the bridge never polls by itself,
/// it only asks for an immediate pass (fast-polling).
pub trait SyncHandle: Send + Sync {
    fn request_sync(&self);
}

// ── Unconfigured transport ────────────────────────────────────────────────────

/// Placeholder transport installed when no chain client library is wired in.
/// Every operation fails with a configuration hint; ingress simply never
/// produces batches.  Keeps the bridge constructible while the channel is
/// disabled.
pub struct UnconfiguredChain;

#[async_trait]
impl ChainTransport for UnconfiguredChain {
    fn max_payload(&self) -> usize {
        1000
    }

    fn min_fee_micro(&self) -> u64 {
        1_000
    }

    async fn lookup_pubkey(&self, _address: &str) -> anyhow::Result<String> {
        anyhow::bail!("algochat transport is not configured")
    }

    async fn send_message(
        &self,
        _from_wallet: Option<&str>,
        _to: &str,
        _to_pubkey: &str,
        _content: &str,
        _amount_micro: u64,
    ) -> anyhow::Result<SendReceipt> {
        anyhow::bail!("algochat transport is not configured")
    }

    async fn send_group(
        &self,
        _from_wallet: Option<&str>,
        _to: &str,
        _to_pubkey: &str,
        _chunks: &[OutgoingChunk],
    ) -> anyhow::Result<SendReceipt> {
        anyhow::bail!("algochat transport is not configured")
    }

    async fn current_round(&self) -> anyhow::Result<u64> {
        anyhow::bail!("algochat transport is not configured")
    }

    async fn payments_to_main_since(
        &self,
        _round: u64,
    ) -> anyhow::Result<Vec<IncomingMessage>> {
        Ok(Vec::new())
    }
}

/// Placeholder PSK channel matching [`UnconfiguredChain`].
pub struct UnconfiguredPsk;

#[async_trait]
impl PskTransport for UnconfiguredPsk {
    async fn send_chunk(&self, _contact_id: &str, _content: &str) -> anyhow::Result<()> {
        anyhow::bail!("psk channel is not configured")
    }

    fn try_decrypt(&self, _contact: &PskContactRow, _note: &str) -> Option<String> {
        None
    }

    async fn stop_address(&self, _address: &str) {}

    async fn rebind(&self, _contact_id: &str, _address: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

// ── Test transport ────────────────────────────────────────────────────────────

/// In-memory transport that records every send.  Public so downstream
/// crates can exercise the bridge without a chain.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum SentItem {
        Single {
            from_wallet: Option<String>,
            to: String,
            content: String,
            amount_micro: u64,
        },
        Group {
            from_wallet: Option<String>,
            to: String,
            chunks: Vec<OutgoingChunk>,
        },
    }

    pub struct MockChain {
        pub max_payload: usize,
        pub min_fee: u64,
        pub sent: Mutex<Vec<SentItem>>,
        pub fail_group_sends: AtomicBool,
        pub payments: Mutex<Vec<IncomingMessage>>,
        round: AtomicU64,
        next_tx: AtomicU64,
    }

    impl MockChain {
        pub fn new(max_payload: usize) -> Self {
            Self {
                max_payload,
                min_fee: 1_000,
                sent: Mutex::new(Vec::new()),
                fail_group_sends: AtomicBool::new(false),
                payments: Mutex::new(Vec::new()),
                round: AtomicU64::new(10_000),
                next_tx: AtomicU64::new(1),
            }
        }

        fn receipt(&self, n: usize) -> SendReceipt {
            let round = self.round.fetch_add(1, Ordering::SeqCst);
            let tx_ids = (0..n)
                .map(|_| format!("tx-{}", self.next_tx.fetch_add(1, Ordering::SeqCst)))
                .collect();
            SendReceipt {
                tx_ids,
                round,
                fee_micro: self.min_fee * n as u64,
            }
        }
    }

    #[async_trait]
    impl ChainTransport for MockChain {
        fn max_payload(&self) -> usize {
            self.max_payload
        }

        fn min_fee_micro(&self) -> u64 {
            self.min_fee
        }

        async fn lookup_pubkey(&self, address: &str) -> anyhow::Result<String> {
            Ok(format!("pk:{address}"))
        }

        async fn send_message(
            &self,
            from_wallet: Option<&str>,
            to: &str,
            _to_pubkey: &str,
            content: &str,
            amount_micro: u64,
        ) -> anyhow::Result<SendReceipt> {
            self.sent.lock().unwrap().push(SentItem::Single {
                from_wallet: from_wallet.map(str::to_string),
                to: to.to_string(),
                content: content.to_string(),
                amount_micro,
            });
            Ok(self.receipt(1))
        }

        async fn send_group(
            &self,
            from_wallet: Option<&str>,
            to: &str,
            _to_pubkey: &str,
            chunks: &[OutgoingChunk],
        ) -> anyhow::Result<SendReceipt> {
            if self.fail_group_sends.load(Ordering::SeqCst) {
                anyhow::bail!("group submit rejected");
            }
            self.sent.lock().unwrap().push(SentItem::Group {
                from_wallet: from_wallet.map(str::to_string),
                to: to.to_string(),
                chunks: chunks.to_vec(),
            });
            Ok(self.receipt(chunks.len()))
        }

        async fn current_round(&self) -> anyhow::Result<u64> {
            Ok(self.round.load(Ordering::SeqCst))
        }

        async fn payments_to_main_since(
            &self,
            round: u64,
        ) -> anyhow::Result<Vec<IncomingMessage>> {
            Ok(self
                .payments
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.round >= round)
                .cloned()
                .collect())
        }
    }

    /// PSK transport whose "encryption" is a reversible prefix, enough to
    /// exercise trial decryption and rebinding.
    #[derive(Default)]
    pub struct MockPsk {
        pub sent: Mutex<Vec<(String, String)>>,
        pub stopped: Mutex<Vec<String>>,
        pub rebound: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PskTransport for MockPsk {
        async fn send_chunk(&self, contact_id: &str, content: &str) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((contact_id.to_string(), content.to_string()));
            Ok(())
        }

        fn try_decrypt(&self, contact: &PskContactRow, note: &str) -> Option<String> {
            note.strip_prefix(&format!("psk:{}:", contact.psk))
                .map(str::to_string)
        }

        async fn stop_address(&self, address: &str) {
            self.stopped.lock().unwrap().push(address.to_string());
        }

        async fn rebind(&self, contact_id: &str, address: &str) -> anyhow::Result<()> {
            self.rebound
                .lock()
                .unwrap()
                .push((contact_id.to_string(), address.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockSync {
        pub requests: std::sync::atomic::AtomicU64,
    }

    impl SyncHandle for MockSync {
        fn request_sync(&self) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }
    }
}
