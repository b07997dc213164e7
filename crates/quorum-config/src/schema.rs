// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    3000
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_sync_interval_secs() -> u64 {
    4
}

fn default_min_fee_micro() -> u64 {
    1_000
}

fn default_credits_per_unit() -> f64 {
    100.0
}

fn default_daily_fee_budget_micro() -> u64 {
    2_000_000
}

fn default_session_timeout_secs() -> u64 {
    1800
}

fn default_subscription_timeout_secs() -> u64 {
    600
}

fn default_work_task_max_per_day() -> u32 {
    100
}

fn default_db_path() -> String {
    "quorum.db".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub algochat: AlgoChatConfig,
    #[serde(default)]
    pub credits: CreditConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub work_tasks: WorkTaskConfig,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP port (env override: PORT)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address (env override: BIND_HOST)
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Bearer token for /metrics and other admin routes.  When unset the
    /// admin routes are open (env override: ADMIN_API_KEY).
    pub admin_api_key: Option<String>,
    /// WebSocket authentication mode.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_host: default_bind_host(),
            admin_api_key: None,
            auth: AuthConfig::default(),
        }
    }
}

/// How WebSocket clients authenticate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication (local development).
    #[default]
    None,
    /// `Authorization: Bearer <token>` header.
    Bearer,
    /// `?token=<token>` query parameter (for browser WS clients that cannot
    /// set headers).
    Query,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite file.  Relative paths resolve against the working
    /// directory the server was started from.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// On-chain chat transport settings.
///
/// ```yaml
/// algochat:
///   enabled: true
///   sync_interval_secs: 4
///   owner_addresses:
///     - "OWNERADDR..."
///   indexer_url: "https://indexer.example.net"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoChatConfig {
    /// Master switch (env override: ALGOCHAT_ENABLED).
    #[serde(default)]
    pub enabled: bool,
    /// How often the sync manager polls for new transactions
    /// (env override: ALGOCHAT_SYNC_INTERVAL_SECS).
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Addresses granted owner (privileged command) status
    /// (env override: ALGOCHAT_OWNER_ADDRESSES, comma-separated).
    #[serde(default)]
    pub owner_addresses: Vec<String>,
    /// Environment variable holding the main account mnemonic.  The mnemonic
    /// itself never appears in config files.
    pub mnemonic_env: Option<String>,
    /// Indexer endpoint for "transactions to my address since round N" queries.
    pub indexer_url: Option<String>,
    /// Agent that handles conversations with no explicit binding.
    pub default_agent_id: Option<String>,
    /// Minimum transaction fee in microunits.
    #[serde(default = "default_min_fee_micro")]
    pub min_fee_micro: u64,
    /// Hard daily ceiling on total fees spent on outbound messages.
    #[serde(default = "default_daily_fee_budget_micro")]
    pub daily_fee_budget_micro: u64,
}

impl Default for AlgoChatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sync_interval_secs: default_sync_interval_secs(),
            owner_addresses: Vec::new(),
            mnemonic_env: None,
            indexer_url: None,
            default_agent_id: None,
            min_fee_micro: default_min_fee_micro(),
            daily_fee_budget_micro: default_daily_fee_budget_micro(),
        }
    }
}

/// Credit bookkeeping.  Credits gate non-owner senders; owners bypass all of
/// this (see the owner predicate on the process manager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Credits charged per completed agent turn.
    #[serde(default = "default_credits_per_unit")]
    pub credits_per_turn: f64,
    /// Credits granted per whole payment unit attached to a message.
    #[serde(default = "default_credits_per_unit")]
    pub credits_per_algo: f64,
    /// One-time grant for first-time senders.
    #[serde(default)]
    pub welcome_grant: f64,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            credits_per_turn: default_credits_per_unit(),
            credits_per_algo: default_credits_per_unit(),
            welcome_grant: 0.0,
        }
    }
}

fn default_agent_command() -> String {
    "quorum-agent".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Binary launched for each agent sub-process.  It speaks the
    /// newline-delimited JSON event protocol on stdout.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    /// Inactivity timeout for a running sub-process.
    #[serde(default = "default_session_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// Subscription-side timeout: a consumer that sees no activity for this
    /// long performs one final flush and unsubscribes.
    #[serde(default = "default_subscription_timeout_secs")]
    pub subscription_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent_command: default_agent_command(),
            inactivity_timeout_secs: default_session_timeout_secs(),
            subscription_timeout_secs: default_subscription_timeout_secs(),
        }
    }
}

/// Slack Events API ingress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    /// HMAC-SHA256 signing secret for request verification.
    pub signing_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Accept `POST /webhooks/github`.  When false the route answers 503.
    #[serde(default)]
    pub github_enabled: bool,
    pub github_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkTaskConfig {
    /// Daily cap on `/work` task creation (env override: WORK_TASK_MAX_PER_DAY).
    #[serde(default = "default_work_task_max_per_day")]
    pub max_per_day: u32,
}

impl Default for WorkTaskConfig {
    fn default() -> Self {
        Self {
            max_per_day: default_work_task_max_per_day(),
        }
    }
}
