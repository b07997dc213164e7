// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Notification channel adapters.
//!
//! Each adapter delivers plain text to one endpoint kind; the endpoint
//! itself (URL, chat id) lives in the channel's opaque config JSON.  All of
//! them are webhook-shaped HTTP POSTs, differing only in the payload field
//! the remote service expects.

use async_trait::async_trait;
use serde_json::{json, Value};

use quorum_core::notify::ChannelAdapter;

fn config_url(config: &Value) -> anyhow::Result<String> {
    config
        .get("url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("channel config has no url"))
}

pub struct DiscordAdapter {
    pub http: reqwest::Client,
}

#[async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn channel_type(&self) -> &'static str {
        "discord"
    }

    async fn send(&self, config: &Value, text: &str) -> anyhow::Result<()> {
        let url = config_url(config)?;
        self.http
            .post(&url)
            .json(&json!({"content": text}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct TelegramAdapter {
    pub http: reqwest::Client,
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_type(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, config: &Value, text: &str) -> anyhow::Result<()> {
        let url = config_url(config)?;
        let chat_id = config
            .get("chat_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.http
            .post(&url)
            .json(&json!({"chat_id": chat_id, "text": text}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct SlackAdapter {
    pub http: reqwest::Client,
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn channel_type(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, config: &Value, text: &str) -> anyhow::Result<()> {
        let url = config_url(config)?;
        self.http
            .post(&url)
            .json(&json!({"text": text}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct GithubAdapter {
    pub http: reqwest::Client,
}

#[async_trait]
impl ChannelAdapter for GithubAdapter {
    fn channel_type(&self) -> &'static str {
        "github"
    }

    /// Posts an issue comment; config carries the full comments API URL and
    /// a token.
    async fn send(&self, config: &Value, text: &str) -> anyhow::Result<()> {
        let url = config_url(config)?;
        let token = config
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("github channel config has no token"))?;
        self.http
            .post(&url)
            .bearer_auth(token)
            .header("User-Agent", "quorum")
            .json(&json!({"body": text}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// The standard adapter set the server boots with.
pub fn default_adapters() -> Vec<std::sync::Arc<dyn ChannelAdapter>> {
    let http = reqwest::Client::new();
    vec![
        std::sync::Arc::new(DiscordAdapter { http: http.clone() }),
        std::sync::Arc::new(TelegramAdapter { http: http.clone() }),
        std::sync::Arc::new(SlackAdapter { http: http.clone() }),
        std::sync::Arc::new(GithubAdapter { http }),
    ]
}
