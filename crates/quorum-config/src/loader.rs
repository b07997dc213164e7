// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/quorum/config.yaml"));
    paths.push(PathBuf::from("/etc/quorum/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/quorum/config.yaml"));
        paths.push(home.join(".config/quorum/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("quorum/config.yaml"));
        paths.push(cfg.join("quorum/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".quorum/config.yaml"));
    paths.push(PathBuf::from(".quorum/config.yml"));
    paths.push(PathBuf::from("quorum.yaml"));
    paths.push(PathBuf::from("quorum.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// environment overrides.  The `extra` argument may provide an explicit path
/// (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Environment variables win over every file layer.  Malformed values are
/// ignored with a debug line rather than aborting startup.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("PORT") {
        match v.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => debug!(value = %v, "ignoring unparseable PORT"),
        }
    }
    if let Ok(v) = std::env::var("BIND_HOST") {
        config.server.bind_host = v;
    }
    if let Ok(v) = std::env::var("ADMIN_API_KEY") {
        if !v.is_empty() {
            config.server.admin_api_key = Some(v);
        }
    }
    if let Ok(v) = std::env::var("WORK_TASK_MAX_PER_DAY") {
        match v.parse() {
            Ok(n) => config.work_tasks.max_per_day = n,
            Err(_) => debug!(value = %v, "ignoring unparseable WORK_TASK_MAX_PER_DAY"),
        }
    }
    if let Ok(v) = std::env::var("ALGOCHAT_ENABLED") {
        config.algochat.enabled = matches!(v.as_str(), "1" | "true" | "yes");
    }
    if let Ok(v) = std::env::var("ALGOCHAT_SYNC_INTERVAL_SECS") {
        match v.parse() {
            Ok(n) => config.algochat.sync_interval_secs = n,
            Err(_) => debug!(value = %v, "ignoring unparseable ALGOCHAT_SYNC_INTERVAL_SECS"),
        }
    }
    if let Ok(v) = std::env::var("ALGOCHAT_OWNER_ADDRESSES") {
        config.algochat.owner_addresses = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(v) = std::env::var("ALGOCHAT_INDEXER_URL") {
        config.algochat.indexer_url = Some(v);
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("server:\n  port: 3000\n  bind_host: 127.0.0.1");
        let src = val("server:\n  port: 8080");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["server"]["port"].as_i64(), Some(8080));
        assert_eq!(dst["server"]["bind_host"].as_str(), Some("127.0.0.1"));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/quorum_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "server:\n  port: 4100\nalgochat:\n  enabled: true").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.server.port, 4100);
        assert!(cfg.algochat.enabled);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.server.bind_host, "127.0.0.1");
        assert_eq!(cfg.work_tasks.max_per_day, 100);
        assert_eq!(cfg.sessions.subscription_timeout_secs, 600);
    }
}
