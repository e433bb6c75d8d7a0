// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `TeamRuntimeConfig`: every tunable named in §4.5 and §5, layered
//! file-over-defaults the way `sven_config::loader` layers its YAML search
//! path. Every bound here is configurable; the numbers below are only the
//! defaults the spec names.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_hot_cap() -> usize {
    500
}

fn default_max_age_days() -> i64 {
    7
}

fn default_team_budget_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_max_archive_files() -> usize {
    10
}

fn default_server_request_timeout_secs() -> u64 {
    30
}

fn default_task_retry_bound() -> u32 {
    2
}

fn default_team_history_fetch_limit() -> usize {
    200
}

fn default_recent_context_limit() -> usize {
    20
}

fn default_event_bus_capacity() -> usize {
    256
}

/// Every tunable the spec names, with the spec's own defaults. Loaded via a
/// YAML search path merged over these defaults, mirroring
/// `sven_config::loader::load`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRuntimeConfig {
    /// Bounded Message Storage hot-set cap (§4.5).
    #[serde(default = "default_hot_cap")]
    pub hot_cap: usize,
    /// Bounded Message Storage max age, in days, before a record archives (§4.5).
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
    /// Bounded Message Storage per-team budget across hot file + archives (§4.5).
    #[serde(default = "default_team_budget_bytes")]
    pub team_budget_bytes: u64,
    /// Bounded Message Storage max archive file count before eviction (§4.5).
    #[serde(default = "default_max_archive_files")]
    pub max_archive_files: usize,
    /// Recommended per-request server timeout bound (§5).
    #[serde(default = "default_server_request_timeout_secs")]
    pub server_request_timeout_secs: u64,
    /// Task State Manager CAS retry bound (§4.2).
    #[serde(default = "default_task_retry_bound")]
    pub task_retry_bound: u32,
    /// Team-join ritual history fetch limit (§4.3 step 2).
    #[serde(default = "default_team_history_fetch_limit")]
    pub team_history_fetch_limit: usize,
    /// Team-join ritual recent-messages summary limit (§4.3 step 5).
    #[serde(default = "default_recent_context_limit")]
    pub recent_context_limit: usize,
    /// Local state-change event bus channel capacity (§4.2).
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl Default for TeamRuntimeConfig {
    fn default() -> Self {
        Self {
            hot_cap: default_hot_cap(),
            max_age_days: default_max_age_days(),
            team_budget_bytes: default_team_budget_bytes(),
            max_archive_files: default_max_archive_files(),
            server_request_timeout_secs: default_server_request_timeout_secs(),
            task_retry_bound: default_task_retry_bound(),
            team_history_fetch_limit: default_team_history_fetch_limit(),
            recent_context_limit: default_recent_context_limit(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl TeamRuntimeConfig {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_age_days)
    }

    pub fn server_request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.server_request_timeout_secs)
    }
}

/// Ordered list of config file locations, lowest to highest priority. Later
/// files override earlier ones — same discipline as
/// `sven_config::loader::config_search_paths`.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/sven-team/config.yaml"));
        paths.push(home.join(".config/sven-team/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("sven-team/config.yaml"));
        paths.push(cfg.join("sven-team/config.yml"));
    }
    paths.push(PathBuf::from(".sven-team.yaml"));
    paths.push(PathBuf::from(".sven-team.yml"));
    paths
}

/// Load configuration by merging all discovered YAML files over the
/// built-in defaults. `extra` may provide an explicit path (e.g. a CLI flag
/// owned by a downstream binary — out of scope here).
pub fn load(extra: Option<&Path>) -> anyhow::Result<TeamRuntimeConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            tracing::debug!(path = %path.display(), "loading team-runtime config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        tracing::debug!(path = %p.display(), "loading explicit team-runtime config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: TeamRuntimeConfig =
        if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
            TeamRuntimeConfig::default()
        } else {
            serde_yaml::from_value(merged).unwrap_or_default()
        };
    Ok(config)
}

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
