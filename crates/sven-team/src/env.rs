// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Environment variable parsing (§6). One pure function per variable, each
//! taking a `&HashMap<String, String>` snapshot instead of reading
//! `std::env` directly so the parsing logic is table-testable — the same
//! split `sven_runtime::detect_ci_context` draws between "read the process
//! environment" and "decide what it means", just pushed one layer further
//! so tests never touch real process state.

use std::collections::HashMap;

use crate::error::SessionError;
use crate::policy_state::{normalize_permission_mode, PermissionMode};

/// Centralizes the two parallel entry-point brands named in §9
/// (`happy` / `aha`) instead of hard-coding both variable names at each
/// call site.
#[derive(Debug, Clone)]
pub struct BrandConfig {
    pub room_id_vars: Vec<&'static str>,
}

impl Default for BrandConfig {
    fn default() -> Self {
        Self {
            room_id_vars: vec!["HAPPY_ROOM_ID", "AHA_ROOM_ID"],
        }
    }
}

/// Snapshot the process environment once at startup; downstream parsing
/// stays pure over this map.
pub fn snapshot() -> HashMap<String, String> {
    std::env::vars().collect()
}

pub fn parse_team_id(env: &HashMap<String, String>, brand: &BrandConfig) -> Option<String> {
    brand.room_id_vars.iter().find_map(|v| env.get(*v).cloned())
}

pub fn parse_team_name(env: &HashMap<String, String>) -> Option<String> {
    env.get("HAPPY_ROOM_NAME").cloned()
}

pub fn parse_role(env: &HashMap<String, String>) -> Option<String> {
    env.get("HAPPY_AGENT_ROLE").cloned()
}

pub fn parse_session_name(env: &HashMap<String, String>) -> Option<String> {
    env.get("HAPPY_SESSION_NAME").cloned()
}

pub fn parse_session_path(env: &HashMap<String, String>) -> Option<String> {
    env.get("HAPPY_SESSION_PATH").cloned()
}

/// `HAPPY_PERMISSION_MODE`, resolved through the same alias table
/// `push-user-turn` uses. An unrecognized value is logged and treated as
/// absent — §4.1 requires the current mode be left unchanged, never a
/// startup failure.
pub fn parse_permission_mode(env: &HashMap<String, String>) -> Option<PermissionMode> {
    let raw = env.get("HAPPY_PERMISSION_MODE")?;
    match normalize_permission_mode(raw) {
        Some(mode) => Some(mode),
        None => {
            tracing::warn!(value = %raw, "unrecognized HAPPY_PERMISSION_MODE value; ignoring");
            None
        }
    }
}

/// `HAPPY_DESKTOP_MCP_URL` — the one startup value whose shape is validated
/// (`bad-config`, §7): it must parse as an `http(s)://` URL.
pub fn parse_desktop_mcp_url(
    env: &HashMap<String, String>,
) -> Result<Option<String>, SessionError> {
    let Some(raw) = env.get("HAPPY_DESKTOP_MCP_URL") else {
        return Ok(None);
    };
    if raw.starts_with("http://") || raw.starts_with("https://") {
        Ok(Some(raw.clone()))
    } else {
        Err(SessionError::BadConfig(format!(
            "HAPPY_DESKTOP_MCP_URL must be an http(s) URL, got {raw:?}"
        )))
    }
}

/// Every environment-derived value consulted at startup, parsed once.
#[derive(Debug, Clone, Default)]
pub struct StartupEnv {
    pub team_id: Option<String>,
    pub team_name: Option<String>,
    pub role: Option<String>,
    pub session_name: Option<String>,
    pub session_path: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub desktop_mcp_url: Option<String>,
}

impl StartupEnv {
    pub fn parse(
        env: &HashMap<String, String>,
        brand: &BrandConfig,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            team_id: parse_team_id(env, brand),
            team_name: parse_team_name(env),
            role: parse_role(env),
            session_name: parse_session_name(env),
            session_path: parse_session_path(env),
            permission_mode: parse_permission_mode(env),
            desktop_mcp_url: parse_desktop_mcp_url(env)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_team_id_prefers_happy_over_aha() {
        let env = env_with(&[("HAPPY_ROOM_ID", "team-h"), ("AHA_ROOM_ID", "team-a")]);
        assert_eq!(
            parse_team_id(&env, &BrandConfig::default()),
            Some("team-h".to_string())
        );
    }

    #[test]
    fn parse_team_id_falls_back_to_aha() {
        let env = env_with(&[("AHA_ROOM_ID", "team-a")]);
        assert_eq!(
            parse_team_id(&env, &BrandConfig::default()),
            Some("team-a".to_string())
        );
    }

    #[test]
    fn parse_team_id_absent_is_none() {
        let env = HashMap::new();
        assert_eq!(parse_team_id(&env, &BrandConfig::default()), None);
    }

    #[test]
    fn parse_permission_mode_recognizes_alias() {
        let env = env_with(&[("HAPPY_PERMISSION_MODE", "yolo")]);
        assert_eq!(
            parse_permission_mode(&env),
            Some(PermissionMode::BypassPermissions)
        );
    }

    #[test]
    fn parse_permission_mode_unknown_value_is_none() {
        let env = env_with(&[("HAPPY_PERMISSION_MODE", "turbo")]);
        assert_eq!(parse_permission_mode(&env), None);
    }

    #[test]
    fn parse_desktop_mcp_url_accepts_https() {
        let env = env_with(&[("HAPPY_DESKTOP_MCP_URL", "https://localhost:9000")]);
        assert_eq!(
            parse_desktop_mcp_url(&env).unwrap(),
            Some("https://localhost:9000".to_string())
        );
    }

    #[test]
    fn parse_desktop_mcp_url_rejects_malformed_value() {
        let env = env_with(&[("HAPPY_DESKTOP_MCP_URL", "not-a-url")]);
        assert!(matches!(
            parse_desktop_mcp_url(&env),
            Err(SessionError::BadConfig(_))
        ));
    }

    #[test]
    fn parse_desktop_mcp_url_absent_is_ok_none() {
        let env = HashMap::new();
        assert_eq!(parse_desktop_mcp_url(&env).unwrap(), None);
    }

    #[test]
    fn startup_env_parses_all_fields() {
        let env = env_with(&[
            ("HAPPY_ROOM_ID", "team-a"),
            ("HAPPY_AGENT_ROLE", "builder"),
            ("HAPPY_SESSION_NAME", "my-session"),
        ]);
        let startup = StartupEnv::parse(&env, &BrandConfig::default()).unwrap();
        assert_eq!(startup.team_id, Some("team-a".to_string()));
        assert_eq!(startup.role, Some("builder".to_string()));
        assert_eq!(startup.session_name, Some("my-session".to_string()));
        assert_eq!(startup.desktop_mcp_url, None);
    }

    #[test]
    fn startup_env_propagates_bad_config_error() {
        let env = env_with(&[("HAPPY_DESKTOP_MCP_URL", "ftp://nope")]);
        assert!(StartupEnv::parse(&env, &BrandConfig::default()).is_err());
    }
}
