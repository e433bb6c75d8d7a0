// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pure permission-decision function over the Role Registry. Mirrors
//! `sven_tools::policy::ToolPolicy::decide`'s ordered-rule-precedence
//! shape: check the most specific rule first, fall through to a default.

use std::collections::HashSet;

use crate::policy_state::PermissionMode;
use crate::role::{self, AccessLevel, READ_ONLY_DEFAULT_DENIED};

/// Stable reason string identifying the rule that produced a decision.
/// Required by the spec to be one of a fixed set so callers can match on it.
pub const REASON_UNKNOWN_ROLE: &str = "unknown-role";
pub const REASON_ROLE_EXPLICIT_DENY: &str = "role-explicit-deny";
pub const REASON_ROLE_EXPLICIT_ALLOW: &str = "role-explicit-allow";
pub const REASON_ROLE_DISALLOWED_LIST: &str = "role-disallowed-list";
pub const REASON_ROLE_ACCESS_LEVEL: &str = "role-access-level";
pub const REASON_DEFAULT_ALLOW: &str = "default-allow";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionDecision {
    pub allow: bool,
    pub reason: &'static str,
}

impl PermissionDecision {
    fn deny(reason: &'static str) -> Self {
        Self {
            allow: false,
            reason,
        }
    }

    fn allow(reason: &'static str) -> Self {
        Self {
            allow: true,
            reason,
        }
    }
}

/// Per-call-site explicit overrides, consulted before the role's own
/// static table (step 2 of the spec's check algorithm). Empty by default;
/// populated only when a caller has configured tool-specific exceptions.
#[derive(Debug, Clone, Default)]
pub struct ExplicitOverrides<'a> {
    pub allow: HashSet<&'a str>,
    pub deny: HashSet<&'a str>,
}

/// `check(role, tool) -> {allow|deny, reason}`.
///
/// Pure function of `(role, tool, overrides)` and the compiled Role
/// Registry: two invocations with equal inputs return equal decisions.
pub fn check(raw_role: &str, tool: &str, overrides: &ExplicitOverrides) -> PermissionDecision {
    let Some(def) = role::lookup(raw_role) else {
        return PermissionDecision::deny(REASON_UNKNOWN_ROLE);
    };

    if overrides.deny.contains(tool) {
        return PermissionDecision::deny(REASON_ROLE_EXPLICIT_DENY);
    }
    if overrides.allow.contains(tool) {
        return PermissionDecision::allow(REASON_ROLE_EXPLICIT_ALLOW);
    }

    if def.denied_tools.contains(&tool) {
        return PermissionDecision::deny(REASON_ROLE_DISALLOWED_LIST);
    }

    if def.access_level == AccessLevel::ReadOnly && READ_ONLY_DEFAULT_DENIED.contains(&tool) {
        return PermissionDecision::deny(REASON_ROLE_ACCESS_LEVEL);
    }

    PermissionDecision::allow(REASON_DEFAULT_ALLOW)
}

/// `get-role-permissions(role, requested-mode)`.
///
/// Resolves the effective permission mode and the merged disallowed-tool
/// set for a role, honoring an explicit user opt-in to `bypass-permissions`.
pub fn effective_permissions(
    raw_role: &str,
    requested_mode: Option<PermissionMode>,
    call_site_disallowed: &HashSet<String>,
) -> (PermissionMode, HashSet<String>) {
    let mode = match requested_mode {
        Some(PermissionMode::BypassPermissions) => PermissionMode::BypassPermissions,
        _ => role::lookup(raw_role)
            .map(|d| d.permission_mode)
            .unwrap_or(PermissionMode::Default),
    };

    let mut disallowed = call_site_disallowed.clone();
    if let Some(def) = role::lookup(raw_role) {
        disallowed.extend(def.denied_tools.iter().map(|s| s.to_string()));
    }

    (mode, disallowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_role_denies() {
        let d = check("not-a-role", "edit", &ExplicitOverrides::default());
        assert!(!d.allow);
        assert_eq!(d.reason, REASON_UNKNOWN_ROLE);
    }

    #[test]
    fn explicit_deny_wins_over_everything() {
        let mut overrides = ExplicitOverrides::default();
        overrides.deny.insert("run_terminal_command");
        let d = check("master", "run_terminal_command", &overrides);
        assert!(!d.allow);
        assert_eq!(d.reason, REASON_ROLE_EXPLICIT_DENY);
    }

    #[test]
    fn explicit_allow_overrides_access_level_deny() {
        let mut overrides = ExplicitOverrides::default();
        overrides.allow.insert("edit");
        let d = check("reviewer", "edit", &overrides);
        assert!(d.allow);
        assert_eq!(d.reason, REASON_ROLE_EXPLICIT_ALLOW);
    }

    #[test]
    fn read_only_role_denies_default_denied_tool() {
        let d = check("reviewer", "edit", &ExplicitOverrides::default());
        assert!(!d.allow);
        assert_eq!(d.reason, REASON_ROLE_ACCESS_LEVEL);
    }

    #[test]
    fn read_only_role_allows_read_tool() {
        let d = check("reviewer", "read_file", &ExplicitOverrides::default());
        assert!(d.allow);
        assert_eq!(d.reason, REASON_DEFAULT_ALLOW);
    }

    #[test]
    fn full_access_role_allows_edit() {
        let d = check("builder", "edit", &ExplicitOverrides::default());
        assert!(d.allow);
        assert_eq!(d.reason, REASON_DEFAULT_ALLOW);
    }

    #[test]
    fn decision_is_deterministic() {
        let a = check("builder", "edit", &ExplicitOverrides::default());
        let b = check("builder", "edit", &ExplicitOverrides::default());
        assert_eq!(a, b);
    }

    #[test]
    fn effective_permissions_bypass_is_sticky() {
        let (mode, _) = effective_permissions(
            "reviewer",
            Some(PermissionMode::BypassPermissions),
            &HashSet::new(),
        );
        assert_eq!(mode, PermissionMode::BypassPermissions);
    }

    #[test]
    fn effective_permissions_falls_back_to_role_mode() {
        let (mode, disallowed) = effective_permissions("reviewer", None, &HashSet::new());
        assert_eq!(mode, PermissionMode::Plan);
        assert!(disallowed.is_empty()); // reviewer has no explicit denied_tools entries
    }
}
