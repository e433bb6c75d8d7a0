// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Permission mode under which the engine is allowed to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::Default
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "accept-edits",
            PermissionMode::BypassPermissions => "bypass-permissions",
            PermissionMode::Plan => "plan",
        };
        f.write_str(s)
    }
}

/// Resolve a free-form permission-mode string (env var, remote metadata) to a
/// [`PermissionMode`] using the fixed alias table from the spec:
/// `yolo / safe / danger / bypass` → bypass-permissions,
/// `accept / accept-edits` → accept-edits.
///
/// Returns `None` for unrecognized values — callers must leave the current
/// mode unchanged and log a warning in that case, never fail.
pub fn normalize_permission_mode(raw: &str) -> Option<PermissionMode> {
    match raw.to_ascii_lowercase().as_str() {
        "default" => Some(PermissionMode::Default),
        "plan" => Some(PermissionMode::Plan),
        "accept" | "accept-edits" | "accept_edits" => Some(PermissionMode::AcceptEdits),
        "yolo" | "safe" | "safe-yolo" | "danger" | "bypass" | "bypass-permissions" => {
            Some(PermissionMode::BypassPermissions)
        }
        _ => None,
    }
}

/// A field that may be explicitly absent (no change), explicitly reset
/// (`null` in the wire representation), or explicitly set to a value.
///
/// Mirrors the well-known serde "double option" pattern: `Option<Option<T>>`
/// distinguishes "key not present" from "key present with value null" from
/// "key present with a value", which is exactly the override semantics
/// `push-user-turn`'s `meta` object requires.
pub type Override<T> = Option<Option<T>>;

/// Apply an [`Override`] to a mutable field in place. A `None` override
/// (key absent) is a no-op; `Some(None)` resets the field to `None`;
/// `Some(Some(v))` sets it.
pub fn apply_override<T>(field: &mut Option<T>, over: Override<T>) {
    if let Some(v) = over {
        *field = v;
    }
}

/// Mutable per-session policy state. The Session Runtime is the sole writer;
/// every Turn carries an immutable snapshot of this struct taken at enqueue
/// time (see [`crate::turn::PolicySnapshot`]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyState {
    pub permission_mode: PermissionMode,
    pub model_id: Option<String>,
    pub fallback_model_id: Option<String>,
    pub custom_system_prompt: Option<String>,
    pub appended_system_prompt: Option<String>,
    pub allowed_tools: Option<HashSet<String>>,
    pub disallowed_tools: Option<HashSet<String>>,
    pub role_id: Option<String>,
    pub team_id: Option<String>,
}

/// Explicit-presence overrides carried by `push-user-turn`'s `meta` object
/// and by `push-metadata-update`. Every field is an [`Override`] so the
/// caller can distinguish "don't touch this" from "clear this".
#[derive(Debug, Clone, Default)]
pub struct PolicyOverride {
    pub permission_mode: Override<PermissionMode>,
    pub model_id: Override<String>,
    pub fallback_model_id: Override<String>,
    pub custom_system_prompt: Override<String>,
    pub appended_system_prompt: Override<String>,
    pub allowed_tools: Override<HashSet<String>>,
    pub disallowed_tools: Override<HashSet<String>>,
    pub role_id: Override<String>,
    pub team_id: Override<String>,
}

impl PolicyState {
    /// Apply an override, field by field. Returns `true` if the team id
    /// transitioned (was absent/different and is now non-null) — the caller
    /// uses this to decide whether to trigger the team-join ritual.
    pub fn apply(&mut self, over: PolicyOverride) -> bool {
        let previous_team = self.team_id.clone();

        if let Some(mode) = over.permission_mode {
            if let Some(mode) = mode {
                self.permission_mode = mode;
            }
            // A reset of permission mode is meaningless (there is no
            // "unset" permission mode); `Some(None)` is treated as a no-op.
        }
        apply_override(&mut self.model_id, over.model_id);
        apply_override(&mut self.fallback_model_id, over.fallback_model_id);
        apply_override(&mut self.custom_system_prompt, over.custom_system_prompt);
        apply_override(
            &mut self.appended_system_prompt,
            over.appended_system_prompt,
        );
        apply_override(&mut self.allowed_tools, over.allowed_tools);
        apply_override(&mut self.disallowed_tools, over.disallowed_tools);
        apply_override(&mut self.role_id, over.role_id);
        apply_override(&mut self.team_id, over.team_id);

        match (&previous_team, &self.team_id) {
            (None, Some(_)) => true,
            (Some(a), Some(b)) if a != b => true,
            _ => false,
        }
    }
}
