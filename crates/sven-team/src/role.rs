// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Role Registry: a compiled table of roles, looked up by stable string
//! id. Not inheritance — all "polymorphism" here is a switch on `category`.

use crate::policy_state::PermissionMode;

/// Broad grouping used by role-category-specific prompt guidance and by
/// the derived `coordinators`/`workers` sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Coordination,
    Implementation,
    Review,
    Research,
    Product,
    Design,
    Documentation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    ReadOnly,
    FullAccess,
}

/// Tool names denied to every read-only role unless a role overrides them
/// explicitly via `denied_tools` or an explicit allow (handled in
/// [`crate::permission`]).
pub const READ_ONLY_DEFAULT_DENIED: &[&str] = &[
    "edit",
    "write_to_file",
    "replace_file_content",
    "multi_replace_file_content",
    "move_file",
    "delete_file",
];

/// One compiled role definition.
#[derive(Debug, Clone, Copy)]
pub struct RoleDefinition {
    pub id: &'static str,
    pub display_name: &'static str,
    pub category: Category,
    pub access_level: AccessLevel,
    pub permission_mode: PermissionMode,
    pub denied_tools: &'static [&'static str],
    pub responsibilities: &'static [&'static str],
    pub protocol: &'static [&'static str],
}

macro_rules! role {
    ($id:expr, $name:expr, $cat:ident, $access:ident, $mode:ident, $denied:expr, $resp:expr, $proto:expr) => {
        RoleDefinition {
            id: $id,
            display_name: $name,
            category: Category::$cat,
            access_level: AccessLevel::$access,
            permission_mode: PermissionMode::$mode,
            denied_tools: $denied,
            responsibilities: $resp,
            protocol: $proto,
        }
    };
}

/// The compiled table. Order is insertion order; lookup is linear (the
/// table is small and static — see `RoleRegistry::get`).
pub static ROLES: &[RoleDefinition] = &[
    role!(
        "master",
        "Master",
        Coordination,
        FullAccess,
        BypassPermissions,
        &[],
        &["Own overall delivery", "Create and delegate top-level tasks", "Resolve blockers"],
        &["Review incoming team messages", "Keep the board authoritative"]
    ),
    role!(
        "orchestrator",
        "Orchestrator",
        Coordination,
        FullAccess,
        Default,
        &[],
        &["Sequence work across teams", "Create top-level tasks"],
        &["Delegate; do not implement directly"]
    ),
    role!(
        "project-manager",
        "Project Manager",
        Coordination,
        FullAccess,
        Default,
        &[],
        &["Track schedule and scope", "Resolve blockers"],
        &["Check board status before standup"]
    ),
    role!(
        "product-owner",
        "Product Owner",
        Product,
        FullAccess,
        Default,
        &[],
        &["Own product priorities", "Create top-level tasks"],
        &["Review `review` column before sign-off"]
    ),
    role!(
        "builder",
        "Builder",
        Implementation,
        FullAccess,
        AcceptEdits,
        &[],
        &["Implement assigned tasks", "Report blockers promptly"],
        &["Claim a task", "Work it", "Mark done"]
    ),
    role!(
        "framer",
        "Framer",
        Implementation,
        FullAccess,
        AcceptEdits,
        &[],
        &["Scaffold structure ahead of implementation"],
        &["Coordinate with builder on interfaces"]
    ),
    role!(
        "implementer",
        "Implementer",
        Implementation,
        FullAccess,
        AcceptEdits,
        &[],
        &["Implement assigned tasks"],
        &["Claim a task", "Work it", "Mark done"]
    ),
    role!(
        "architect",
        "Architect",
        Implementation,
        FullAccess,
        Default,
        &[],
        &["Design module boundaries", "Review interface changes"],
        &["Coordinate with solution-architect on cross-cutting concerns"]
    ),
    role!(
        "solution-architect",
        "Solution Architect",
        Implementation,
        FullAccess,
        Default,
        &[],
        &["Own cross-team technical design"],
        &["Coordinate with architect on module boundaries"]
    ),
    role!(
        "reviewer",
        "Reviewer",
        Review,
        ReadOnly,
        Plan,
        &[],
        &["Review completed work", "Approve or request changes"],
        &["Inspect `review` column", "Leave findings as comments"]
    ),
    role!(
        "qa",
        "QA",
        Review,
        ReadOnly,
        Plan,
        &[],
        &["Verify acceptance criteria", "File defects as blockers"],
        &["Inspect `review` column", "Report blockers for regressions"]
    ),
    role!(
        "observer",
        "Observer",
        Research,
        ReadOnly,
        Plan,
        &[],
        &["Monitor team activity"],
        &["Read-only; never mutate the board"]
    ),
    role!(
        "researcher",
        "Researcher",
        Research,
        ReadOnly,
        Default,
        &[],
        &["Investigate and summarize findings"],
        &["Attach findings to the relevant task"]
    ),
    role!(
        "scout",
        "Scout",
        Research,
        ReadOnly,
        Default,
        &[],
        &["Survey the codebase ahead of planning"],
        &["Report findings to the coordinator"]
    ),
    role!(
        "ux-designer",
        "UX Designer",
        Design,
        FullAccess,
        AcceptEdits,
        &[],
        &["Own interaction design for assigned tasks"],
        &["Coordinate with product-owner on scope"]
    ),
    role!(
        "documentation-writer",
        "Documentation Writer",
        Documentation,
        FullAccess,
        AcceptEdits,
        &[],
        &["Keep docs in sync with shipped work"],
        &["Claim a task", "Work it", "Mark done"]
    ),
];

/// Aliases resolving to a canonical role id. Centralizes the
/// `qa` ≡ `qa-engineer` union named in the spec's Open Questions instead of
/// scattering the comparison across filter branches.
pub static ROLE_ALIASES: &[(&str, &str)] = &[("qa-engineer", "qa")];

/// Role-pair collaboration map: presence of `b` in `collaborators(a)` means
/// *a listens to b* in addition to the baseline filter rule in
/// [`crate::message::filter_decision`]. Additive and symmetric by
/// construction (each pair is inserted once, looked up both ways).
static COLLAB_PAIRS: &[(&str, &str)] = &[
    ("builder", "framer"),
    ("architect", "solution-architect"),
    ("product-owner", "ux-designer"),
    ("builder", "reviewer"),
];

pub fn collaborators(role_id: &str) -> Vec<&'static str> {
    COLLAB_PAIRS
        .iter()
        .filter_map(|(a, b)| {
            if *a == role_id {
                Some(*b)
            } else if *b == role_id {
                Some(*a)
            } else {
                None
            }
        })
        .collect()
}

pub static COORDINATORS: &[&str] = &["master", "orchestrator", "project-manager", "product-owner"];
pub static WORKERS: &[&str] = &[
    "builder",
    "framer",
    "implementer",
    "architect",
    "solution-architect",
];

/// Normalize a raw role id: lowercase, underscores become hyphens, then
/// resolve through the alias table.
pub fn canonicalize(raw: &str) -> String {
    let lowered = raw.to_ascii_lowercase().replace('_', "-");
    for (alias, canonical) in ROLE_ALIASES {
        if *alias == lowered {
            return (*canonical).to_string();
        }
    }
    lowered
}

pub fn lookup(raw: &str) -> Option<&'static RoleDefinition> {
    let canonical = canonicalize(raw);
    ROLES.iter().find(|r| r.id == canonical)
}

pub fn is_coordinator(raw: &str) -> bool {
    let canonical = canonicalize(raw);
    COORDINATORS.contains(&canonical.as_str())
}

pub fn is_worker(raw: &str) -> bool {
    let canonical = canonicalize(raw);
    WORKERS.contains(&canonical.as_str())
}

/// Compose the role prompt: header, team id, responsibilities, protocol,
/// and category-specific next-step guidance. Empty string if the role is
/// unknown (per §7's `unknown-role` handling: permission check denies, role
/// prompt is empty, the event is logged by the caller).
pub fn role_prompt(raw_role: &str, team_id: Option<&str>) -> String {
    let Some(def) = lookup(raw_role) else {
        return String::new();
    };

    let mut out = String::new();
    out.push_str("[SYSTEM: TEAM CONTEXT]\n");
    if let Some(team_id) = team_id {
        out.push_str(&format!("Team: {team_id}\n"));
    }
    out.push_str(&format!("Role: {}\n", def.display_name));

    out.push_str("Responsibilities:\n");
    for (i, r) in def.responsibilities.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, r));
    }

    out.push_str("Protocol:\n");
    for p in def.protocol {
        out.push_str(&format!("- {p}\n"));
    }

    let next_steps = match def.category {
        Category::Coordination | Category::Product => {
            "list-tasks → create-task → announce"
        }
        Category::Implementation | Category::Design | Category::Documentation => {
            "list-tasks → update-task(in-progress) → work → update-task(done)"
        }
        Category::Review => "list-tasks(review) → inspect → approve-or-request-changes",
        Category::Research => "list-tasks → investigate → summarize",
    };
    out.push_str(&format!("Next steps: {next_steps}\n"));

    out
}
