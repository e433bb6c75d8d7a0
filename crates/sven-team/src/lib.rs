// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Multi-agent team collaboration runtime: a shared task board, a filtered
//! team message pipeline, a role-based permission engine, bounded local
//! message storage, and the session runtime that ties them together behind
//! a single policy-owning event loop.

mod config;
mod engine_driver;
mod env;
mod error;
mod events;
mod message;
mod permission;
mod policy_state;
mod role;
mod server_client;
mod session;
mod storage;
mod task;
mod task_manager;
mod turn;

pub use config::{load as load_config, TeamRuntimeConfig};
pub use engine_driver::{ControlMode, EngineDriver, EngineEvent, FakeEngine};
pub use env::{parse_desktop_mcp_url, snapshot as env_snapshot, BrandConfig, StartupEnv};
pub use error::{PipelineError, SessionError, StorageError, TaskError};
pub use events::{EventBus, StateChangeEvent};
pub use message::{
    filter_decision, format_for_injection, ContextBundle, FilterOutcome, MessageTypeTag,
    TeamMessage, TeamMessagePipeline,
};
pub use permission::{
    check as check_permission, effective_permissions, ExplicitOverrides, PermissionDecision,
    REASON_DEFAULT_ALLOW, REASON_ROLE_ACCESS_LEVEL, REASON_ROLE_DISALLOWED_LIST,
    REASON_ROLE_EXPLICIT_ALLOW, REASON_ROLE_EXPLICIT_DENY, REASON_UNKNOWN_ROLE,
};
pub use policy_state::{
    apply_override, normalize_permission_mode, Override, PermissionMode, PolicyOverride,
    PolicyState,
};
pub use role::{
    canonicalize as canonicalize_role, collaborators, is_coordinator, is_worker, lookup as lookup_role,
    role_prompt, AccessLevel, Category, RoleDefinition, COORDINATORS, ROLES, WORKERS,
};
pub use server_client::{
    Artifact, FakeServerClient, KvMutation, KvMutationResult, MachineDescriptor, ServerClient,
    ServerPushEvent, ServerResult, SessionDescriptor, TaskEventKind,
};
pub use session::{Command, LifecycleState, SessionHandle, SessionRuntime};
pub use storage::MessageStore;
pub use task::{
    filter_tasks, ApprovalStatus, Blocker, BlockerType, Board, Column, ExecutionLink,
    ExecutionLinkRole, ExecutionLinkStatus, Priority, StatusPropagation, Task, TaskFilterResult,
    TaskStats, TaskStatus,
};
pub use task_manager::{NewTaskFields, TaskDelta, TaskStateManager, TaskTree};
pub use turn::{fingerprint, EnqueueKind, PolicySnapshot, Turn, TurnQueue};

/// Wall-clock milliseconds since the Unix epoch. The one place the crate
/// touches real time, so tests can hold `now` fixed by constructing records
/// directly instead of calling this.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
