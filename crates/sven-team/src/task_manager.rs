// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `TaskStateManager`: the shared task tree, read-modify-write through the
//! server API, with completion/blocker propagation and optimistic
//! concurrency (§4.2). The per-team board is cached locally; every mutation
//! re-reads, applies a pure transform, and writes back with the expected
//! version pair, retrying on conflict up to `config.task_retry_bound` times.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::TeamRuntimeConfig;
use crate::error::TaskError;
use crate::events::{EventBus, StateChangeEvent};
use crate::message::{MessageTypeTag, TeamMessage};
use crate::role;
use crate::server_client::ServerClient;
use crate::task::{
    Blocker, BlockerType, Board, ExecutionLink, ExecutionLinkRole, ExecutionLinkStatus, Priority,
    Task, TaskStatus,
};

/// Locally-cached copy of the team artifact plus the version pair needed to
/// CAS the next write.
#[derive(Clone)]
struct CachedBoard {
    board: Board,
    header_version: u64,
    body_version: u64,
}

/// Delta accepted by [`TaskStateManager::update_task`]. Every field is an
/// `Option`; `None` means "leave unchanged" (there is no need for the
/// explicit-null-reset discipline `PolicyState` uses — none of these fields
/// have a meaningful "unset" state other than `assignee_id`, which the
/// caller signals with `Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct TaskDelta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub assignee_id: Option<Option<String>>,
    pub priority: Option<Priority>,
    pub labels: Option<Vec<String>>,
}

/// Fields accepted when creating a task or subtask.
#[derive(Debug, Clone)]
pub struct NewTaskFields {
    pub title: String,
    pub description: String,
    pub priority: Option<Priority>,
    pub assignee_id: Option<String>,
    pub labels: Vec<String>,
}

impl NewTaskFields {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority: None,
            assignee_id: None,
            labels: Vec::new(),
        }
    }
}

/// The shared task tree: server-mediated reads and writes, propagation
/// rules, and lazy board initialization (§4.2). The direct-artifact fallback
/// named in §4.2.1 is retained narrowly for `list_subtasks`/`get_task_tree`.
pub struct TaskStateManager {
    server: Arc<dyn ServerClient>,
    config: Arc<TeamRuntimeConfig>,
    events: Arc<EventBus>,
    cache: Mutex<HashMap<String, CachedBoard>>,
}

impl TaskStateManager {
    pub fn new(
        server: Arc<dyn ServerClient>,
        config: Arc<TeamRuntimeConfig>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            server,
            config,
            events,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// `get-board()`: lazy-initializes the team artifact if absent, returns
    /// all tasks. Falls back to the last-known local cache on a transient
    /// server error (§4.2.1) — the only read this manager serves stale.
    pub async fn get_board(&self, team_id: &str) -> Result<Vec<Task>, TaskError> {
        match self.load_or_init(team_id).await {
            Ok(cached) => Ok(cached.board.tasks.into_values().collect()),
            Err(TaskError::TransientServerError(msg)) => {
                let cache = self.cache.lock().await;
                if let Some(cached) = cache.get(team_id) {
                    tracing::warn!(team_id, error = %msg, "get_board serving stale cache after transient error");
                    Ok(cached.board.tasks.values().cloned().collect())
                } else {
                    Err(TaskError::TransientServerError(msg))
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_task(&self, team_id: &str, id: Uuid) -> Result<Task, TaskError> {
        let cached = self.load_or_init(team_id).await?;
        cached
            .board
            .tasks
            .get(&id)
            .cloned()
            .ok_or(TaskError::NotFound(id))
    }

    /// `create-task(fields)`: only coordinators may create top-level tasks.
    pub async fn create_task(
        &self,
        team_id: &str,
        role: &str,
        session_id: &str,
        fields: NewTaskFields,
    ) -> Result<Task, TaskError> {
        if !role::is_coordinator(role) {
            return Err(TaskError::ForbiddenByRole(
                "only coordinators may create top-level tasks".into(),
            ));
        }
        let (board, task_id) = self
            .apply_mutation(team_id, |board| {
                let now = crate::now_ms();
                let mut task = Task::new_top_level(fields.title.clone(), session_id, now);
                task.description = fields.description.clone();
                task.priority = fields.priority.unwrap_or(Priority::Medium);
                task.assignee_id = fields.assignee_id.clone();
                task.labels = fields.labels.clone();
                let id = task.id;
                board.tasks.insert(id, task);
                Ok(id)
            })
            .await?;
        let task = board.tasks.get(&task_id).cloned().expect("just inserted");
        self.broadcast(team_id, session_id, StateChangeEvent::TaskCreated(task.clone()))
            .await;
        Ok(task)
    }

    /// `update-task(id, delta)`: workers may modify only tasks assigned to
    /// themselves, or self-claim an unassigned task; reviewers are
    /// read-only; coordinators may modify freely.
    pub async fn update_task(
        &self,
        team_id: &str,
        role: &str,
        session_id: &str,
        id: Uuid,
        delta: TaskDelta,
    ) -> Result<Task, TaskError> {
        let (board, task_id) = self
            .apply_mutation(team_id, |board| {
                let task = board.tasks.get(&id).ok_or(TaskError::NotFound(id))?;
                check_update_permission(task, role, session_id)?;
                let now = crate::now_ms();
                let task = board.tasks.get_mut(&id).expect("checked above");
                if let Some(title) = &delta.title {
                    task.title = title.clone();
                }
                if let Some(desc) = &delta.description {
                    task.description = desc.clone();
                }
                if let Some(status) = delta.status {
                    task.status = status;
                }
                if let Some(assignee) = &delta.assignee_id {
                    task.assignee_id = assignee.clone();
                }
                if let Some(priority) = delta.priority {
                    task.priority = priority;
                }
                if let Some(labels) = &delta.labels {
                    task.labels = labels.clone();
                }
                task.updated_at = now;
                Ok(id)
            })
            .await?;
        let task = board.tasks.get(&task_id).cloned().expect("just updated");
        self.broadcast(team_id, session_id, StateChangeEvent::TaskUpdated(task.clone()))
            .await;
        Ok(task)
    }

    /// `delete-task(id)`: coordinators only.
    pub async fn delete_task(
        &self,
        team_id: &str,
        role: &str,
        session_id: &str,
        id: Uuid,
    ) -> Result<(), TaskError> {
        if !role::is_coordinator(role) {
            return Err(TaskError::ForbiddenByRole(
                "only coordinators may delete tasks".into(),
            ));
        }
        self.apply_mutation(team_id, |board| {
            let task = board.tasks.get(&id).ok_or(TaskError::NotFound(id))?.clone();
            if task.status_propagation.cascade_delete_subtasks {
                delete_subtree(board, id);
            } else {
                board.tasks.remove(&id);
            }
            if let Some(parent_id) = task.parent_task_id {
                if let Some(parent) = board.tasks.get_mut(&parent_id) {
                    parent.subtask_ids.retain(|c| *c != id);
                }
            }
            Ok(id)
        })
        .await?;
        self.broadcast(team_id, session_id, StateChangeEvent::TaskDeleted(id))
            .await;
        Ok(())
    }

    /// `create-subtask(parent-id, fields)`: fails with `depth-exceeded` when
    /// the parent is already at depth 3; inherits assignee and priority from
    /// the parent unless overridden; transitions a `todo` parent to
    /// `in-progress` atomically. No role gate beyond `depth-exceeded` — unlike
    /// `update-task`, creating a subtask is not restricted to the parent's
    /// assignee or a coordinator (see DESIGN.md).
    pub async fn create_subtask(
        &self,
        team_id: &str,
        _role: &str,
        session_id: &str,
        parent_id: Uuid,
        fields: NewTaskFields,
    ) -> Result<Task, TaskError> {
        let (board, task_id) = self
            .apply_mutation(team_id, |board| {
                let parent = board
                    .tasks
                    .get(&parent_id)
                    .ok_or(TaskError::NotFound(parent_id))?
                    .clone();
                if parent.depth >= 3 {
                    return Err(TaskError::DepthExceeded);
                }
                let now = crate::now_ms();
                let mut child = Task::new_top_level(fields.title.clone(), session_id, now);
                child.description = fields.description.clone();
                child.parent_task_id = Some(parent_id);
                child.depth = parent.depth + 1;
                child.priority = fields.priority.unwrap_or(parent.priority);
                child.assignee_id = fields.assignee_id.clone().or_else(|| parent.assignee_id.clone());
                child.labels = fields.labels.clone();
                let child_id = child.id;

                board.tasks.insert(child_id, child);
                let parent_mut = board.tasks.get_mut(&parent_id).expect("checked above");
                parent_mut.subtask_ids.push(child_id);
                if parent_mut.status == TaskStatus::Todo {
                    parent_mut.status = TaskStatus::InProgress;
                }
                parent_mut.updated_at = now;

                Ok(child_id)
            })
            .await?;
        let task = board.tasks.get(&task_id).cloned().expect("just inserted");
        self.broadcast(team_id, session_id, StateChangeEvent::TaskCreated(task.clone()))
            .await;
        Ok(task)
    }

    /// `start-task(id)`: appends a `primary`/`active` execution link; fails
    /// if another session already holds an active link and the requester is
    /// not a coordinator; a `todo` task becomes `in-progress`.
    pub async fn start_task(
        &self,
        team_id: &str,
        role: &str,
        session_id: &str,
        id: Uuid,
    ) -> Result<Task, TaskError> {
        let (board, task_id) = self
            .apply_mutation(team_id, |board| {
                let now = crate::now_ms();
                let task = board.tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
                if let Some(active) = task.active_execution_link() {
                    if active.session_id != session_id && !role::is_coordinator(role) {
                        return Err(TaskError::AlreadyActive);
                    }
                }
                task.execution_links.push(ExecutionLink {
                    session_id: session_id.to_string(),
                    linked_at: now,
                    role: ExecutionLinkRole::Primary,
                    status: ExecutionLinkStatus::Active,
                });
                if task.status == TaskStatus::Todo {
                    task.status = TaskStatus::InProgress;
                }
                task.updated_at = now;
                Ok(id)
            })
            .await?;
        let task = board.tasks.get(&task_id).cloned().expect("just updated");
        self.broadcast(team_id, session_id, StateChangeEvent::TaskUpdated(task.clone()))
            .await;
        Ok(task)
    }

    /// `complete-task(id)`: fails with `subtasks-incomplete` if any child is
    /// not `done`; flips the requester's active link to `completed`, sets
    /// status `done`, and propagates `review` up the ancestor chain while
    /// `auto-complete-parent` holds at each level.
    pub async fn complete_task(
        &self,
        team_id: &str,
        session_id: &str,
        id: Uuid,
    ) -> Result<Task, TaskError> {
        let (board, task_id) = self
            .apply_mutation(team_id, |board| {
                let now = crate::now_ms();
                let incomplete = board
                    .children_of(id)
                    .iter()
                    .any(|c| c.status != TaskStatus::Done);
                if incomplete {
                    return Err(TaskError::SubtasksIncomplete);
                }
                let task = board.tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
                for link in task.execution_links.iter_mut() {
                    if link.session_id == session_id && link.status == ExecutionLinkStatus::Active {
                        link.status = ExecutionLinkStatus::Completed;
                    }
                }
                task.status = TaskStatus::Done;
                task.updated_at = now;
                propagate_completion(board, id, now);
                Ok(id)
            })
            .await?;
        let task = board.tasks.get(&task_id).cloned().expect("just updated");
        self.broadcast(team_id, session_id, StateChangeEvent::TaskUpdated(task.clone()))
            .await;
        Ok(task)
    }

    /// `report-blocker(id, type, description)`: appends a blocker, sets
    /// status `blocked`, and propagates `has-blocked-child=true` up the
    /// ancestor chain while `block-parent-on-blocked` holds.
    pub async fn report_blocker(
        &self,
        team_id: &str,
        session_id: &str,
        id: Uuid,
        kind: BlockerType,
        description: impl Into<String>,
    ) -> Result<Task, TaskError> {
        let description = description.into();
        let (board, task_id) = self
            .apply_mutation(team_id, |board| {
                let now = crate::now_ms();
                let task = board.tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
                task.blockers.push(Blocker {
                    id: Uuid::new_v4(),
                    kind,
                    description: description.clone(),
                    raised_at: now,
                    raised_by: session_id.to_string(),
                    resolved_at: None,
                    resolved_by: None,
                    resolution: None,
                });
                task.status = TaskStatus::Blocked;
                task.updated_at = now;
                propagate_blocker_set(board, id, now);
                Ok(id)
            })
            .await?;
        let task = board.tasks.get(&task_id).cloned().expect("just updated");
        self.broadcast(team_id, session_id, StateChangeEvent::TaskUpdated(task.clone()))
            .await;
        Ok(task)
    }

    /// `resolve-blocker(id, blocker-id, resolution)`: coordinator-only;
    /// returns the task to `in-progress` once no unresolved blockers remain,
    /// and re-derives `has-blocked-child` bottom-up to a fixpoint.
    pub async fn resolve_blocker(
        &self,
        team_id: &str,
        role: &str,
        session_id: &str,
        id: Uuid,
        blocker_id: Uuid,
        resolution: impl Into<String>,
    ) -> Result<Task, TaskError> {
        if !role::is_coordinator(role) {
            return Err(TaskError::ForbiddenByRole(
                "only coordinators may resolve blockers".into(),
            ));
        }
        let resolution = resolution.into();
        let (board, task_id) = self
            .apply_mutation(team_id, |board| {
                let now = crate::now_ms();
                let task = board.tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
                let blocker = task
                    .blockers
                    .iter_mut()
                    .find(|b| b.id == blocker_id)
                    .ok_or(TaskError::NotFound(blocker_id))?;
                blocker.resolved_at = Some(now);
                blocker.resolved_by = Some(session_id.to_string());
                blocker.resolution = Some(resolution.clone());

                if task.unresolved_blockers().count() == 0 {
                    task.status = TaskStatus::InProgress;
                }
                task.updated_at = now;
                propagate_blocker_clear(board, id, now);
                Ok(id)
            })
            .await?;
        let task = board.tasks.get(&task_id).cloned().expect("just updated");
        self.broadcast(team_id, session_id, StateChangeEvent::TaskUpdated(task.clone()))
            .await;
        Ok(task)
    }

    /// `list-subtasks(parent-id, include-nested?)`. Read-only traversal;
    /// eligible for the §4.2.1 cache fallback.
    pub async fn list_subtasks(
        &self,
        team_id: &str,
        parent_id: Uuid,
        include_nested: bool,
    ) -> Result<Vec<Task>, TaskError> {
        let board = self.board_or_cache(team_id).await?;
        if !include_nested {
            return Ok(board.children_of(parent_id).into_iter().cloned().collect());
        }
        let mut out = Vec::new();
        let mut stack: Vec<Uuid> = board
            .tasks
            .get(&parent_id)
            .map(|t| t.subtask_ids.clone())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if let Some(t) = board.tasks.get(&id) {
                stack.extend(t.subtask_ids.iter().copied());
                out.push(t.clone());
            }
        }
        Ok(out)
    }

    /// `get-task-tree(root-id)`. Read-only traversal; eligible for the
    /// §4.2.1 cache fallback.
    pub async fn get_task_tree(&self, team_id: &str, root_id: Uuid) -> Result<TaskTree, TaskError> {
        let board = self.board_or_cache(team_id).await?;
        build_tree(&board, root_id).ok_or(TaskError::NotFound(root_id))
    }

    // ── internals ──────────────────────────────────────────────────────────

    async fn board_or_cache(&self, team_id: &str) -> Result<Board, TaskError> {
        match self.load_or_init(team_id).await {
            Ok(cached) => Ok(cached.board),
            Err(TaskError::TransientServerError(msg)) => {
                let cache = self.cache.lock().await;
                if let Some(cached) = cache.get(team_id) {
                    tracing::warn!(team_id, error = %msg, "read-only traversal serving stale cache after transient error");
                    Ok(cached.board.clone())
                } else {
                    Err(TaskError::TransientServerError(msg))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn load_or_init(&self, team_id: &str) -> Result<CachedBoard, TaskError> {
        match self.server.get_artifact(team_id).await? {
            Some(artifact) => {
                let cached = CachedBoard {
                    board: artifact.body,
                    header_version: artifact.header_version,
                    body_version: artifact.body_version,
                };
                self.cache
                    .lock()
                    .await
                    .insert(team_id.to_string(), cached.clone());
                Ok(cached)
            }
            None => {
                let artifact = self
                    .server
                    .create_artifact(team_id, Board::with_default_columns())
                    .await?;
                let cached = CachedBoard {
                    board: artifact.body,
                    header_version: artifact.header_version,
                    body_version: artifact.body_version,
                };
                self.cache
                    .lock()
                    .await
                    .insert(team_id.to_string(), cached.clone());
                Ok(cached)
            }
        }
    }

    /// Reads the current board, applies `mutate` to a clone, writes it back
    /// with CAS. On `version-conflict` re-reads and retries `mutate` from
    /// scratch, bounded by `config.task_retry_bound`; on exhaustion surfaces
    /// `conflict-unresolved` without attempting further writes.
    async fn apply_mutation<F>(&self, team_id: &str, mut mutate: F) -> Result<(Board, Uuid), TaskError>
    where
        F: FnMut(&mut Board) -> Result<Uuid, TaskError>,
    {
        let mut retries_left = self.config.task_retry_bound;
        loop {
            let cached = self.load_or_init(team_id).await?;
            let mut board = cached.board;
            let task_id = mutate(&mut board)?;
            match self
                .server
                .update_artifact(
                    team_id,
                    board.clone(),
                    cached.header_version,
                    cached.body_version,
                )
                .await
            {
                Ok(artifact) => {
                    let updated = CachedBoard {
                        board: artifact.body.clone(),
                        header_version: artifact.header_version,
                        body_version: artifact.body_version,
                    };
                    self.cache.lock().await.insert(team_id.to_string(), updated);
                    return Ok((artifact.body, task_id));
                }
                Err(TaskError::VersionConflict) => {
                    if retries_left == 0 {
                        return Err(TaskError::ConflictUnresolved {
                            retries: self.config.task_retry_bound,
                        });
                    }
                    retries_left -= 1;
                    tracing::debug!(team_id, retries_left, "version conflict, retrying mutation");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Publish the state-change event to local subscribers and send a
    /// formatted `task-update` team message. State-change broadcasts are
    /// emitted only after the server commit has already succeeded (§5's
    /// ordering guarantee). Best-effort: a failed team-message send is
    /// logged, never surfaced to the caller — the mutation itself already
    /// committed.
    async fn broadcast(&self, team_id: &str, actor_session_id: &str, event: StateChangeEvent) {
        let rendering = render_event(&event);
        self.events.publish(event);

        let message = TeamMessage::new(
            team_id,
            rendering,
            MessageTypeTag::TaskUpdate,
            actor_session_id,
            crate::now_ms(),
        );
        if let Err(e) = self.server.send_team_message(message).await {
            tracing::warn!(team_id, error = %e, "task-update broadcast message failed to send");
        }
    }
}

/// One node of a [`TaskStateManager::get_task_tree`] result.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTree {
    pub task: Task,
    pub children: Vec<TaskTree>,
}

fn build_tree(board: &Board, id: Uuid) -> Option<TaskTree> {
    let task = board.tasks.get(&id)?.clone();
    let children = task
        .subtask_ids
        .iter()
        .filter_map(|c| build_tree(board, *c))
        .collect();
    Some(TaskTree { task, children })
}

fn delete_subtree(board: &mut Board, id: Uuid) {
    if let Some(task) = board.tasks.remove(&id) {
        for child in task.subtask_ids {
            delete_subtree(board, child);
        }
    }
}

/// Workers may only modify a task assigned to themselves, or self-claim an
/// unassigned task; read-only roles (reviewers, etc.) may never mutate;
/// coordinators bypass this check entirely at the call site.
fn check_update_permission(task: &Task, role: &str, session_id: &str) -> Result<(), TaskError> {
    if role::is_coordinator(role) {
        return Ok(());
    }
    if let Some(def) = role::lookup(role) {
        if def.access_level == crate::role::AccessLevel::ReadOnly {
            return Err(TaskError::ForbiddenByRole(format!(
                "role {role} is read-only"
            )));
        }
    }
    match &task.assignee_id {
        None => Ok(()),
        Some(assignee) if assignee == session_id => Ok(()),
        Some(_) => Err(TaskError::ForbiddenByRole(
            "task is assigned to a different session".into(),
        )),
    }
}

/// Completion propagation (§4.2): if every sibling under `parent` is `done`
/// and `parent.auto_complete_parent` holds, set `parent.status = review` and
/// repeat upward while the invariant continues to hold.
fn propagate_completion(board: &mut Board, task_id: Uuid, now: i64) {
    let mut current = task_id;
    loop {
        let Some(parent_id) = board.tasks.get(&current).and_then(|t| t.parent_task_id) else {
            break;
        };
        let Some(parent) = board.tasks.get(&parent_id) else {
            break;
        };
        if !parent.status_propagation.auto_complete_parent {
            break;
        }
        let all_done = parent
            .subtask_ids
            .iter()
            .all(|cid| board.tasks.get(cid).map(|c| c.status == TaskStatus::Done).unwrap_or(false));
        if !all_done {
            break;
        }
        let parent_mut = board.tasks.get_mut(&parent_id).expect("checked above");
        parent_mut.status = TaskStatus::Review;
        parent_mut.updated_at = now;
        current = parent_id;
    }
}

/// Blocker propagation, set direction (§4.2): walk ancestors, setting
/// `has_blocked_child = true`, stopping once an ancestor's
/// `block_parent_on_blocked` policy is false.
fn propagate_blocker_set(board: &mut Board, task_id: Uuid, now: i64) {
    let mut current = task_id;
    loop {
        let Some(parent_id) = board.tasks.get(&current).and_then(|t| t.parent_task_id) else {
            break;
        };
        let Some(parent) = board.tasks.get(&parent_id) else {
            break;
        };
        if !parent.status_propagation.block_parent_on_blocked {
            break;
        }
        let parent_mut = board.tasks.get_mut(&parent_id).expect("checked above");
        parent_mut.has_blocked_child = true;
        parent_mut.updated_at = now;
        current = parent_id;
    }
}

/// Blocker propagation, clear direction (§4.2): re-derive
/// `has_blocked_child` of each ancestor from its immediate children, walking
/// up until a re-derivation produces no change (fixpoint).
fn propagate_blocker_clear(board: &mut Board, task_id: Uuid, now: i64) {
    let mut current = task_id;
    loop {
        let Some(parent_id) = board.tasks.get(&current).and_then(|t| t.parent_task_id) else {
            break;
        };
        let derived = board
            .children_of(parent_id)
            .iter()
            .any(|c| c.status == TaskStatus::Blocked || c.has_blocked_child);
        let Some(parent) = board.tasks.get_mut(&parent_id) else {
            break;
        };
        let changed = parent.has_blocked_child != derived;
        parent.has_blocked_child = derived;
        if changed {
            parent.updated_at = now;
        }
        if !changed {
            break;
        }
        current = parent_id;
    }
}

fn render_event(event: &StateChangeEvent) -> String {
    match event {
        StateChangeEvent::TaskCreated(t) => format!("task created: \"{}\" ({})", t.title, t.id),
        StateChangeEvent::TaskUpdated(t) => {
            format!("task updated: \"{}\" -> {:?} ({})", t.title, t.status, t.id)
        }
        StateChangeEvent::TaskDeleted(id) => format!("task deleted: {id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_client::FakeServerClient;

    fn manager() -> TaskStateManager {
        TaskStateManager::new(
            Arc::new(FakeServerClient::new()),
            Arc::new(TeamRuntimeConfig::default()),
            Arc::new(EventBus::default()),
        )
    }

    // S1 — coordinator creates a subtask chain down to depth-exceeded.
    #[tokio::test]
    async fn s1_subtask_chain_to_depth_exceeded() {
        let mgr = manager();
        let t1 = mgr
            .create_task("team-a", "master", "master-1", NewTaskFields::titled("Build feature"))
            .await
            .unwrap();
        assert_eq!(t1.depth, 0);

        let t2 = mgr
            .create_subtask("team-a", "master", "master-1", t1.id, NewTaskFields::titled("Backend"))
            .await
            .unwrap();
        assert_eq!(t2.depth, 1);
        let t1_after = mgr.get_task("team-a", t1.id).await.unwrap();
        assert_eq!(t1_after.status, TaskStatus::InProgress);

        let t3 = mgr
            .create_subtask("team-a", "master", "master-1", t2.id, NewTaskFields::titled("Auth module"))
            .await
            .unwrap();
        assert_eq!(t3.depth, 2);

        let t4 = mgr
            .create_subtask("team-a", "master", "master-1", t3.id, NewTaskFields::titled("JWT lib"))
            .await
            .unwrap();
        assert_eq!(t4.depth, 3);

        let err = mgr
            .create_subtask("team-a", "master", "master-1", t4.id, NewTaskFields::titled("X"))
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::DepthExceeded);
    }

    // S2 — completion propagation.
    #[tokio::test]
    async fn s2_completion_propagates_to_review() {
        let mgr = manager();
        let t1 = mgr
            .create_task("team-a", "master", "master-1", NewTaskFields::titled("Build feature"))
            .await
            .unwrap();
        let t2 = mgr
            .create_subtask("team-a", "master", "master-1", t1.id, NewTaskFields::titled("Backend"))
            .await
            .unwrap();
        let t3 = mgr
            .create_subtask("team-a", "master", "master-1", t2.id, NewTaskFields::titled("Auth module"))
            .await
            .unwrap();
        let t4 = mgr
            .create_subtask("team-a", "master", "master-1", t3.id, NewTaskFields::titled("JWT lib"))
            .await
            .unwrap();

        mgr.update_task(
            "team-a",
            "master",
            "master-1",
            t3.id,
            TaskDelta {
                assignee_id: Some(Some("builder-1".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        mgr.update_task(
            "team-a",
            "master",
            "master-1",
            t4.id,
            TaskDelta {
                assignee_id: Some(Some("builder-1".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let err = mgr
            .complete_task("team-a", "builder-1", t3.id)
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::SubtasksIncomplete);

        let t4_done = mgr.complete_task("team-a", "builder-1", t4.id).await.unwrap();
        assert_eq!(t4_done.status, TaskStatus::Done);
        let t3_unchanged = mgr.get_task("team-a", t3.id).await.unwrap();
        assert_ne!(t3_unchanged.status, TaskStatus::Done);

        let t3_done = mgr.complete_task("team-a", "builder-1", t3.id).await.unwrap();
        assert_eq!(t3_done.status, TaskStatus::Done);
        let t2_after = mgr.get_task("team-a", t2.id).await.unwrap();
        assert_eq!(t2_after.status, TaskStatus::Review);
        let t1_after = mgr.get_task("team-a", t1.id).await.unwrap();
        assert_eq!(t1_after.status, TaskStatus::Review);
    }

    // S3 — blocker propagation set and clear.
    #[tokio::test]
    async fn s3_blocker_propagation_set_and_clear() {
        let mgr = manager();
        let t1 = mgr
            .create_task("team-a", "master", "master-1", NewTaskFields::titled("Build feature"))
            .await
            .unwrap();
        let t2 = mgr
            .create_subtask("team-a", "master", "master-1", t1.id, NewTaskFields::titled("Backend"))
            .await
            .unwrap();
        let t3 = mgr
            .create_subtask("team-a", "master", "master-1", t2.id, NewTaskFields::titled("Auth module"))
            .await
            .unwrap();
        let t4 = mgr
            .create_subtask("team-a", "master", "master-1", t3.id, NewTaskFields::titled("JWT lib"))
            .await
            .unwrap();
        mgr.update_task(
            "team-a",
            "master",
            "master-1",
            t4.id,
            TaskDelta {
                assignee_id: Some(Some("builder-1".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let t4_blocked = mgr
            .report_blocker(
                "team-a",
                "builder-1",
                t4.id,
                BlockerType::Technical,
                "missing key",
            )
            .await
            .unwrap();
        assert_eq!(t4_blocked.status, TaskStatus::Blocked);
        assert!(mgr.get_task("team-a", t3.id).await.unwrap().has_blocked_child);
        assert!(mgr.get_task("team-a", t2.id).await.unwrap().has_blocked_child);
        assert!(mgr.get_task("team-a", t1.id).await.unwrap().has_blocked_child);

        let blocker_id = t4_blocked.blockers[0].id;
        let t4_resolved = mgr
            .resolve_blocker(
                "team-a",
                "master",
                "master-1",
                t4.id,
                blocker_id,
                "key provisioned",
            )
            .await
            .unwrap();
        assert_eq!(t4_resolved.status, TaskStatus::InProgress);
        assert!(!mgr.get_task("team-a", t3.id).await.unwrap().has_blocked_child);
        assert!(!mgr.get_task("team-a", t2.id).await.unwrap().has_blocked_child);
        assert!(!mgr.get_task("team-a", t1.id).await.unwrap().has_blocked_child);
    }

    #[tokio::test]
    async fn create_task_forbidden_for_non_coordinator() {
        let mgr = manager();
        let err = mgr
            .create_task("team-a", "builder", "builder-1", NewTaskFields::titled("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ForbiddenByRole(_)));
    }

    #[tokio::test]
    async fn worker_cannot_update_another_sessions_task() {
        let mgr = manager();
        let t1 = mgr
            .create_task("team-a", "master", "master-1", NewTaskFields::titled("x"))
            .await
            .unwrap();
        mgr.update_task(
            "team-a",
            "master",
            "master-1",
            t1.id,
            TaskDelta {
                assignee_id: Some(Some("builder-1".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let err = mgr
            .update_task(
                "team-a",
                "builder",
                "builder-2",
                t1.id,
                TaskDelta {
                    title: Some("hijacked".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ForbiddenByRole(_)));
    }

    #[tokio::test]
    async fn reviewer_cannot_mutate() {
        let mgr = manager();
        let t1 = mgr
            .create_task("team-a", "master", "master-1", NewTaskFields::titled("x"))
            .await
            .unwrap();
        let err = mgr
            .update_task(
                "team-a",
                "reviewer",
                "reviewer-1",
                t1.id,
                TaskDelta {
                    title: Some("nope".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ForbiddenByRole(_)));
    }

    #[tokio::test]
    async fn worker_self_claims_unassigned_task() {
        let mgr = manager();
        let t1 = mgr
            .create_task("team-a", "master", "master-1", NewTaskFields::titled("x"))
            .await
            .unwrap();
        let claimed = mgr
            .update_task(
                "team-a",
                "builder",
                "builder-1",
                t1.id,
                TaskDelta {
                    assignee_id: Some(Some("builder-1".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(claimed.assignee_id, Some("builder-1".to_string()));
    }

    #[tokio::test]
    async fn start_task_fails_when_another_session_holds_active_link() {
        let mgr = manager();
        let t1 = mgr
            .create_task("team-a", "master", "master-1", NewTaskFields::titled("x"))
            .await
            .unwrap();
        mgr.start_task("team-a", "builder", "builder-1", t1.id)
            .await
            .unwrap();
        let err = mgr
            .start_task("team-a", "builder", "builder-2", t1.id)
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::AlreadyActive);
    }

    #[tokio::test]
    async fn coordinator_can_start_task_despite_active_link() {
        let mgr = manager();
        let t1 = mgr
            .create_task("team-a", "master", "master-1", NewTaskFields::titled("x"))
            .await
            .unwrap();
        mgr.start_task("team-a", "builder", "builder-1", t1.id)
            .await
            .unwrap();
        mgr.start_task("team-a", "master", "master-1", t1.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn get_board_lazily_initializes_empty_team() {
        let mgr = manager();
        let tasks = mgr.get_board("brand-new-team").await.unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn get_task_tree_assembles_nested_structure() {
        let mgr = manager();
        let t1 = mgr
            .create_task("team-a", "master", "master-1", NewTaskFields::titled("root"))
            .await
            .unwrap();
        let t2 = mgr
            .create_subtask("team-a", "master", "master-1", t1.id, NewTaskFields::titled("child"))
            .await
            .unwrap();
        let tree = mgr.get_task_tree("team-a", t1.id).await.unwrap();
        assert_eq!(tree.task.id, t1.id);
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].task.id, t2.id);
    }

    #[tokio::test]
    async fn delete_task_removes_from_parent_subtask_ids() {
        let mgr = manager();
        let t1 = mgr
            .create_task("team-a", "master", "master-1", NewTaskFields::titled("root"))
            .await
            .unwrap();
        let t2 = mgr
            .create_subtask("team-a", "master", "master-1", t1.id, NewTaskFields::titled("child"))
            .await
            .unwrap();
        mgr.delete_task("team-a", "master", "master-1", t2.id)
            .await
            .unwrap();
        let t1_after = mgr.get_task("team-a", t1.id).await.unwrap();
        assert!(!t1_after.subtask_ids.contains(&t2.id));
    }

    #[tokio::test]
    async fn state_change_events_are_published() {
        let mgr = manager();
        let mut rx = mgr.events.subscribe();
        mgr.create_task("team-a", "master", "master-1", NewTaskFields::titled("x"))
            .await
            .unwrap();
        let evt = rx.recv().await.unwrap();
        assert!(matches!(evt, StateChangeEvent::TaskCreated(_)));
    }
}
