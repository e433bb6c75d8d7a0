// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Kanban board data model: `Task`, `Board`, and the pure `TaskFilter`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Review,
    Done,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    NotRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerType {
    Dependency,
    Question,
    Resource,
    Technical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: BlockerType,
    pub description: String,
    pub raised_at: i64,
    pub raised_by: String,
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
    pub resolution: Option<String>,
}

impl Blocker {
    pub fn is_unresolved(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLinkRole {
    Primary,
    Supporting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLinkStatus {
    Active,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLink {
    pub session_id: String,
    pub linked_at: i64,
    pub role: ExecutionLinkRole,
    pub status: ExecutionLinkStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusPropagation {
    pub auto_complete_parent: bool,
    pub block_parent_on_blocked: bool,
    pub cascade_delete_subtasks: bool,
}

impl Default for StatusPropagation {
    fn default() -> Self {
        Self {
            auto_complete_parent: true,
            block_parent_on_blocked: true,
            cascade_delete_subtasks: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assignee_id: Option<String>,
    pub reporter_id: String,
    pub priority: Priority,
    pub created_at: i64,
    pub updated_at: i64,
    pub parent_task_id: Option<Uuid>,
    pub subtask_ids: Vec<Uuid>,
    pub depth: u8,
    pub execution_links: Vec<ExecutionLink>,
    pub blockers: Vec<Blocker>,
    pub has_blocked_child: bool,
    pub labels: Vec<String>,
    pub approval_status: Option<ApprovalStatus>,
    pub status_propagation: StatusPropagation,
}

impl Task {
    pub fn new_top_level(title: impl Into<String>, reporter_id: impl Into<String>, now: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            assignee_id: None,
            reporter_id: reporter_id.into(),
            priority: Priority::Medium,
            created_at: now,
            updated_at: now,
            parent_task_id: None,
            subtask_ids: Vec::new(),
            depth: 0,
            execution_links: Vec::new(),
            blockers: Vec::new(),
            has_blocked_child: false,
            labels: Vec::new(),
            approval_status: None,
            status_propagation: StatusPropagation::default(),
        }
    }

    pub fn active_execution_link(&self) -> Option<&ExecutionLink> {
        self.execution_links
            .iter()
            .find(|l| l.status == ExecutionLinkStatus::Active)
    }

    pub fn unresolved_blockers(&self) -> impl Iterator<Item = &Blocker> {
        self.blockers.iter().filter(|b| b.is_unresolved())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub title: String,
}

/// Shared, server-owned Kanban board, cached locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Board {
    pub columns: Vec<Column>,
    pub tasks: std::collections::HashMap<Uuid, Task>,
}

impl Board {
    pub fn with_default_columns() -> Self {
        Self {
            columns: vec![
                Column {
                    id: "todo".into(),
                    title: "Todo".into(),
                },
                Column {
                    id: "in-progress".into(),
                    title: "In Progress".into(),
                },
                Column {
                    id: "review".into(),
                    title: "Review".into(),
                },
                Column {
                    id: "done".into(),
                    title: "Done".into(),
                },
            ],
            tasks: std::collections::HashMap::new(),
        }
    }

    pub fn children_of(&self, id: Uuid) -> Vec<&Task> {
        self.tasks
            .get(&id)
            .map(|t| {
                t.subtask_ids
                    .iter()
                    .filter_map(|cid| self.tasks.get(cid))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Summary stats returned alongside a filtered task view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub todo: usize,
    pub in_progress: usize,
    pub review: usize,
    pub done: usize,
    pub blocked: usize,
}

/// Result of `(tasks, role, session id) -> {mine, available, stats,
/// pending-approvals, recent}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskFilterResult {
    pub mine: Vec<Task>,
    pub available: Vec<Task>,
    pub stats: TaskStats,
    pub pending_approvals: Vec<Task>,
    pub recent: Vec<Task>,
}

/// Pure function over `(tasks, role, session id)`. Workers see only tasks
/// assigned to them, unassigned `todo` tasks, and team-level fields;
/// coordinators see everything — mirrors the filtering rule the team-join
/// ritual (§4.3 step 5) applies to the initial context bundle.
pub fn filter_tasks(tasks: &[Task], role: &str, session_id: &str) -> TaskFilterResult {
    let mut result = TaskFilterResult::default();

    let coordinator = crate::role::is_coordinator(role);

    let mut stats = TaskStats::default();
    for t in tasks {
        stats.total += 1;
        match t.status {
            TaskStatus::Todo => stats.todo += 1,
            TaskStatus::InProgress => stats.in_progress += 1,
            TaskStatus::Review => stats.review += 1,
            TaskStatus::Done => stats.done += 1,
            TaskStatus::Blocked => stats.blocked += 1,
        }
        if t.assignee_id.as_deref() == Some(session_id) {
            result.mine.push(t.clone());
        }
        if coordinator || t.assignee_id.is_none() {
            if coordinator || t.status == TaskStatus::Todo {
                result.available.push(t.clone());
            }
        }
        if matches!(t.approval_status, Some(ApprovalStatus::Pending)) {
            result.pending_approvals.push(t.clone());
        }
    }
    result.stats = stats;

    let mut recent: Vec<Task> = tasks.to_vec();
    recent.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    recent.truncate(20);
    result.recent = recent;

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(status: TaskStatus, assignee: Option<&str>) -> Task {
        let mut t = Task::new_top_level("t", "reporter", 0);
        t.status = status;
        t.assignee_id = assignee.map(|s| s.to_string());
        t
    }

    #[test]
    fn board_default_columns_match_spec() {
        let board = Board::with_default_columns();
        let ids: Vec<&str> = board.columns.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["todo", "in-progress", "review", "done"]);
    }

    #[test]
    fn unresolved_blockers_excludes_resolved() {
        let mut t = Task::new_top_level("t", "r", 0);
        t.blockers.push(Blocker {
            id: Uuid::new_v4(),
            kind: BlockerType::Technical,
            description: "x".into(),
            raised_at: 0,
            raised_by: "r".into(),
            resolved_at: Some(1),
            resolved_by: Some("r".into()),
            resolution: Some("fixed".into()),
        });
        assert_eq!(t.unresolved_blockers().count(), 0);
    }

    #[test]
    fn filter_worker_sees_own_and_unassigned_todo() {
        let tasks = vec![
            sample_task(TaskStatus::InProgress, Some("session-a")),
            sample_task(TaskStatus::Todo, None),
            sample_task(TaskStatus::Done, Some("session-b")),
        ];
        let result = filter_tasks(&tasks, "builder", "session-a");
        assert_eq!(result.mine.len(), 1);
        assert_eq!(result.available.len(), 1);
        assert_eq!(result.stats.total, 3);
    }

    #[test]
    fn filter_coordinator_sees_everything_available() {
        let tasks = vec![
            sample_task(TaskStatus::InProgress, Some("session-a")),
            sample_task(TaskStatus::Done, Some("session-b")),
        ];
        let result = filter_tasks(&tasks, "master", "session-z");
        assert_eq!(result.available.len(), 2);
    }

    #[test]
    fn recent_is_capped_at_twenty_and_sorted_newest_first() {
        let mut tasks = Vec::new();
        for i in 0..30 {
            let mut t = Task::new_top_level("t", "r", i as i64);
            t.updated_at = i as i64;
            tasks.push(t);
        }
        let result = filter_tasks(&tasks, "builder", "s");
        assert_eq!(result.recent.len(), 20);
        assert_eq!(result.recent[0].updated_at, 29);
    }
}
