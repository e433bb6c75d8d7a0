// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Team messages and the filter decision that decides which arriving
//! messages deserve an agent turn (§4.3).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::TeamRuntimeConfig;
use crate::error::PipelineError;
use crate::server_client::ServerClient;
use crate::storage::MessageStore;
use crate::turn::{PolicySnapshot, TurnQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageTypeTag {
    Chat,
    TaskUpdate,
    Notification,
    HelpNeeded,
    CollaborationRequest,
    Handoff,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMessage {
    pub id: Uuid,
    pub team_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_content: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageTypeTag,
    pub timestamp: i64,
    pub from_session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl TeamMessage {
    pub fn new(
        team_id: impl Into<String>,
        content: impl Into<String>,
        kind: MessageTypeTag,
        from_session_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        let content = content.into();
        let short_content = if content.chars().count() > 160 {
            Some(content.chars().take(160).collect())
        } else {
            None
        };
        Self {
            id: Uuid::new_v4(),
            team_id: team_id.into(),
            content,
            short_content,
            kind,
            timestamp,
            from_session_id: from_session_id.into(),
            from_role: None,
            mentions: Vec::new(),
            metadata: None,
        }
    }

    fn priority_is_urgent(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("priority"))
            .and_then(|v| v.as_str())
            .map(|s| s.eq_ignore_ascii_case("urgent"))
            .unwrap_or(false)
    }
}

/// Outcome of [`filter_decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Ignore,
    /// Respond, optionally with a `[MENTIONED]` banner.
    Respond { mentioned: bool },
}

fn from_role_is_user(from_role: Option<&str>) -> bool {
    match from_role {
        None => true,
        Some("") => true,
        Some(r) => r.eq_ignore_ascii_case("user"),
    }
}

fn mentions_role(content: &str, role: &str) -> bool {
    let needle = format!("@{role}");
    content.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}

/// `(m, r, s, T) -> respond | ignore`, per §4.3's filter decision.
pub fn filter_decision(
    m: &TeamMessage,
    role: &str,
    session_id: &str,
    team_id: &str,
) -> FilterOutcome {
    if m.team_id != team_id {
        return FilterOutcome::Ignore;
    }

    let mentioned = m.mentions.iter().any(|s| s == session_id) || mentions_role(&m.content, role);

    let from_role = m.from_role.as_deref();
    let is_user = from_role_is_user(from_role);

    if crate::role::is_coordinator(role) {
        return FilterOutcome::Respond { mentioned };
    }

    if crate::role::is_worker(role) {
        let from_coordinator = from_role.map(crate::role::is_coordinator).unwrap_or(false);
        let widened = from_role
            .map(|r| crate::role::collaborators(role).contains(&r))
            .unwrap_or(false);
        let respond = mentioned
            || from_coordinator
            || is_user
            || m.kind == MessageTypeTag::TaskUpdate
            || widened;
        return if respond {
            FilterOutcome::Respond { mentioned }
        } else {
            FilterOutcome::Ignore
        };
    }

    // Unclassified role.
    let respond = mentioned || m.priority_is_urgent() || m.kind == MessageTypeTag::TaskUpdate;
    if respond {
        FilterOutcome::Respond { mentioned }
    } else {
        FilterOutcome::Ignore
    }
}

/// Format a message for injection into the turn queue, including the
/// mention/urgent banners named in §4.3.
pub fn format_for_injection(m: &TeamMessage, outcome: FilterOutcome) -> String {
    let mut banner = String::new();
    if let FilterOutcome::Respond { mentioned: true } = outcome {
        banner.push_str("[MENTIONED] ");
    }
    if m.priority_is_urgent() {
        banner.push_str("[URGENT] ");
    }
    format!(
        "{banner}[{from}{role}]: {content}",
        from = m.from_session_id,
        role = m
            .from_role
            .as_deref()
            .map(|r| format!(" ({r})"))
            .unwrap_or_default(),
        content = m.content,
    )
}

/// Bundle handed to the engine as the isolate-and-clear payload on team
/// join (§4.3 step 5). Workers see only their own work; coordinators see
/// the whole board.
#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub role_summary: String,
    pub board_view: crate::task::TaskFilterResult,
    /// Oldest-first, ready for prompt ingestion (display order is the
    /// caller's concern, not this struct's).
    pub recent_messages: Vec<TeamMessage>,
}

/// Decides which arriving team messages deserve an agent turn, hydrates
/// history on team join, performs the handshake and context injection, and
/// owns the local message store (§4.3). Holds the handles it needs instead
/// of being held by the Task State Manager — the cyclic-ownership note in
/// §9 is resolved by both components only ever touching [`crate::events::EventBus`].
pub struct TeamMessagePipeline {
    server: Arc<dyn ServerClient>,
    storage: Arc<MessageStore>,
    queue: Arc<TurnQueue>,
    config: Arc<TeamRuntimeConfig>,
}

impl TeamMessagePipeline {
    pub fn new(
        server: Arc<dyn ServerClient>,
        storage: Arc<MessageStore>,
        queue: Arc<TurnQueue>,
        config: Arc<TeamRuntimeConfig>,
    ) -> Self {
        Self {
            server,
            storage,
            queue,
            config,
        }
    }

    /// Handle one arriving team message: persist it, then apply the filter
    /// decision and enqueue an `append` turn if it warrants one.
    pub async fn handle_incoming(
        &self,
        message: TeamMessage,
        role: &str,
        session_id: &str,
        team_id: &str,
        policy: PolicySnapshot,
    ) -> Result<(), PipelineError> {
        self.storage.save(&message.team_id, message.clone())?;

        let outcome = filter_decision(&message, role, session_id, team_id);
        if let FilterOutcome::Respond { .. } = outcome {
            let text = format_for_injection(&message, outcome);
            self.queue.push(text, policy).await;
        }
        Ok(())
    }

    /// The team-join ritual (§4.3): hydrate history, send the handshake,
    /// and return the initial context bundle the caller enqueues as
    /// isolate-and-clear. Step 4 (lazily creating the team artifact) and
    /// the board fetch behind `tasks` are the Task State Manager's job —
    /// the pipeline never holds a `TaskStateManager` directly (§9's
    /// cyclic-ownership note), so the caller (Session Runtime) fetches the
    /// board and passes it in.
    pub async fn team_join_ritual(
        &self,
        session_id: &str,
        role: &str,
        team_id: &str,
        tasks: &[crate::task::Task],
    ) -> Result<ContextBundle, PipelineError> {
        let remote = self
            .server
            .get_team_messages(team_id, self.config.team_history_fetch_limit, None)
            .await
            .map_err(|e| PipelineError::TransientServerError(e.to_string()))?;
        self.storage.hydrate(team_id, remote)?;

        let mut handshake = TeamMessage::new(
            team_id,
            format!("{session_id} joined as {role}"),
            MessageTypeTag::System,
            session_id,
            crate::now_ms(),
        );
        handshake.metadata = Some(HashMap::from([("type".to_string(), Value::from("handshake"))]));
        if let Err(e) = self.server.send_team_message(handshake).await {
            tracing::warn!(error = %e, "team-join handshake send failed; continuing degraded");
        }

        let recent = self
            .storage
            .recent_context(team_id, self.config.recent_context_limit)?;

        Ok(ContextBundle {
            role_summary: crate::role::role_prompt(role, Some(team_id)),
            board_view: crate::task::filter_tasks(tasks, role, session_id),
            recent_messages: recent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(team: &str, role: Option<&str>, kind: MessageTypeTag, content: &str) -> TeamMessage {
        let mut m = TeamMessage::new(team, content, kind, "session-x", 0);
        m.from_role = role.map(|s| s.to_string());
        m
    }

    #[test]
    fn drops_message_from_another_team() {
        let m = msg("team-b", Some("framer"), MessageTypeTag::Chat, "hi");
        assert_eq!(
            filter_decision(&m, "builder", "session-a", "team-a"),
            FilterOutcome::Ignore
        );
    }

    #[test]
    fn worker_ignores_unrelated_chat_from_peer() {
        let m = msg("team-a", Some("framer"), MessageTypeTag::Chat, "hi");
        assert_eq!(
            filter_decision(&m, "builder", "session-a", "team-a"),
            FilterOutcome::Ignore
        );
    }

    #[test]
    fn worker_responds_to_task_update() {
        let m = msg("team-a", Some("framer"), MessageTypeTag::TaskUpdate, "t updated");
        assert_eq!(
            filter_decision(&m, "builder", "session-a", "team-a"),
            FilterOutcome::Respond { mentioned: false }
        );
    }

    #[test]
    fn worker_responds_when_mentioned() {
        let m = msg(
            "team-a",
            Some("framer"),
            MessageTypeTag::Chat,
            "@builder please help",
        );
        assert_eq!(
            filter_decision(&m, "builder", "session-a", "team-a"),
            FilterOutcome::Respond { mentioned: true }
        );
    }

    #[test]
    fn worker_responds_to_coordinator() {
        let m = msg("team-a", Some("master"), MessageTypeTag::Chat, "hi");
        assert_eq!(
            filter_decision(&m, "builder", "session-a", "team-a"),
            FilterOutcome::Respond { mentioned: false }
        );
    }

    #[test]
    fn coordinator_always_responds() {
        let m = msg("team-a", Some("builder"), MessageTypeTag::Chat, "hi");
        assert_eq!(
            filter_decision(&m, "master", "session-a", "team-a"),
            FilterOutcome::Respond { mentioned: false }
        );
    }

    #[test]
    fn unclassified_role_responds_to_urgent() {
        let mut m = msg("team-a", Some("builder"), MessageTypeTag::Chat, "hi");
        let mut meta = HashMap::new();
        meta.insert("priority".to_string(), Value::String("urgent".into()));
        m.metadata = Some(meta);
        assert_eq!(
            filter_decision(&m, "observer", "session-a", "team-a"),
            FilterOutcome::Respond { mentioned: false }
        );
    }

    #[test]
    fn format_for_injection_adds_mentioned_banner() {
        let m = msg("team-a", Some("framer"), MessageTypeTag::Chat, "hi");
        let out = format_for_injection(&m, FilterOutcome::Respond { mentioned: true });
        assert!(out.starts_with("[MENTIONED]"));
    }

    fn pipeline_with_tempdir() -> (TeamMessagePipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(crate::server_client::FakeServerClient::new());
        let storage = Arc::new(MessageStore::new(
            dir.path().to_path_buf(),
            Arc::new(TeamRuntimeConfig::default()),
        ));
        let queue = Arc::new(TurnQueue::new());
        let config = Arc::new(TeamRuntimeConfig::default());
        (
            TeamMessagePipeline::new(server, storage, queue, config),
            dir,
        )
    }

    #[tokio::test]
    async fn handle_incoming_enqueues_a_turn_when_respond() {
        let (pipeline, _dir) = pipeline_with_tempdir();
        let m = msg("team-a", Some("master"), MessageTypeTag::Chat, "hi builder");
        pipeline
            .handle_incoming(m, "builder", "session-a", "team-a", PolicySnapshot::default())
            .await
            .unwrap();
        assert_eq!(pipeline.queue.len().await, 1);
    }

    #[tokio::test]
    async fn handle_incoming_does_not_enqueue_when_ignored() {
        let (pipeline, _dir) = pipeline_with_tempdir();
        let m = msg("team-a", Some("framer"), MessageTypeTag::Chat, "unrelated chatter");
        pipeline
            .handle_incoming(m, "builder", "session-a", "team-a", PolicySnapshot::default())
            .await
            .unwrap();
        assert_eq!(pipeline.queue.len().await, 0);
    }

    #[tokio::test]
    async fn handle_incoming_always_persists_even_when_ignored() {
        let (pipeline, _dir) = pipeline_with_tempdir();
        let m = msg("team-a", Some("framer"), MessageTypeTag::Chat, "unrelated chatter");
        pipeline
            .handle_incoming(m.clone(), "builder", "session-a", "team-a", PolicySnapshot::default())
            .await
            .unwrap();
        let (page, _) = pipeline.storage.get("team-a", 10, None).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, m.id);
    }

    #[tokio::test]
    async fn team_join_ritual_sends_handshake_and_returns_bundle() {
        let (pipeline, _dir) = pipeline_with_tempdir();
        let bundle = pipeline
            .team_join_ritual("session-a", "builder", "team-a", &[])
            .await
            .unwrap();
        assert!(bundle.role_summary.contains("[SYSTEM: TEAM CONTEXT]"));
        let sent = pipeline
            .server
            .get_team_messages("team-a", 10, None)
            .await
            .unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageTypeTag::System);
        assert_eq!(
            sent[0]
                .metadata
                .as_ref()
                .and_then(|m| m.get("type"))
                .and_then(|v| v.as_str()),
            Some("handshake")
        );
    }
}
