// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The server client contract (§6). The transport itself is out of scope;
//! this module models the contract as an `async-trait` object, the way
//! `sven_model::ModelProvider` models the LLM-backend seam, so the rest of
//! the crate can be built and tested against an in-memory fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::message::TeamMessage;
use crate::task::{Board, Task};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineDescriptor {
    pub id: String,
}

/// The header/body + version pair backing optimistic concurrency on the
/// team artifact (§9's "only consistency mechanism available from the
/// server").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub header: serde_json::Value,
    pub body: Board,
    pub header_version: u64,
    pub body_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEventKind {
    Created,
    Updated,
    Deleted,
}

/// The push channel's small discriminated envelope (server → session).
#[derive(Debug, Clone)]
pub enum ServerPushEvent {
    TeamMessage(TeamMessage),
    MetadataUpdate {
        role_id: Option<String>,
        team_id: Option<String>,
    },
    TaskEvent {
        kind: TaskEventKind,
        task_id: Uuid,
        task: Option<Task>,
    },
}

/// `{ok, value | error}` — every server call can fail with a transient
/// server error or a version conflict; the trait surfaces both as
/// `crate::error::TaskError` variants so callers match uniformly.
pub type ServerResult<T> = Result<T, crate::error::TaskError>;

/// One entry of a `kv-mutate` batch (§6). `version = -1` requests a create;
/// any other value is the expected current version for a CAS update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvMutation {
    pub key: String,
    pub value: serde_json::Value,
    pub version: i64,
}

/// Outcome of one [`KvMutation`]: the new version on success, or a
/// version-conflict failure for that key alone — a batch partially applies.
#[derive(Debug, Clone, PartialEq)]
pub enum KvMutationResult {
    Ok { key: String, version: i64 },
    Conflict { key: String },
}

/// Direction-agnostic server client contract (§6). Implementations own
/// their own concurrency; the trait itself makes no ordering guarantee
/// beyond "one call completes before its `ServerResult` is observed".
#[async_trait]
pub trait ServerClient: Send + Sync {
    async fn get_or_create_session(
        &self,
        tag: &str,
        metadata: serde_json::Value,
    ) -> ServerResult<SessionDescriptor>;

    async fn get_or_create_machine(&self, id: &str) -> ServerResult<MachineDescriptor>;

    async fn get_artifact(&self, team_id: &str) -> ServerResult<Option<Artifact>>;

    async fn create_artifact(&self, team_id: &str, body: Board) -> ServerResult<Artifact>;

    async fn update_artifact(
        &self,
        team_id: &str,
        body: Board,
        expected_header_version: u64,
        expected_body_version: u64,
    ) -> ServerResult<Artifact>;

    async fn send_team_message(&self, message: TeamMessage) -> ServerResult<()>;

    async fn get_team_messages(
        &self,
        team_id: &str,
        limit: usize,
        before: Option<i64>,
    ) -> ServerResult<Vec<TeamMessage>>;

    /// `kv-get(key)` (§6): a small key/value escape hatch alongside the
    /// team artifact, for state this crate's own data model doesn't name.
    /// Returns the stored value and its version, or `None` if unset.
    async fn kv_get(&self, key: &str) -> ServerResult<Option<(serde_json::Value, i64)>>;

    /// `kv-mutate([{key, value, version}])` (§6) with per-key CAS;
    /// `version = -1` means create. A batch applies independently per key —
    /// one key's conflict does not roll back another's success.
    async fn kv_mutate(&self, entries: Vec<KvMutation>) -> ServerResult<Vec<KvMutationResult>>;

    /// `push(title, body, data)` (§6) — fire-and-forget notification; the
    /// server is free to drop it, so callers never retry on failure.
    async fn push(&self, title: &str, body: &str, data: serde_json::Value) -> ServerResult<()>;
}

/// In-memory fake used by this crate's own tests and available to
/// downstream binaries for integration tests before a real transport is
/// wired in.
pub struct FakeServerClient {
    artifacts: Mutex<HashMap<String, Artifact>>,
    messages: Mutex<HashMap<String, Vec<TeamMessage>>>,
    kv: Mutex<HashMap<String, (serde_json::Value, i64)>>,
    pushes: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl FakeServerClient {
    pub fn new() -> Self {
        Self {
            artifacts: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            kv: Mutex::new(HashMap::new()),
            pushes: Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub fn pushes(&self) -> Vec<(String, String, serde_json::Value)> {
        self.pushes.lock().unwrap().clone()
    }
}

impl Default for FakeServerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerClient for FakeServerClient {
    async fn get_or_create_session(
        &self,
        _tag: &str,
        _metadata: serde_json::Value,
    ) -> ServerResult<SessionDescriptor> {
        Ok(SessionDescriptor {
            id: Uuid::new_v4().to_string(),
        })
    }

    async fn get_or_create_machine(&self, id: &str) -> ServerResult<MachineDescriptor> {
        Ok(MachineDescriptor { id: id.to_string() })
    }

    async fn get_artifact(&self, team_id: &str) -> ServerResult<Option<Artifact>> {
        Ok(self.artifacts.lock().unwrap().get(team_id).cloned())
    }

    async fn create_artifact(&self, team_id: &str, body: Board) -> ServerResult<Artifact> {
        let artifact = Artifact {
            header: serde_json::json!({ "team_id": team_id }),
            body,
            header_version: 0,
            body_version: 0,
        };
        self.artifacts
            .lock()
            .unwrap()
            .insert(team_id.to_string(), artifact.clone());
        Ok(artifact)
    }

    async fn update_artifact(
        &self,
        team_id: &str,
        body: Board,
        expected_header_version: u64,
        expected_body_version: u64,
    ) -> ServerResult<Artifact> {
        let mut artifacts = self.artifacts.lock().unwrap();
        let current = artifacts
            .get(team_id)
            .cloned()
            .ok_or_else(|| crate::error::TaskError::NotFound(Uuid::nil()))?;
        if current.header_version != expected_header_version
            || current.body_version != expected_body_version
        {
            return Err(crate::error::TaskError::VersionConflict);
        }
        let updated = Artifact {
            header: current.header,
            body,
            header_version: current.header_version + 1,
            body_version: current.body_version + 1,
        };
        artifacts.insert(team_id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn send_team_message(&self, message: TeamMessage) -> ServerResult<()> {
        self.messages
            .lock()
            .unwrap()
            .entry(message.team_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn get_team_messages(
        &self,
        team_id: &str,
        limit: usize,
        before: Option<i64>,
    ) -> ServerResult<Vec<TeamMessage>> {
        let messages = self.messages.lock().unwrap();
        let mut all: Vec<TeamMessage> = messages.get(team_id).cloned().unwrap_or_default();
        if let Some(before) = before {
            all.retain(|m| m.timestamp < before);
        }
        all.sort_by_key(|m| m.timestamp);
        if all.len() > limit {
            let start = all.len() - limit;
            all = all[start..].to_vec();
        }
        Ok(all)
    }

    async fn kv_get(&self, key: &str) -> ServerResult<Option<(serde_json::Value, i64)>> {
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }

    async fn kv_mutate(&self, entries: Vec<KvMutation>) -> ServerResult<Vec<KvMutationResult>> {
        let mut kv = self.kv.lock().unwrap();
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let current = kv.get(&entry.key).map(|(_, v)| *v);
            let conflict = match (entry.version, current) {
                (-1, None) => false,
                (-1, Some(_)) => true,
                (expected, Some(actual)) => expected != actual,
                (_, None) => true,
            };
            if conflict {
                results.push(KvMutationResult::Conflict { key: entry.key });
                continue;
            }
            let new_version = current.map(|v| v + 1).unwrap_or(0);
            kv.insert(entry.key.clone(), (entry.value, new_version));
            results.push(KvMutationResult::Ok {
                key: entry.key,
                version: new_version,
            });
        }
        Ok(results)
    }

    async fn push(&self, title: &str, body: &str, data: serde_json::Value) -> ServerResult<()> {
        self.pushes
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string(), data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageTypeTag;

    #[tokio::test]
    async fn create_then_get_artifact_round_trips() {
        let client = FakeServerClient::new();
        let board = Board::with_default_columns();
        client.create_artifact("team-a", board.clone()).await.unwrap();
        let fetched = client.get_artifact("team-a").await.unwrap().unwrap();
        assert_eq!(fetched.body.columns.len(), board.columns.len());
    }

    #[tokio::test]
    async fn update_artifact_with_stale_version_conflicts() {
        let client = FakeServerClient::new();
        let board = Board::with_default_columns();
        client.create_artifact("team-a", board.clone()).await.unwrap();
        let result = client.update_artifact("team-a", board, 5, 5).await;
        assert!(matches!(
            result,
            Err(crate::error::TaskError::VersionConflict)
        ));
    }

    #[tokio::test]
    async fn send_then_get_team_messages() {
        let client = FakeServerClient::new();
        let m = TeamMessage::new("team-a", "hi", MessageTypeTag::Chat, "s1", 100);
        client.send_team_message(m.clone()).await.unwrap();
        let got = client.get_team_messages("team-a", 10, None).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, m.id);
    }

    #[tokio::test]
    async fn kv_mutate_with_version_minus_one_creates() {
        let client = FakeServerClient::new();
        let results = client
            .kv_mutate(vec![KvMutation {
                key: "a".into(),
                value: serde_json::json!(1),
                version: -1,
            }])
            .await
            .unwrap();
        assert_eq!(
            results,
            vec![KvMutationResult::Ok {
                key: "a".into(),
                version: 0
            }]
        );
        let (value, version) = client.kv_get("a").await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!(1));
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn kv_mutate_create_twice_conflicts() {
        let client = FakeServerClient::new();
        let entry = || KvMutation {
            key: "a".into(),
            value: serde_json::json!(1),
            version: -1,
        };
        client.kv_mutate(vec![entry()]).await.unwrap();
        let results = client.kv_mutate(vec![entry()]).await.unwrap();
        assert_eq!(results, vec![KvMutationResult::Conflict { key: "a".into() }]);
    }

    #[tokio::test]
    async fn kv_mutate_stale_version_conflicts() {
        let client = FakeServerClient::new();
        client
            .kv_mutate(vec![KvMutation {
                key: "a".into(),
                value: serde_json::json!(1),
                version: -1,
            }])
            .await
            .unwrap();
        let results = client
            .kv_mutate(vec![KvMutation {
                key: "a".into(),
                value: serde_json::json!(2),
                version: 5,
            }])
            .await
            .unwrap();
        assert_eq!(results, vec![KvMutationResult::Conflict { key: "a".into() }]);
    }

    #[tokio::test]
    async fn push_is_fire_and_forget_and_recorded() {
        let client = FakeServerClient::new();
        client
            .push("title", "body", serde_json::json!({"k": "v"}))
            .await
            .unwrap();
        assert_eq!(client.pushes().len(), 1);
    }
}
