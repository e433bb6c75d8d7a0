// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Session Runtime: central event router and sole writer of
//! [`PolicyState`] (§4.1). Owns the turn queue as its sole producer,
//! dispatches server push events, and drives the Engine Driver worker.
//! Wiring mirrors `sven_node::control::service::ControlService`'s
//! `cmd_tx`/`cmd_rx` + broadcast-event shape: callers talk to a cheap
//! [`SessionHandle`] over channels, never touching the runtime's state
//! directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex, Notify};

use crate::engine_driver::{ControlMode, EngineDriver, EngineEvent};
use crate::error::SessionError;
use crate::events::EventBus;
use crate::message::{ContextBundle, TeamMessagePipeline};
use crate::policy_state::{PolicyOverride, PolicyState};
use crate::role;
use crate::server_client::{ServerClient, ServerPushEvent, TaskEventKind};
use crate::task_manager::TaskStateManager;
use crate::turn::TurnQueue;

/// Lifecycle states named in §4.1: a session starts `initializing`, moves to
/// `running` once [`SessionRuntime::run`] installs its listeners, and ends
/// `archived` once shutdown has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Running,
    Archived,
}

/// Sent over the user-turn channel by [`SessionHandle`]. Named fields keep
/// the match arms in [`SessionRuntime::run`] self-documenting the way
/// `sven_node`'s `ControlCommand` variants are.
#[derive(Debug, Clone)]
pub enum Command {
    PushUserTurn {
        text: String,
        overrides: PolicyOverride,
    },
    PushMetadataUpdate {
        overrides: PolicyOverride,
    },
}

/// Cheap, cloneable handle callers use to drive a [`SessionRuntime`] without
/// touching its internals. Pushing a command never blocks on policy state —
/// it only enqueues onto the channel the runtime's single event loop reads.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    output_tx: broadcast::Sender<EngineEvent>,
    runtime: Arc<SessionRuntime>,
}

impl SessionHandle {
    pub async fn push_user_turn(&self, text: impl Into<String>, overrides: PolicyOverride) {
        let _ = self
            .cmd_tx
            .send(Command::PushUserTurn {
                text: text.into(),
                overrides,
            })
            .await;
    }

    pub async fn push_metadata_update(&self, overrides: PolicyOverride) {
        let _ = self
            .cmd_tx
            .send(Command::PushMetadataUpdate { overrides })
            .await;
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<EngineEvent> {
        self.output_tx.subscribe()
    }

    /// Idempotent graceful shutdown (§4.1.1). Safe to call more than once or
    /// concurrently with the installed signal handler.
    pub async fn shutdown(&self) {
        self.runtime.shutdown().await;
    }

    pub async fn lifecycle(&self) -> LifecycleState {
        *self.runtime.lifecycle.lock().await
    }

    /// The `controlledByUser` bit (§4.6): true while the engine's last
    /// reported control mode was `Local`, flipped by the engine worker
    /// whenever it forwards an `EngineEvent::ModeChange`.
    pub fn controlled_by_user(&self) -> bool {
        self.runtime.controlled_by_user.load(Ordering::SeqCst)
    }
}

/// Central event router. Sole writer of [`PolicyState`]; every [`crate::turn::Turn`]
/// enqueued onto `queue` carries a snapshot taken at that moment (§9's core
/// invariant).
pub struct SessionRuntime {
    session_id: String,
    team_id: Mutex<Option<String>>,
    server: Arc<dyn ServerClient>,
    task_manager: Arc<TaskStateManager>,
    pipeline: Arc<TeamMessagePipeline>,
    engine: Arc<dyn EngineDriver>,
    events: Arc<EventBus>,
    queue: Arc<TurnQueue>,
    policy: Mutex<PolicyState>,
    lifecycle: Mutex<LifecycleState>,
    shutdown_notify: Notify,
    shutdown_requested: AtomicBool,
    output_tx: broadcast::Sender<EngineEvent>,
    /// Mirrors the engine's last-reported `ControlMode` (§4.6): `true` while
    /// control is `Local`. Starts `true` — a session begins under local
    /// (user-driven) control until the engine reports otherwise.
    controlled_by_user: AtomicBool,
}

impl SessionRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        server: Arc<dyn ServerClient>,
        task_manager: Arc<TaskStateManager>,
        pipeline: Arc<TeamMessagePipeline>,
        engine: Arc<dyn EngineDriver>,
        events: Arc<EventBus>,
        initial_policy: PolicyState,
    ) -> (Arc<Self>, SessionHandle, mpsc::Receiver<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (output_tx, _) = broadcast::channel(1024);

        let team_id = initial_policy.team_id.clone();
        let runtime = Arc::new(Self {
            session_id: session_id.into(),
            team_id: Mutex::new(team_id),
            server,
            task_manager,
            pipeline,
            engine,
            events,
            queue: Arc::new(TurnQueue::new()),
            policy: Mutex::new(initial_policy),
            lifecycle: Mutex::new(LifecycleState::Initializing),
            shutdown_notify: Notify::new(),
            shutdown_requested: AtomicBool::new(false),
            output_tx: output_tx.clone(),
            controlled_by_user: AtomicBool::new(true),
        });

        let handle = SessionHandle {
            cmd_tx,
            output_tx: output_tx.clone(),
            runtime: runtime.clone(),
        };

        (runtime, handle, cmd_rx)
    }

    /// Run the event loop until shutdown (§4.1.1). Spawns the server-push
    /// listener, the Engine Driver worker, and a SIGTERM/SIGINT handler,
    /// then selects over the user-turn channel, the server-push channel,
    /// and the shutdown notification — mirroring the dual-branch signal
    /// handler `main.rs` installs for its own terminal cleanup.
    pub async fn run(
        self: Arc<Self>,
        mut push_rx: mpsc::Receiver<ServerPushEvent>,
        mut cmd_rx: mpsc::Receiver<Command>,
    ) {
        *self.lifecycle.lock().await = LifecycleState::Running;
        tracing::info!(session_id = %self.session_id, "session runtime starting");

        let engine_worker = {
            let this = self.clone();
            let queue = self.queue.clone();
            let engine = self.engine.clone();
            let output_tx = self.output_tx.clone();
            tokio::spawn(async move {
                loop {
                    let turn = queue.next().await;
                    match engine.run_turn(&turn).await {
                        Ok(events) => {
                            for event in events {
                                if let EngineEvent::ModeChange { new_mode } = &event {
                                    this.controlled_by_user
                                        .store(*new_mode == ControlMode::Local, Ordering::SeqCst);
                                    tracing::info!(
                                        session_id = %this.session_id,
                                        controlled_by_user = (*new_mode == ControlMode::Local),
                                        "engine control mode changed"
                                    );
                                }
                                let _ = output_tx.send(event);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "engine driver run_turn failed");
                        }
                    }
                }
            })
        };

        let signal_handler = {
            let this = self.clone();
            tokio::spawn(async move {
                #[cfg(unix)]
                {
                    use tokio::signal::unix::{signal, SignalKind};
                    let mut sigterm = match signal(SignalKind::terminate()) {
                        Ok(s) => s,
                        Err(_) => return,
                    };
                    let mut sigint = match signal(SignalKind::interrupt()) {
                        Ok(s) => s,
                        Err(_) => return,
                    };
                    tokio::select! {
                        _ = sigterm.recv() => {}
                        _ = sigint.recv() => {}
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = tokio::signal::ctrl_c().await;
                }
                this.shutdown().await;
            })
        };

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                }
                push = push_rx.recv() => {
                    let Some(event) = push else { break };
                    self.handle_push_event(event).await;
                }
                _ = self.shutdown_notify.notified() => {
                    break;
                }
            }
        }

        engine_worker.abort();
        signal_handler.abort();
        *self.lifecycle.lock().await = LifecycleState::Archived;
        tracing::info!(session_id = %self.session_id, "session runtime archived");
    }

    /// Idempotent shutdown trigger (§4.1.1). The `AtomicBool` makes repeated
    /// or concurrent calls a no-op after the first.
    pub async fn shutdown(&self) {
        if self
            .shutdown_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.shutdown_notify.notify_one();
        }
    }

    async fn handle_command(&self, cmd: Command) {
        match cmd {
            Command::PushUserTurn { text, overrides } => {
                if let Err(e) = self.push_user_turn(text, overrides).await {
                    tracing::warn!(error = %e, "push_user_turn failed");
                }
            }
            Command::PushMetadataUpdate { overrides } => {
                if let Err(e) = self.push_metadata_update(overrides).await {
                    tracing::warn!(error = %e, "push_metadata_update failed");
                }
            }
        }
    }

    /// `push-user-turn(text, meta)` (§4.1): applies the `meta` override
    /// first — a team-id transition triggers the team-join ritual as an
    /// isolate-and-clear turn ahead of the user's own text. `/compact` and
    /// `/clear` are isolate-and-clear turns in their own right, detected by
    /// prefix (S4: `/clear X` discards the backlog and carries `X` as the
    /// isolate-and-clear turn's text); anything else is an ordinary append.
    async fn push_user_turn(
        &self,
        text: String,
        overrides: PolicyOverride,
    ) -> Result<(), SessionError> {
        let joined = self.apply_policy_override(overrides).await;

        if joined {
            self.run_team_join_ritual().await?;
        }

        let snapshot = self.turn_snapshot().await;
        match special_command_remainder(&text) {
            Some(remainder) => {
                self.queue
                    .push_isolate_and_clear(remainder, snapshot)
                    .await;
            }
            None => {
                self.queue.push(text, snapshot).await;
            }
        }
        Ok(())
    }

    /// `push-metadata-update(meta)` (§4.1): same override application as
    /// `push-user-turn`, without an accompanying user turn.
    async fn push_metadata_update(&self, overrides: PolicyOverride) -> Result<(), SessionError> {
        let joined = self.apply_policy_override(overrides).await;
        if joined {
            self.run_team_join_ritual().await?;
        }
        Ok(())
    }

    async fn apply_policy_override(&self, overrides: PolicyOverride) -> bool {
        let mut policy = self.policy.lock().await;
        let joined = policy.apply(overrides);
        *self.team_id.lock().await = policy.team_id.clone();
        joined
    }

    /// Runs the team-join ritual and enqueues its context bundle as an
    /// isolate-and-clear turn (§4.3 step 5) — always ahead of whatever user
    /// text triggered the join.
    async fn run_team_join_ritual(&self) -> Result<(), SessionError> {
        let team_id = self.team_id.lock().await.clone();
        let Some(team_id) = team_id else {
            return Ok(());
        };
        let role = self
            .policy
            .lock()
            .await
            .role_id
            .clone()
            .unwrap_or_default();

        let tasks = self.task_manager.get_board(&team_id).await?;
        let bundle = self
            .pipeline
            .team_join_ritual(&self.session_id, &role, &team_id, &tasks)
            .await?;

        let snapshot = self.turn_snapshot().await;
        self.queue
            .push_isolate_and_clear(render_context_bundle(&bundle), snapshot)
            .await;
        Ok(())
    }

    /// Dispatch one server-pushed event (§4.3, §4.2.1). Team messages go
    /// through the pipeline's filter; metadata updates apply exactly like a
    /// local `push-metadata-update`; task events are re-published on the
    /// local event bus for any subscriber, without mutating the cache
    /// directly (the Task State Manager re-reads from the server on its own
    /// next access).
    async fn handle_push_event(&self, event: ServerPushEvent) {
        match event {
            ServerPushEvent::TeamMessage(message) => {
                let team_id = self.team_id.lock().await.clone().unwrap_or_default();
                let role = self
                    .policy
                    .lock()
                    .await
                    .role_id
                    .clone()
                    .unwrap_or_default();
                let snapshot = self.turn_snapshot().await;
                if let Err(e) = self
                    .pipeline
                    .handle_incoming(message, &role, &self.session_id, &team_id, snapshot)
                    .await
                {
                    tracing::warn!(error = %e, "failed to handle incoming team message");
                }
            }
            ServerPushEvent::MetadataUpdate { role_id, team_id } => {
                let overrides = PolicyOverride {
                    role_id: role_id.map(Some),
                    team_id: team_id.map(Some),
                    ..Default::default()
                };
                if let Err(e) = self.push_metadata_update(overrides).await {
                    tracing::warn!(error = %e, "failed to apply remote metadata update");
                }
            }
            ServerPushEvent::TaskEvent { kind, task_id, task } => {
                use crate::events::StateChangeEvent;
                let event = match (kind, task) {
                    (TaskEventKind::Created, Some(t)) => StateChangeEvent::TaskCreated(t),
                    (TaskEventKind::Updated, Some(t)) => StateChangeEvent::TaskUpdated(t),
                    (TaskEventKind::Deleted, _) => StateChangeEvent::TaskDeleted(task_id),
                    (_, None) => return,
                };
                self.events.publish(event);
            }
        }
    }

    pub fn queue(&self) -> &Arc<TurnQueue> {
        &self.queue
    }

    pub async fn snapshot_policy(&self) -> PolicyState {
        self.policy.lock().await.clone()
    }

    /// Turn assembly (§4.1): every enqueued turn's appended-system-prompt is
    /// `current_appended ⧺ role_prompt(role, team id)`. The role prompt is
    /// derived fresh from the Role Registry each time rather than folded
    /// into the stored `appended_system_prompt` field, so it never
    /// duplicates across repeated enqueues.
    async fn turn_snapshot(&self) -> PolicyState {
        let mut snapshot = self.policy.lock().await.clone();
        let role_prompt = snapshot
            .role_id
            .as_deref()
            .map(|role| role::role_prompt(role, snapshot.team_id.as_deref()))
            .unwrap_or_default();
        if !role_prompt.is_empty() {
            snapshot.appended_system_prompt = Some(match snapshot.appended_system_prompt {
                Some(current) => format!("{current}{role_prompt}"),
                None => role_prompt,
            });
        }
        snapshot
    }
}

/// Detects a `/compact`/`/clear` command by prefix (§4.1, S4) rather than
/// exact match, so `"/clear X"` isolate-and-clears with `X` as the carried
/// text instead of falling through to an ordinary append. A bare command
/// with no remainder carries itself as the turn text.
fn special_command_remainder(text: &str) -> Option<String> {
    let trimmed = text.trim();
    for command in ["/compact", "/clear"] {
        if trimmed == command {
            return Some(command.to_string());
        }
        if let Some(rest) = trimmed.strip_prefix(command) {
            if rest.starts_with(char::is_whitespace) {
                return Some(rest.trim().to_string());
            }
        }
    }
    None
}

/// Render a [`ContextBundle`] into the text the engine sees as its
/// isolate-and-clear turn on team join. Plain, line-oriented — the engine
/// is free to reformat; this only has to be faithful to the bundle's
/// content.
fn render_context_bundle(bundle: &ContextBundle) -> String {
    let mut out = String::new();
    out.push_str(&bundle.role_summary);
    out.push('\n');
    out.push_str(&format!(
        "Board: {} total, {} mine, {} available, {} pending approval\n",
        bundle.board_view.stats.total,
        bundle.board_view.mine.len(),
        bundle.board_view.available.len(),
        bundle.board_view.pending_approvals.len(),
    ));
    if !bundle.recent_messages.is_empty() {
        out.push_str("Recent team messages:\n");
        for m in &bundle.recent_messages {
            out.push_str(&format!("- {}\n", m.content));
        }
    }
    out
}
