// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Engine Driver adapter seam (§4.6): a narrow async trait standing
//! between the Session Runtime and whatever actually executes a turn
//! (a model-backed agent loop, a test double). Mirrors the adapter shape
//! `sven_core::agent::Agent` draws around `Arc<dyn sven_model::ModelProvider>` —
//! the runtime depends on the trait object, never on a concrete engine.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::SessionError;
use crate::permission::{self, ExplicitOverrides};
use crate::turn::Turn;

/// Which party currently drives the turn the engine is running (§4.6).
/// `Local` means the user/session holds control; `Remote` means the engine
/// has handed control to its own remote loop. The Session Runtime mirrors
/// this into its `controlled_by_user` bit whenever it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Local,
    Remote,
}

/// One incremental event produced while a turn runs. `ToolCallRejected`
/// surfaces a permission denial without aborting the turn — the engine
/// decides whether to retry, explain, or give up. `ModeChange` fires when
/// the engine toggles between local and remote control (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TextChunk(String),
    ToolCallStarted { name: String },
    ToolCallRejected { name: String, reason: &'static str },
    ModeChange { new_mode: ControlMode },
    TurnComplete,
}

/// `run-turn(turn) -> stream<EngineEvent>` (§4.6). Implementations own their
/// own model/tool wiring; this trait only standardizes the seam so the
/// Session Runtime can drive any engine without depending on its internals.
#[async_trait]
pub trait EngineDriver: Send + Sync {
    async fn run_turn(&self, turn: &Turn) -> Result<Vec<EngineEvent>, SessionError>;
}

/// In-memory test engine, the fixture style `sven_tools::registry`'s
/// `EchoTool` uses for its own test suite: deterministic, no network, and
/// instrumented so tests can assert on what was asked of it. Every tool
/// call it "executes" is checked against [`crate::permission::check`] first
/// so tests can exercise the rejection path without a real engine.
pub struct FakeEngine {
    tool_calls: Mutex<Vec<(String, String)>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            tool_calls: Mutex::new(Vec::new()),
        }
    }

    /// Calls recorded as `(role, tool)` across every `run_turn` invocation,
    /// in order, including rejected ones.
    pub fn recorded_calls(&self) -> Vec<(String, String)> {
        self.tool_calls.lock().unwrap().clone()
    }

    /// Parses `turn.text` looking for a `tool:<name>` directive; any other
    /// text just echoes back as a single `TextChunk`. This keeps the fixture
    /// useful for both chat-shaped and tool-shaped test turns without
    /// needing a real parser.
    fn requested_tool(text: &str) -> Option<&str> {
        text.strip_prefix("tool:").map(|s| s.trim())
    }

    /// Parses a `mode:local`/`mode:remote` directive, the fixture's way of
    /// letting a test drive the `ModeChange` event deterministically.
    fn requested_mode(text: &str) -> Option<ControlMode> {
        match text.strip_prefix("mode:").map(|s| s.trim()) {
            Some("local") => Some(ControlMode::Local),
            Some("remote") => Some(ControlMode::Remote),
            _ => None,
        }
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineDriver for FakeEngine {
    async fn run_turn(&self, turn: &Turn) -> Result<Vec<EngineEvent>, SessionError> {
        let role = turn.policy.role_id.as_deref().unwrap_or("");

        if let Some(new_mode) = Self::requested_mode(&turn.text) {
            return Ok(vec![
                EngineEvent::ModeChange { new_mode },
                EngineEvent::TurnComplete,
            ]);
        }

        if let Some(tool) = Self::requested_tool(&turn.text) {
            self.tool_calls
                .lock()
                .unwrap()
                .push((role.to_string(), tool.to_string()));

            let mut overrides = ExplicitOverrides::default();
            let allowed: HashSet<&str> = turn
                .policy
                .allowed_tools
                .as_ref()
                .map(|s| s.iter().map(|s| s.as_str()).collect())
                .unwrap_or_default();
            let disallowed: HashSet<&str> = turn
                .policy
                .disallowed_tools
                .as_ref()
                .map(|s| s.iter().map(|s| s.as_str()).collect())
                .unwrap_or_default();
            if allowed.contains(tool) {
                overrides.allow.insert(tool);
            }
            if disallowed.contains(tool) {
                overrides.deny.insert(tool);
            }

            let decision = permission::check(role, tool, &overrides);
            if !decision.allow {
                return Ok(vec![
                    EngineEvent::ToolCallRejected {
                        name: tool.to_string(),
                        reason: decision.reason,
                    },
                    EngineEvent::TurnComplete,
                ]);
            }

            return Ok(vec![
                EngineEvent::ToolCallStarted {
                    name: tool.to_string(),
                },
                EngineEvent::TextChunk(format!("ran {tool}")),
                EngineEvent::TurnComplete,
            ]);
        }

        Ok(vec![
            EngineEvent::TextChunk(format!("echo: {}", turn.text)),
            EngineEvent::TurnComplete,
        ])
    }
}
