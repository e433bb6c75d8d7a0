// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn queue: a FIFO, single-consumer queue of immutable [`Turn`]s with
//! `isolate-and-clear` preemption semantics. The Engine Driver is the sole
//! consumer; the Session Runtime is the sole producer.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, Notify};

use crate::policy_state::PolicyState;

/// Immutable copy of [`PolicyState`] bound to a [`Turn`] at enqueue time.
/// The invariant the whole crate is built around: the policy the engine
/// observes for a turn is the policy at the moment the turn was enqueued,
/// never the policy at the moment it happens to run.
pub type PolicySnapshot = PolicyState;

/// Stable hash of a [`PolicySnapshot`], used to decide whether two
/// consecutive enqueues may coalesce. Two snapshots with the same field
/// values always hash equal regardless of `HashSet` iteration order.
pub fn fingerprint(policy: &PolicySnapshot) -> String {
    let mut hasher = DefaultHasher::new();
    policy.permission_mode.to_string().hash(&mut hasher);
    policy.model_id.hash(&mut hasher);
    policy.fallback_model_id.hash(&mut hasher);
    policy.custom_system_prompt.hash(&mut hasher);
    policy.appended_system_prompt.hash(&mut hasher);
    hash_sorted_set(&mut hasher, policy.allowed_tools.as_ref());
    hash_sorted_set(&mut hasher, policy.disallowed_tools.as_ref());
    policy.role_id.hash(&mut hasher);
    policy.team_id.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn hash_sorted_set(hasher: &mut DefaultHasher, set: Option<&std::collections::HashSet<String>>) {
    match set {
        None => "none".hash(hasher),
        Some(s) => {
            let mut items: Vec<&String> = s.iter().collect();
            items.sort();
            items.hash(hasher);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueKind {
    Append,
    IsolateAndClear,
}

/// One unit of work submitted to the engine. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct Turn {
    pub text: String,
    pub policy: PolicySnapshot,
    pub kind: EnqueueKind,
    pub fingerprint: String,
}

impl Turn {
    fn new(text: String, policy: PolicySnapshot, kind: EnqueueKind) -> Self {
        let fingerprint = fingerprint(&policy);
        Self {
            text,
            policy,
            kind,
            fingerprint,
        }
    }
}

/// FIFO, single-consumer turn queue. `push` appends; `push_isolate_and_clear`
/// atomically drains pending items before pushing, so the pushed turn is
/// always at the head when it returns. Consecutive appends with an equal
/// policy fingerprint coalesce by concatenating text with a newline —
/// the consumer never observes a policy change mid-turn either way.
pub struct TurnQueue {
    inner: Mutex<VecDeque<Turn>>,
    notify: Notify,
}

impl TurnQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, text: impl Into<String>, policy: PolicySnapshot) {
        let turn = Turn::new(text.into(), policy, EnqueueKind::Append);
        let mut guard = self.inner.lock().await;
        if let Some(back) = guard.back_mut() {
            if back.kind == EnqueueKind::Append && back.fingerprint == turn.fingerprint {
                back.text.push('\n');
                back.text.push_str(&turn.text);
                self.notify.notify_one();
                return;
            }
        }
        guard.push_back(turn);
        self.notify.notify_one();
    }

    /// Linearizable with respect to other pushes: once this returns, every
    /// turn that was pending is gone and the new turn is at the head.
    pub async fn push_isolate_and_clear(&self, text: impl Into<String>, policy: PolicySnapshot) {
        let turn = Turn::new(text.into(), policy, EnqueueKind::IsolateAndClear);
        let mut guard = self.inner.lock().await;
        guard.clear();
        guard.push_back(turn);
        self.notify.notify_one();
    }

    /// Await the next turn, blocking until one is available.
    pub async fn next(&self) -> Turn {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(turn) = guard.pop_front() {
                    return turn;
                }
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for TurnQueue {
    fn default() -> Self {
        Self::new()
    }
}
