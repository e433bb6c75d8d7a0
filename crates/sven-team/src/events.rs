// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The local state-change event bus. Breaks the cyclic ownership between
//! the Task State Manager and the Team Message Pipeline: the manager
//! publishes, the pipeline subscribes. Neither holds the other directly.

use tokio::sync::broadcast;

use crate::task::Task;
use uuid::Uuid;

/// Emitted by the Task State Manager after every successful mutation, and
/// normalized from server push events so subscribers see one stream
/// regardless of origin.
#[derive(Debug, Clone)]
pub enum StateChangeEvent {
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted(Uuid),
}

/// Thin wrapper around a `tokio::sync::broadcast` channel. Lagging
/// subscribers miss events rather than block the publisher — acceptable
/// here because the Team Message Pipeline treats the board as a cache that
/// is periodically re-hydrated, not as the sole source of truth.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StateChangeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of active subscribers that
    /// received it; `0` is not an error (no one is currently listening).
    pub fn publish(&self, event: StateChangeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let task = Task::new_top_level("t", "r", 0);
        bus.publish(StateChangeEvent::TaskCreated(task.clone()));
        match rx.recv().await.unwrap() {
            StateChangeEvent::TaskCreated(t) => assert_eq!(t.id, task.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        let n = bus.publish(StateChangeEvent::TaskDeleted(Uuid::new_v4()));
        assert_eq!(n, 0);
    }
}
