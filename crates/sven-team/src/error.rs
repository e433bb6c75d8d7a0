// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by [`crate::task_manager::TaskStateManager`].
///
/// Variant names follow the error-kind taxonomy directly: matching on
/// `TaskError::DepthExceeded` *is* checking for `depth-exceeded`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TaskError {
    #[error("transient server error: {0}")]
    TransientServerError(String),

    #[error("version conflict")]
    VersionConflict,

    #[error("conflict unresolved after {retries} retries")]
    ConflictUnresolved { retries: u32 },

    #[error("forbidden by role: {0}")]
    ForbiddenByRole(String),

    #[error("maximum sub-task depth (3) reached")]
    DepthExceeded,

    #[error("subtasks incomplete")]
    SubtasksIncomplete,

    #[error("task not found: {0}")]
    NotFound(Uuid),

    #[error("another session already holds an active execution link")]
    AlreadyActive,
}

/// Errors raised by [`crate::storage::MessageStore`].
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e.to_string())
    }
}

/// Errors raised by [`crate::message::TeamMessagePipeline`].
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transient server error: {0}")]
    TransientServerError(String),
}

/// Errors raised by [`crate::session::SessionRuntime`] and startup.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("bad config: {0}")]
    BadConfig(String),

    #[error("engine driver failure: {0}")]
    EngineFailure(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
