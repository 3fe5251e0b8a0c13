// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Error taxonomy shared by the recorder, the player and the control surface

use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = RecorderError> = std::result::Result<T, E>;

/// Errors surfaced by the recording and playback engines
#[derive(Debug, Error)]
pub enum RecorderError {
    /// The engine already has an active run
    #[error("{engine} already running")]
    Conflict { engine: &'static str },

    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("bus transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Normal outcome of a deliberate stop
    #[error("run cancelled")]
    Cancelled,

    /// The run task panicked
    #[error("run task failed: {0}")]
    TaskFailed(String),
}

impl RecorderError {
    pub fn conflict(engine: &'static str) -> Self {
        Self::Conflict { engine }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Conflict, not-found and validation errors are the caller's fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::NotFound(_) | Self::Validation(_)
        )
    }
}

impl From<tokio::task::JoinError> for RecorderError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::TaskFailed(err.to_string())
        }
    }
}

/// Bus connect/subscribe/publish/receive failures
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe to `{filter}` failed: {reason}")]
    Subscribe { filter: String, reason: String },

    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("connection closed")]
    Closed,
}

/// Storage insert/read failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("unknown session {0}")]
    UnknownSession(Uuid),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Backend(String),
}
