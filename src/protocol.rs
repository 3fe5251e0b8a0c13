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

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use crate::error::RecorderError;

/// Largest page the message retrieval API hands out
pub const MAX_PAGE_SIZE: u32 = 5000;

/// Normalized payload as stored in a message row
pub type Payload = JsonMap<String, JsonValue>;

/// Current time at the microsecond precision storage keeps
pub fn capture_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Lifecycle state of a recording session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Created,
    Recording,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::Recording => "RECORDING",
            SessionState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(SessionState::Created),
            "RECORDING" => Ok(SessionState::Recording),
            "STOPPED" => Ok(SessionState::Stopped),
            other => Err(format!("unknown session state `{}`", other)),
        }
    }
}

/// A recording/replay unit of work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingSession {
    pub id: Uuid,
    pub node: String,
    pub topic_filters: Vec<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl RecordingSession {
    pub fn new(node: String, topic_filters: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node,
            topic_filters,
            state: SessionState::Created,
            created_at: capture_time(),
            started_at: None,
            stopped_at: None,
        }
    }
}

/// Request body for creating a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub node: String,
    pub topic_filters: Vec<String>,
}

impl NewSession {
    pub fn validate(&self) -> Result<(), RecorderError> {
        validate_topic_filters(&self.topic_filters)
    }
}

/// Topic filters must form a non-empty list of non-empty strings
pub fn validate_topic_filters(filters: &[String]) -> Result<(), RecorderError> {
    if filters.is_empty() {
        return Err(RecorderError::validation(
            "topic_filters must be a non-empty list",
        ));
    }
    if let Some(pos) = filters.iter().position(|f| f.trim().is_empty()) {
        return Err(RecorderError::validation(format!(
            "topic_filters[{}] must be a non-empty string",
            pos
        )));
    }
    Ok(())
}

/// A message captured by the recorder, not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewBusMessage {
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub payload: Payload,
    pub qos: u8,
    pub retained: bool,
}

/// A persisted message row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusMessage {
    pub id: i64,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub payload: Payload,
    pub qos: u8,
    pub retained: bool,
}

/// Page request against a session's stored messages
#[derive(Debug, Clone, PartialEq)]
pub struct MessageQuery {
    pub session_id: Uuid,
    pub topic_prefix: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl MessageQuery {
    pub fn new(session_id: Uuid, limit: u32) -> Self {
        Self {
            session_id,
            topic_prefix: None,
            limit,
            offset: 0,
        }
    }

    pub fn validate(&self) -> Result<(), RecorderError> {
        if self.limit == 0 || self.limit > MAX_PAGE_SIZE {
            return Err(RecorderError::validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    /// Prefix filter, ignoring an empty string
    pub fn prefix(&self) -> Option<&str> {
        self.topic_prefix.as_deref().filter(|p| !p.is_empty())
    }
}

/// Playback parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackOptions {
    pub speed: f64,
    pub topic_prefix: Option<String>,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            topic_prefix: None,
        }
    }
}

impl PlaybackOptions {
    /// Non-positive or non-finite speeds replay in real time
    pub fn effective_speed(&self) -> f64 {
        if self.speed.is_finite() && self.speed > 0.0 {
            self.speed
        } else {
            1.0
        }
    }

    /// Topic a stored message is republished to
    pub fn output_topic(&self, topic: &str) -> String {
        match self.topic_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{}{}", prefix, topic),
            _ => topic.to_string(),
        }
    }
}

/// Summary of one finished recorder run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RecordingReport {
    pub session_id: Uuid,
    pub messages_received: u64,
    pub rows_persisted: u64,
    pub batches_flushed: u64,
}

/// Summary of one finished playback run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlaybackReport {
    pub session_id: Uuid,
    pub messages_total: u64,
    pub messages_published: u64,
    pub cancelled: bool,
}

/// Short session view returned by create/list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionOut {
    pub id: Uuid,
    pub state: SessionState,
}

impl From<&RecordingSession> for SessionOut {
    fn from(session: &RecordingSession) -> Self {
        Self {
            id: session.id,
            state: session.state,
        }
    }
}

/// Message view returned by the retrieval API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageOut {
    pub ts: String,
    pub topic: String,
    pub payload: JsonValue,
    pub qos: u8,
    pub retained: bool,
}

impl From<BusMessage> for MessageOut {
    fn from(msg: BusMessage) -> Self {
        Self {
            ts: msg.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            topic: msg.topic,
            payload: JsonValue::Object(msg.payload),
            qos: msg.qos,
            retained: msg.retained,
        }
    }
}

/// Response for start/stop commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<JsonValue>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            report: None,
        }
    }

    /// The command succeeded even if its report cannot be encoded
    pub fn with_report<T: Serialize>(report: &T) -> Self {
        let report = match serde_json::to_value(report) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "Dropping run report that failed to serialize");
                None
            }
        };
        Self { ok: true, report }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
