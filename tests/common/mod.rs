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

// Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bus_recorder::error::StorageError;
use bus_recorder::normalizer::normalize;
use bus_recorder::protocol::{
    BusMessage, MessageQuery, NewBusMessage, NewSession, RecordingSession,
};
use bus_recorder::storage::{MemoryStore, RecordingStore};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub async fn create_session(store: &dyn RecordingStore, filters: &[&str]) -> RecordingSession {
    store
        .create_session(NewSession {
            node: "test-node".to_string(),
            topic_filters: filters.iter().map(|f| f.to_string()).collect(),
        })
        .await
        .unwrap()
}

/// Fixed reference instant so offsets are exact
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn message_at(session_id: Uuid, topic: &str, offset_ms: i64, body: &[u8]) -> NewBusMessage {
    NewBusMessage {
        session_id,
        timestamp: base_time() + ChronoDuration::milliseconds(offset_ms),
        topic: topic.to_string(),
        payload: normalize(body),
        qos: 0,
        retained: false,
    }
}

/// Memory store whose inserts or stop transitions can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_inserts: AtomicBool,
    fail_mark_stopped: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let store = Self::default();
        store.fail_inserts(true);
        store
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mark_stopped(&self, fail: bool) {
        self.fail_mark_stopped.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordingStore for FlakyStore {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.inner.initialize().await
    }

    async fn create_session(&self, new: NewSession) -> Result<RecordingSession, StorageError> {
        self.inner.create_session(new).await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<RecordingSession>, StorageError> {
        self.inner.get_session(id).await
    }

    async fn list_sessions(&self) -> Result<Vec<RecordingSession>, StorageError> {
        self.inner.list_sessions().await
    }

    async fn mark_recording(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError> {
        self.inner.mark_recording(id, at).await
    }

    async fn mark_stopped(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError> {
        if self.fail_mark_stopped.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("database is locked".to_string()));
        }
        self.inner.mark_stopped(id, at).await
    }

    async fn insert_messages(&self, batch: &[NewBusMessage]) -> Result<u64, StorageError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk full".to_string()));
        }
        self.inner.insert_messages(batch).await
    }

    async fn session_messages(&self, session_id: Uuid) -> Result<Vec<BusMessage>, StorageError> {
        self.inner.session_messages(session_id).await
    }

    async fn query_messages(&self, query: &MessageQuery) -> Result<Vec<BusMessage>, StorageError> {
        self.inner.query_messages(query).await
    }

    fn backend_type(&self) -> &str {
        "flaky"
    }
}
