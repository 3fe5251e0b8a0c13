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

// SQLite backend implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::backend::RecordingStore;
use crate::config::SqliteConfig;
use crate::error::StorageError;
use crate::protocol::{
    BusMessage, MessageQuery, NewBusMessage, NewSession, RecordingSession, SessionState,
};

/// Rows per INSERT statement, keeping bind parameters well under SQLite's limit
const INSERT_CHUNK_ROWS: usize = 1000;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS recording_session (
        id TEXT PRIMARY KEY,
        node TEXT NOT NULL,
        topic_filters TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'CREATED',
        created_at_us INTEGER NOT NULL,
        started_at_us INTEGER,
        stopped_at_us INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS bus_message (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES recording_session(id),
        ts_us INTEGER NOT NULL,
        topic TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        qos INTEGER NOT NULL DEFAULT 0,
        retained INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS ix_msg_session_ts ON bus_message (session_id, ts_us)",
    "CREATE INDEX IF NOT EXISTS ix_msg_session_topic ON bus_message (session_id, topic)",
];

const MESSAGE_COLUMNS: &str = "id, session_id, ts_us, topic, payload_json, qos, retained";

/// Sessions and messages in a SQLite database
pub struct SqliteBackend {
    pool: SqlitePool,
    path: String,
}

impl SqliteBackend {
    /// Build the backend; connections are opened lazily by `initialize`
    pub fn new(config: &SqliteConfig) -> Result<Self, StorageError> {
        let (options, max_connections) = if config.is_in_memory() {
            // One connection keeps the in-memory database alive for the pool's lifetime
            (SqliteConnectOptions::from_str("sqlite::memory:")?, 1)
        } else {
            (
                SqliteConnectOptions::new()
                    .filename(&config.path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal),
                config.max_connections,
            )
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with(options.foreign_keys(true));

        info!("Initializing sqlite backend at: {}", config.path);

        Ok(Self {
            pool,
            path: config.path.clone(),
        })
    }

    /// Create the database's parent directory if needed
    async fn ensure_parent_directory(&self) -> Result<(), StorageError> {
        if self.path == ":memory:" {
            return Ok(());
        }
        if let Some(parent) = Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                info!("Creating database directory: {}", parent.display());
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StorageError::Backend(format!(
                        "failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_micros(us: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::<Utc>::from_timestamp_micros(us)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {}", us)))
}

fn parse_uuid(text: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(text).map_err(|e| StorageError::Corrupt(format!("bad id `{}`: {}", text, e)))
}

fn session_from_row(row: &SqliteRow) -> Result<RecordingSession, StorageError> {
    let id: String = row.try_get("id")?;
    let filters: String = row.try_get("topic_filters")?;
    let state: String = row.try_get("state")?;
    let started_at: Option<i64> = row.try_get("started_at_us")?;
    let stopped_at: Option<i64> = row.try_get("stopped_at_us")?;

    Ok(RecordingSession {
        id: parse_uuid(&id)?,
        node: row.try_get("node")?,
        topic_filters: serde_json::from_str(&filters)?,
        state: SessionState::from_str(&state).map_err(StorageError::Corrupt)?,
        created_at: from_micros(row.try_get("created_at_us")?)?,
        started_at: started_at.map(from_micros).transpose()?,
        stopped_at: stopped_at.map(from_micros).transpose()?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<BusMessage, StorageError> {
    let session_id: String = row.try_get("session_id")?;
    let payload: String = row.try_get("payload_json")?;
    let qos: i64 = row.try_get("qos")?;

    Ok(BusMessage {
        id: row.try_get("id")?,
        session_id: parse_uuid(&session_id)?,
        timestamp: from_micros(row.try_get("ts_us")?)?,
        topic: row.try_get("topic")?,
        payload: serde_json::from_str(&payload)?,
        qos: u8::try_from(qos).map_err(|_| StorageError::Corrupt(format!("bad qos {}", qos)))?,
        retained: row.try_get("retained")?,
    })
}

#[async_trait]
impl RecordingStore for SqliteBackend {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.ensure_parent_directory().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("sqlite schema ready");
        Ok(())
    }

    async fn create_session(&self, new: NewSession) -> Result<RecordingSession, StorageError> {
        let session = RecordingSession::new(new.node, new.topic_filters);

        sqlx::query(
            "INSERT INTO recording_session (id, node, topic_filters, state, created_at_us)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(&session.node)
        .bind(serde_json::to_string(&session.topic_filters)?)
        .bind(session.state.as_str())
        .bind(session.created_at.timestamp_micros())
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<RecordingSession>, StorageError> {
        let row = sqlx::query("SELECT * FROM recording_session WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(&self) -> Result<Vec<RecordingSession>, StorageError> {
        let rows = sqlx::query("SELECT * FROM recording_session ORDER BY created_at_us DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn mark_recording(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE recording_session SET state = 'RECORDING', started_at_us = ?
             WHERE id = ? AND state = 'CREATED'",
        )
        .bind(at.timestamp_micros())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_stopped(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE recording_session SET state = 'STOPPED', stopped_at_us = ?
             WHERE id = ? AND state = 'RECORDING'",
        )
        .bind(at.timestamp_micros())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_messages(&self, batch: &[NewBusMessage]) -> Result<u64, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in batch.chunks(INSERT_CHUNK_ROWS) {
            let rows = chunk
                .iter()
                .map(|m| {
                    Ok((
                        m.session_id.to_string(),
                        m.timestamp.timestamp_micros(),
                        m.topic.clone(),
                        serde_json::to_string(&m.payload)?,
                        i64::from(m.qos),
                        m.retained,
                    ))
                })
                .collect::<Result<Vec<_>, StorageError>>()?;

            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO bus_message (session_id, ts_us, topic, payload_json, qos, retained) ",
            );
            builder.push_values(rows, |mut b, (session_id, ts, topic, payload, qos, retained)| {
                b.push_bind(session_id)
                    .push_bind(ts)
                    .push_bind(topic)
                    .push_bind(payload)
                    .push_bind(qos)
                    .push_bind(retained);
            });

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn session_messages(&self, session_id: Uuid) -> Result<Vec<BusMessage>, StorageError> {
        let sql = format!(
            "SELECT {} FROM bus_message WHERE session_id = ? ORDER BY ts_us ASC, id ASC",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn query_messages(&self, query: &MessageQuery) -> Result<Vec<BusMessage>, StorageError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM bus_message WHERE session_id = ",
            MESSAGE_COLUMNS
        ));
        builder.push_bind(query.session_id.to_string());

        if let Some(prefix) = query.prefix() {
            // substr comparison avoids LIKE wildcard escaping
            builder
                .push(" AND substr(topic, 1, length(")
                .push_bind(prefix.to_string())
                .push(")) = ")
                .push_bind(prefix.to_string());
        }

        builder
            .push(" ORDER BY ts_us ASC, id ASC LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(query.offset));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(message_from_row).collect()
    }

    fn backend_type(&self) -> &str {
        "sqlite"
    }
}
