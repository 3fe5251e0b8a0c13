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

// Replays a stored session onto the bus
//
// Messages go out strictly in (timestamp, id) order. Each one waits for
// the scaled gap to its predecessor; a stop interrupts the wait.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusConnection, BusConnector, ConnectionRole};
use crate::error::{RecorderError, Result, StorageError};
use crate::guard::{RunSlot, RunStatus};
use crate::protocol::{BusMessage, PlaybackOptions, PlaybackReport};
use crate::storage::RecordingStore;

/// Replays one session at a time
pub struct Player {
    store: Arc<dyn RecordingStore>,
    bus: Arc<dyn BusConnector>,
    slot: RunSlot<PlaybackReport>,
    published: Arc<AtomicU64>,
}

impl Player {
    pub fn new(store: Arc<dyn RecordingStore>, bus: Arc<dyn BusConnector>) -> Self {
        Self {
            store,
            bus,
            slot: RunSlot::new("playback"),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start replaying a session
    ///
    /// A session without messages finishes at once without touching the bus.
    pub async fn start(&self, session_id: Uuid, options: PlaybackOptions) -> Result<()> {
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let published = Arc::clone(&self.published);

        self.slot
            .try_start(session_id, move |cancel| async move {
                if store.get_session(session_id).await?.is_none() {
                    return Err(RecorderError::NotFound(session_id));
                }
                let messages = store.session_messages(session_id).await?;

                published.store(0, Ordering::Relaxed);
                let run = PlaybackRun {
                    session_id,
                    bus,
                    messages,
                    options,
                    published,
                };
                Ok::<_, RecorderError>(run.run(cancel))
            })
            .await?;

        info!(session_id = %session_id, "Playback started");
        Ok(())
    }

    /// Stop the active playback and wait for it to exit
    pub async fn stop(&self) -> Result<Option<PlaybackReport>> {
        let Some(exit) = self.slot.stop().await else {
            return Ok(None);
        };

        match exit.result {
            Ok(report) => {
                info!(
                    session_id = %exit.session_id,
                    published = report.messages_published,
                    cancelled = report.cancelled,
                    "Playback stopped"
                );
                Ok(Some(report))
            }
            Err(err) => {
                error!(session_id = %exit.session_id, error = %err, "Playback ended with error");
                Err(err)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_running()
    }

    pub fn status(&self) -> RunStatus {
        self.slot.status()
    }

    /// Messages published by the current (or last) run
    pub fn messages_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn watch(&self) -> tokio::sync::watch::Receiver<RunStatus> {
        self.slot.watch()
    }
}

/// Gap between two captures, divided by the replay speed
pub fn scaled_delay(previous: DateTime<Utc>, current: DateTime<Utc>, speed: f64) -> Duration {
    let micros = (current - previous).num_microseconds().unwrap_or(0);
    if micros <= 0 {
        return Duration::ZERO;
    }
    Duration::from_micros((micros as f64 / speed).round() as u64)
}

struct PlaybackRun {
    session_id: Uuid,
    bus: Arc<dyn BusConnector>,
    messages: Vec<BusMessage>,
    options: PlaybackOptions,
    published: Arc<AtomicU64>,
}

impl PlaybackRun {
    async fn run(self, cancel: CancellationToken) -> Result<PlaybackReport> {
        let mut report = PlaybackReport {
            session_id: self.session_id,
            messages_total: self.messages.len() as u64,
            ..PlaybackReport::default()
        };

        if self.messages.is_empty() {
            info!(session_id = %self.session_id, "Nothing to replay");
            return Ok(report);
        }

        let mut conn = self.bus.connect(ConnectionRole::Player).await?;
        let result = self.publish_all(conn.as_mut(), &cancel, &mut report).await;
        if let Err(err) = conn.close().await {
            warn!(session_id = %self.session_id, error = %err, "Failed to close bus connection");
        }

        result.map(|()| report)
    }

    async fn publish_all(
        &self,
        conn: &mut dyn BusConnection,
        cancel: &CancellationToken,
        report: &mut PlaybackReport,
    ) -> Result<()> {
        let speed = self.options.effective_speed();
        let mut previous: Option<DateTime<Utc>> = None;

        for message in &self.messages {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            if let Some(previous) = previous {
                let delay = scaled_delay(previous, message.timestamp, speed);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            report.cancelled = true;
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            previous = Some(message.timestamp);

            let payload = serde_json::to_vec(&message.payload).map_err(StorageError::from)?;
            let topic = self.options.output_topic(&message.topic);
            conn.publish(&topic, payload).await?;

            report.messages_published += 1;
            self.published.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            session_id = %self.session_id,
            published = report.messages_published,
            total = report.messages_total,
            "Replay loop finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn test_scaled_delay() {
        assert_eq!(scaled_delay(at(0), at(100), 1.0), Duration::from_millis(100));
        assert_eq!(scaled_delay(at(0), at(100), 2.0), Duration::from_millis(50));
        assert_eq!(scaled_delay(at(0), at(100), 0.5), Duration::from_millis(200));
    }

    #[test]
    fn test_out_of_order_or_equal_timestamps_do_not_wait() {
        assert_eq!(scaled_delay(at(100), at(100), 1.0), Duration::ZERO);
        assert_eq!(scaled_delay(at(100), at(50), 1.0), Duration::ZERO);
    }
}
