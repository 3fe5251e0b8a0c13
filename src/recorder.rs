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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::{ingest_queue, BatchWriter, IngestSender, WriterStats};
use crate::bus::{BusConnection, BusConnector, ConnectionRole};
use crate::config::RecorderSettings;
use crate::error::{RecorderError, Result, TransportError};
use crate::guard::{RunSlot, RunStatus};
use crate::normalizer::normalize;
use crate::protocol::{capture_time, validate_topic_filters, NewBusMessage, RecordingReport};
use crate::storage::RecordingStore;

/// Records one session at a time from the bus into the store
pub struct Recorder {
    store: Arc<dyn RecordingStore>,
    bus: Arc<dyn BusConnector>,
    settings: RecorderSettings,
    slot: RunSlot<RecordingReport>,
    received: Arc<AtomicU64>,
}

impl Recorder {
    pub fn new(
        store: Arc<dyn RecordingStore>,
        bus: Arc<dyn BusConnector>,
        settings: RecorderSettings,
    ) -> Self {
        Self {
            store,
            bus,
            settings,
            slot: RunSlot::new("recorder"),
            received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start recording a session
    ///
    /// The session is marked RECORDING before the first subscription. Any
    /// connect or subscribe failure aborts the start and is returned here.
    pub async fn start(&self, session_id: Uuid) -> Result<()> {
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let settings = self.settings.clone();
        let received = Arc::clone(&self.received);

        self.slot
            .try_start(session_id, move |cancel| async move {
                let session = store
                    .get_session(session_id)
                    .await?
                    .ok_or(RecorderError::NotFound(session_id))?;
                validate_topic_filters(&session.topic_filters)?;

                let marked = store.mark_recording(session_id, capture_time()).await?;
                let conn = match open_subscribed(bus.as_ref(), &session.topic_filters).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        if marked {
                            if let Err(stop_err) =
                                store.mark_stopped(session_id, capture_time()).await
                            {
                                warn!(
                                    session_id = %session_id,
                                    error = %stop_err,
                                    "Failed to mark session stopped after aborted start"
                                );
                            }
                        }
                        return Err(err.into());
                    }
                };

                received.store(0, Ordering::Relaxed);
                let run = RecordingRun {
                    session_id,
                    store,
                    conn,
                    settings,
                    received,
                };
                Ok::<_, RecorderError>(run.run(cancel))
            })
            .await?;

        info!(session_id = %session_id, "Recording started");
        Ok(())
    }

    /// Stop the active run, flushing everything it received
    ///
    /// Returns the run's report, or the error that ended it. A no-op when
    /// nothing is recording.
    pub async fn stop(&self) -> Result<Option<RecordingReport>> {
        let Some(exit) = self.slot.stop().await else {
            return Ok(None);
        };

        match exit.result {
            Ok(report) => {
                info!(
                    session_id = %exit.session_id,
                    messages = report.messages_received,
                    rows = report.rows_persisted,
                    "Recording stopped"
                );
                Ok(Some(report))
            }
            Err(err) => {
                error!(session_id = %exit.session_id, error = %err, "Recording ended with error");
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

    /// Session being recorded, if any
    pub fn active_session(&self) -> Option<Uuid> {
        let status = self.slot.status();
        if self.slot.is_running() {
            status.session_id
        } else {
            None
        }
    }

    /// Messages accepted by the current (or last) run
    pub fn messages_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn watch(&self) -> tokio::sync::watch::Receiver<RunStatus> {
        self.slot.watch()
    }
}

async fn open_subscribed(
    bus: &dyn BusConnector,
    filters: &[String],
) -> std::result::Result<Box<dyn BusConnection>, TransportError> {
    let mut conn = bus.connect(ConnectionRole::Recorder).await?;
    for filter in filters {
        if let Err(err) = conn.subscribe(filter).await {
            if let Err(close_err) = conn.close().await {
                debug!(error = %close_err, "Close after failed subscribe");
            }
            return Err(err);
        }
        debug!(filter = %filter, "Subscribed");
    }
    Ok(conn)
}

struct RecordingRun {
    session_id: Uuid,
    store: Arc<dyn RecordingStore>,
    conn: Box<dyn BusConnection>,
    settings: RecorderSettings,
    received: Arc<AtomicU64>,
}

impl RecordingRun {
    async fn run(mut self, cancel: CancellationToken) -> Result<RecordingReport> {
        let (queue, queue_rx) = ingest_queue(self.settings.queue_capacity);
        let writer = BatchWriter::new(
            Arc::clone(&self.store),
            self.settings.flush_policy.clone(),
        );
        let stats = writer.stats();
        let writer = tokio::spawn(writer.run(queue_rx));

        let loop_result = self.receive_loop(&queue, &writer, &cancel).await;

        // Sentinel goes last; if the writer already failed this is a no-op
        if queue.finish().await.is_err() {
            debug!(session_id = %self.session_id, "Writer gone before sentinel");
        }
        let writer_result = match writer.await {
            Ok(result) => result.map(|_| ()),
            Err(join_err) => Err(join_err.into()),
        };

        if let Err(err) = self.conn.close().await {
            warn!(session_id = %self.session_id, error = %err, "Failed to close bus connection");
        }
        let stopped = self
            .store
            .mark_stopped(self.session_id, capture_time())
            .await;

        loop_result?;
        writer_result?;
        stopped?;
        Ok(self.report(&stats))
    }

    /// Receive until cancelled, the connection fails, or the writer exits
    async fn receive_loop(
        &mut self,
        queue: &IngestSender,
        writer: &JoinHandle<Result<Arc<WriterStats>>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let poll = self.settings.receive_poll();

        loop {
            // A finished writer means a flush failed; its error is reported on join
            if writer.is_finished() {
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = timeout(poll, self.conn.recv()) => next,
            };

            let incoming = match next {
                Err(_elapsed) => continue,
                Ok(Ok(Some(incoming))) => incoming,
                Ok(Ok(None)) => return Err(TransportError::Closed.into()),
                Ok(Err(err)) => {
                    error!(session_id = %self.session_id, error = %err, "Bus receive failed");
                    return Err(err.into());
                }
            };

            let message = NewBusMessage {
                session_id: self.session_id,
                timestamp: capture_time(),
                payload: normalize(&incoming.payload),
                topic: incoming.topic,
                qos: incoming.qos,
                retained: incoming.retain,
            };
            if queue.enqueue(message).await.is_err() {
                return Ok(());
            }
            self.received.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn report(&self, stats: &WriterStats) -> RecordingReport {
        RecordingReport {
            session_id: self.session_id,
            messages_received: self.received.load(Ordering::Relaxed),
            rows_persisted: stats.rows_persisted(),
            batches_flushed: stats.batches_flushed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::protocol::{NewSession, SessionState};
    use crate::storage::MemoryStore;
    use std::time::Duration;

    async fn setup() -> (Arc<MemoryStore>, MemoryBus, Recorder) {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let recorder = Recorder::new(
            store.clone(),
            Arc::new(bus.clone()),
            RecorderSettings::default(),
        );
        (store, bus, recorder)
    }

    async fn wait_received(recorder: &Recorder, count: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.messages_received() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (_store, bus, recorder) = setup().await;
        let err = recorder.start(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RecorderError::NotFound(_)));
        assert!(!recorder.is_running());
        assert_eq!(bus.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_session_transitions_follow_run() {
        let (store, bus, recorder) = setup().await;
        let session = store
            .create_session(NewSession {
                node: "edge-1".to_string(),
                topic_filters: vec!["plant/#".to_string()],
            })
            .await
            .unwrap();

        recorder.start(session.id).await.unwrap();
        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Recording);
        assert_eq!(recorder.active_session(), Some(session.id));

        bus.inject("plant/a", &b"{\"v\":1}"[..], 0, false);
        wait_received(&recorder, 1).await;

        let report = recorder.stop().await.unwrap().unwrap();
        assert_eq!(report.messages_received, 1);
        assert_eq!(report.rows_persisted, 1);

        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Stopped);
        assert!(stored.stopped_at >= stored.started_at);
        assert_eq!(bus.active_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_aborts_start() {
        let (store, bus, recorder) = setup().await;
        let session = store
            .create_session(NewSession {
                node: "edge-1".to_string(),
                topic_filters: vec!["ok/#".to_string(), "bad/#/filter".to_string()],
            })
            .await
            .unwrap();

        let err = recorder.start(session.id).await.unwrap_err();
        assert!(matches!(err, RecorderError::Transport(_)));
        assert!(!recorder.is_running());
        assert_eq!(bus.active_subscribers(), 0);

        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Stopped);
    }
}
