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

// Ingest queue and batch writer
//
// The receive loop pushes captured messages into a bounded queue; the
// writer drains it and bulk-inserts on a size-or-time trigger. A full
// queue suspends the receive loop, which is the only backpressure point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::config::FlushPolicy;
use crate::error::RecorderError;
use crate::protocol::NewBusMessage;
use crate::storage::RecordingStore;

/// One queue slot
#[derive(Debug)]
pub enum IngestItem {
    Message(NewBusMessage),
    /// Flush whatever is pending and stop; always the last item of a run
    Flush,
}

/// The writer side of the queue has gone away
#[derive(Debug, Error)]
#[error("ingest queue closed")]
pub struct QueueClosed;

/// Create a bounded ingest queue
pub fn ingest_queue(capacity: usize) -> (IngestSender, IngestReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (IngestSender { tx }, IngestReceiver { rx })
}

/// Producer half, owned by the receive loop
///
/// Not cloneable: `finish` consumes the only sender, so nothing can be
/// enqueued after the sentinel.
pub struct IngestSender {
    tx: mpsc::Sender<IngestItem>,
}

impl IngestSender {
    /// Enqueue a message, waiting while the queue is full
    pub async fn enqueue(&self, message: NewBusMessage) -> Result<(), QueueClosed> {
        self.tx
            .send(IngestItem::Message(message))
            .await
            .map_err(|_| QueueClosed)
    }

    /// Enqueue the termination sentinel
    pub async fn finish(self) -> Result<(), QueueClosed> {
        self.tx.send(IngestItem::Flush).await.map_err(|_| QueueClosed)
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half, owned by the writer
pub struct IngestReceiver {
    rx: mpsc::Receiver<IngestItem>,
}

impl IngestReceiver {
    /// Wait for the next item; a dropped sender reads as the sentinel
    ///
    /// Cancel-safe.
    pub async fn dequeue(&mut self) -> IngestItem {
        self.rx.recv().await.unwrap_or(IngestItem::Flush)
    }
}

/// Running totals of one writer
#[derive(Debug, Default)]
pub struct WriterStats {
    rows_persisted: AtomicU64,
    batches_flushed: AtomicU64,
}

impl WriterStats {
    pub fn rows_persisted(&self) -> u64 {
        self.rows_persisted.load(Ordering::Relaxed)
    }

    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed.load(Ordering::Relaxed)
    }
}

/// Drains an ingest queue into the store
pub struct BatchWriter {
    store: Arc<dyn RecordingStore>,
    policy: FlushPolicy,
    stats: Arc<WriterStats>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn RecordingStore>, policy: FlushPolicy) -> Self {
        Self {
            store,
            policy,
            stats: Arc::new(WriterStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the sentinel arrives or a flush fails
    ///
    /// Dropping the receiver on failure makes the next enqueue fail, which
    /// is how the receive loop learns the run is over.
    pub async fn run(self, mut queue: IngestReceiver) -> Result<Arc<WriterStats>, RecorderError> {
        let interval = self.policy.flush_interval();
        let mut batch = Vec::with_capacity(self.policy.batch_size);
        let mut deadline = Instant::now() + interval;

        loop {
            tokio::select! {
                item = queue.dequeue() => match item {
                    IngestItem::Message(message) => {
                        batch.push(message);
                        if batch.len() >= self.policy.batch_size || Instant::now() >= deadline {
                            self.flush(&mut batch).await?;
                            deadline = Instant::now() + interval;
                        }
                    }
                    IngestItem::Flush => {
                        self.flush(&mut batch).await?;
                        debug!(
                            rows = self.stats.rows_persisted(),
                            batches = self.stats.batches_flushed(),
                            "Writer drained"
                        );
                        return Ok(self.stats);
                    }
                },
                _ = sleep_until(deadline) => {
                    self.flush(&mut batch).await?;
                    deadline = Instant::now() + interval;
                }
            }
        }
    }

    /// One bulk insert per trigger; empty batches are skipped
    async fn flush(&self, batch: &mut Vec<NewBusMessage>) -> Result<(), RecorderError> {
        if batch.is_empty() {
            return Ok(());
        }

        let rows = self.store.insert_messages(batch).await?;
        batch.clear();

        self.stats.rows_persisted.fetch_add(rows, Ordering::Relaxed);
        self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
        info!(rows = rows, "Persisted batch");
        Ok(())
    }
}
