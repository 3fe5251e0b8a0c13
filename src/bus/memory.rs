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

// In-process loopback bus
//
// Publishes are delivered to every connection with a matching filter,
// including the publisher's own. Used for tests and broker-less dry runs.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{topic_matches, valid_filter, BusConnection, BusConnector, ConnectionRole, IncomingMessage};
use crate::error::TransportError;

type Delivery = Result<IncomingMessage, TransportError>;

/// A publish observed on the bus
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub role: ConnectionRole,
    pub at: Instant,
}

struct Subscriber {
    connection_id: u64,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Subscriber>,
    published: Vec<PublishedMessage>,
    connections_opened: u64,
    publish_failure: Option<String>,
}

impl BusState {
    /// Deliver to every matching subscriber, returning the delivery count
    fn deliver(&mut self, message: &IncomingMessage) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|sub| {
            if !sub.filters.iter().any(|f| topic_matches(f, &message.topic)) {
                return true;
            }
            // A dropped receiver means the connection is gone
            let alive = sub.tx.send(Ok(message.clone())).is_ok();
            if alive {
                delivered += 1;
            }
            alive
        });
        delivered
    }
}

/// Loopback bus shared by all of its connections
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // The state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish from outside any connection, as an external device would
    pub fn inject(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: u8,
        retain: bool,
    ) -> usize {
        let message = IncomingMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
        };
        self.lock().deliver(&message)
    }

    /// Push a receive error to every open connection
    pub fn fail_connections(&self, reason: &str) {
        let mut state = self.lock();
        for sub in state.subscribers.drain(..) {
            let _ = sub.tx.send(Err(TransportError::Receive(reason.to_string())));
        }
    }

    /// Make every later publish fail with `reason`, or succeed again on `None`
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.lock().publish_failure = reason.map(str::to_string);
    }

    /// Everything published through a connection, in publish order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn connections_opened(&self) -> u64 {
        self.lock().connections_opened
    }

    /// Connections currently registered with at least one filter
    pub fn active_subscribers(&self) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| !s.filters.is_empty())
            .count()
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self, role: ConnectionRole) -> Result<Box<dyn BusConnection>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = {
            let mut state = self.lock();
            state.connections_opened += 1;
            let connection_id = state.connections_opened;
            state.subscribers.push(Subscriber {
                connection_id,
                filters: Vec::new(),
                tx,
            });
            connection_id
        };
        debug!(connection_id, ?role, "Memory bus connection opened");

        Ok(Box::new(MemoryConnection {
            bus: self.clone(),
            connection_id,
            role,
            rx,
            closed: false,
        }))
    }

    fn transport_type(&self) -> &str {
        "memory"
    }
}

struct MemoryConnection {
    bus: MemoryBus,
    connection_id: u64,
    role: ConnectionRole,
    rx: mpsc::UnboundedReceiver<Delivery>,
    closed: bool,
}

impl MemoryConnection {
    fn detach(&mut self) {
        let id = self.connection_id;
        self.bus.lock().subscribers.retain(|s| s.connection_id != id);
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if !valid_filter(filter) {
            return Err(TransportError::Subscribe {
                filter: filter.to_string(),
                reason: "malformed topic filter".to_string(),
            });
        }

        let mut state = self.bus.lock();
        match state
            .subscribers
            .iter_mut()
            .find(|s| s.connection_id == self.connection_id)
        {
            Some(sub) => {
                sub.filters.push(filter.to_string());
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&mut self) -> Result<Option<IncomingMessage>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let message = IncomingMessage {
            topic: topic.to_string(),
            payload: Bytes::from(payload),
            qos: 0,
            retain: false,
        };

        let mut state = self.bus.lock();
        if let Some(reason) = &state.publish_failure {
            return Err(TransportError::Publish {
                topic: message.topic,
                reason: reason.clone(),
            });
        }
        state.published.push(PublishedMessage {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            role: self.role,
            at: Instant::now(),
        });
        state.deliver(&message);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.detach();
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inject_reaches_matching_subscriber_only() {
        let bus = MemoryBus::new();
        let mut sensors = bus.connect(ConnectionRole::Recorder).await.unwrap();
        sensors.subscribe("sensors/#").await.unwrap();
        let mut other = bus.connect(ConnectionRole::Recorder).await.unwrap();
        other.subscribe("alarms/+").await.unwrap();

        assert_eq!(bus.inject("sensors/temp/1", &b"21.5"[..], 1, false), 1);

        let msg = sensors.recv().await.unwrap().unwrap();
        assert_eq!(msg.topic, "sensors/temp/1");
        assert_eq!(msg.payload, Bytes::from_static(b"21.5"));
        assert_eq!(msg.qos, 1);
    }

    #[tokio::test]
    async fn test_publish_is_recorded_and_looped_back() {
        let bus = MemoryBus::new();
        let mut listener = bus.connect(ConnectionRole::Recorder).await.unwrap();
        listener.subscribe("replay/#").await.unwrap();

        let mut player = bus.connect(ConnectionRole::Player).await.unwrap();
        player.publish("replay/a", b"{}".to_vec()).await.unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].role, ConnectionRole::Player);
        assert_eq!(listener.recv().await.unwrap().unwrap().topic, "replay/a");
    }

    #[tokio::test]
    async fn test_malformed_filter_is_rejected() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect(ConnectionRole::Recorder).await.unwrap();
        let err = conn.subscribe("a/#/b").await.unwrap_err();
        assert!(matches!(err, TransportError::Subscribe { .. }));
    }

    #[tokio::test]
    async fn test_close_detaches_connection() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect(ConnectionRole::Recorder).await.unwrap();
        conn.subscribe("#").await.unwrap();
        assert_eq!(bus.active_subscribers(), 1);

        conn.close().await.unwrap();
        assert_eq!(bus.active_subscribers(), 0);
        assert_eq!(bus.inject("x", &b"1"[..], 0, false), 0);
        assert!(conn.publish("x", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_failure_can_be_toggled() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect(ConnectionRole::Player).await.unwrap();

        bus.fail_publishes(Some("broker refused"));
        let err = conn.publish("a/1", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::Publish { ref topic, .. } if topic == "a/1"));
        assert!(bus.published().is_empty());

        bus.fail_publishes(None);
        conn.publish("a/1", b"{}".to_vec()).await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_surfaced_by_recv() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect(ConnectionRole::Recorder).await.unwrap();
        conn.subscribe("#").await.unwrap();

        bus.fail_connections("broker went away");
        assert!(matches!(conn.recv().await, Err(TransportError::Receive(_))));
    }
}
