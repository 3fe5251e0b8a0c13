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

// MQTT transport backed by rumqttc
//
// rumqttc only makes progress while its event loop is polled, so every
// connection owns a driver task that polls it and forwards incoming
// publishes into a bounded channel. When the channel is full the driver
// stops polling, which pushes back on the broker socket.
//
// The connection therefore keeps draining that channel whenever it waits
// on the driver itself: publishes arriving before a SUBACK are parked and
// served by recv() first, and close() shuts the channel before asking for
// DISCONNECT.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    Transport,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::{BusConnection, BusConnector, ConnectionRole, IncomingMessage};
use crate::config::{MqttConfig, TlsConfig};
use crate::error::TransportError;

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;

/// How long close() waits for the driver to flush the DISCONNECT
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type Incoming = Result<IncomingMessage, TransportError>;

/// Opens MQTT connections from configuration
pub struct MqttConnector {
    config: MqttConfig,
}

impl MqttConnector {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    fn client_id(&self, role: ConnectionRole) -> String {
        format!("{}{}", self.config.client_id, role.client_id_suffix())
    }
}

#[async_trait]
impl BusConnector for MqttConnector {
    async fn connect(&self, role: ConnectionRole) -> Result<Box<dyn BusConnection>, TransportError> {
        let client_id = self.client_id(role);
        let options = build_mqtt_options(&self.config, &client_id)?;
        let subscribe_qos = qos_from_u8(self.config.subscribe_qos)?;
        let publish_qos = qos_from_u8(self.config.publish_qos)?;

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(self.config.channel_capacity);
        let (suback_tx, suback_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let driver = tokio::spawn(drive_event_loop(
            eventloop,
            client_id.clone(),
            ready_tx,
            incoming_tx,
            suback_tx,
        ));

        let connect_timeout = self.config.connect_timeout();
        match timeout(connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Err(_)) => {
                return Err(TransportError::Connect(
                    "event loop exited before CONNACK".to_string(),
                ))
            }
            Err(_) => {
                driver.abort();
                return Err(TransportError::Connect(format!(
                    "no CONNACK from {}:{} within {:?}",
                    self.config.host, self.config.port, connect_timeout
                )));
            }
        }

        info!(
            mqtt_host = %self.config.host,
            mqtt_port = self.config.port,
            client_id = %client_id,
            "Connected to MQTT broker"
        );

        Ok(Box::new(MqttConnection {
            client,
            incoming: incoming_rx,
            pending: VecDeque::new(),
            subacks: suback_rx,
            driver: Some(driver),
            subscribe_qos,
            publish_qos,
            ack_timeout: connect_timeout,
            closed: false,
        }))
    }

    fn transport_type(&self) -> &str {
        "mqtt"
    }
}

/// Poll the event loop until DISCONNECT or the first error
///
/// Connection errors are not retried: polling again would make rumqttc
/// reconnect behind the engine's back.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    client_id: String,
    ready: oneshot::Sender<Result<(), TransportError>>,
    incoming: mpsc::Sender<Incoming>,
    subacks: mpsc::UnboundedSender<Vec<SubscribeReasonCode>>,
) {
    let mut ready = Some(ready);
    let mut forwarding = true;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if !forwarding {
                    continue;
                }
                let message = IncomingMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos as u8,
                    retain: publish.retain,
                };
                // Keep polling after the receiver closes so DISCONNECT still goes out
                if incoming.send(Ok(message)).await.is_err() {
                    debug!(client_id = %client_id, "Receiver closed, discarding publishes");
                    forwarding = false;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let _ = subacks.send(suback.return_codes);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(client_id = %client_id, "Disconnect sent");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(TransportError::Connect(err.to_string())));
                    }
                    None if forwarding => {
                        warn!(client_id = %client_id, error = %err, "MQTT event loop failed");
                        let _ = incoming
                            .send(Err(TransportError::Receive(err.to_string())))
                            .await;
                    }
                    None => {
                        debug!(client_id = %client_id, error = %err, "Event loop ended after close");
                    }
                }
                return;
            }
        }
    }
}

struct MqttConnection {
    client: AsyncClient,
    incoming: mpsc::Receiver<Incoming>,
    /// Publishes read off `incoming` while waiting for a SUBACK
    pending: VecDeque<Incoming>,
    subacks: mpsc::UnboundedReceiver<Vec<SubscribeReasonCode>>,
    driver: Option<JoinHandle<()>>,
    subscribe_qos: QoS,
    publish_qos: QoS,
    ack_timeout: Duration,
    closed: bool,
}

impl MqttConnection {
    /// Wait for the next SUBACK, parking publishes that arrive first
    ///
    /// Without this a burst of retained messages larger than the channel
    /// would stall the driver before it ever reads the SUBACK.
    async fn await_suback(&mut self) -> Result<Vec<SubscribeReasonCode>, String> {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            tokio::select! {
                codes = self.subacks.recv() => {
                    return codes.ok_or_else(|| "connection closed".to_string());
                }
                Some(item) = self.incoming.recv() => self.pending.push_back(item),
                _ = sleep_until(deadline) => {
                    return Err(format!("no SUBACK within {:?}", self.ack_timeout));
                }
            }
        }
    }
}

#[async_trait]
impl BusConnection for MqttConnection {
    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        let failed = |reason: String| TransportError::Subscribe {
            filter: filter.to_string(),
            reason,
        };

        self.client
            .subscribe(filter, self.subscribe_qos)
            .await
            .map_err(|e| failed(e.to_string()))?;

        // Subscriptions are issued one at a time, so the next SUBACK is ours
        let codes = self.await_suback().await.map_err(failed)?;
        if codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
        {
            Ok(())
        } else {
            Err(failed(format!("broker rejected subscription: {:?}", codes)))
        }
    }

    async fn recv(&mut self) -> Result<Option<IncomingMessage>, TransportError> {
        if let Some(parked) = self.pending.pop_front() {
            return parked.map(Some);
        }
        match self.incoming.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, self.publish_qos, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Unblocks a driver waiting on a full channel; unread publishes are dropped
        self.incoming.close();
        self.pending.clear();
        while self.incoming.try_recv().is_ok() {}

        // Fails only when the event loop is already gone
        if let Err(err) = self.client.disconnect().await {
            debug!(error = %err, "Disconnect request not delivered");
        }

        if let Some(mut driver) = self.driver.take() {
            if timeout(CLOSE_GRACE, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        Ok(())
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

fn build_mqtt_options(config: &MqttConfig, client_id: &str) -> Result<MqttOptions, TransportError> {
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);

    if let Some(user) = config.username.as_deref().filter(|u| !u.is_empty()) {
        options.set_credentials(user, config.password().unwrap_or_default());
    }

    if config.tls.enabled {
        options.set_transport(build_tls_transport(&config.tls)?);
    }

    Ok(options)
}

fn build_tls_transport(tls: &TlsConfig) -> Result<Transport, TransportError> {
    let ca_path = tls
        .ca_file
        .as_deref()
        .ok_or_else(|| TransportError::Connect("tls enabled without ca_file".to_string()))?;
    let ca = read_file(ca_path)?;

    let client_auth = match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => Some((read_file(cert)?, read_file(key)?)),
        _ => None,
    };

    Ok(Transport::tls(ca, client_auth, None))
}

fn read_file(path: &str) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path)
        .map_err(|e| TransportError::Connect(format!("failed to read `{}`: {}", path, e)))
}

fn qos_from_u8(qos: u8) -> Result<QoS, TransportError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::Connect(format!(
            "unsupported mqtt qos `{}`",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    type SubAckSender = mpsc::UnboundedSender<Vec<SubscribeReasonCode>>;

    /// Connection whose driver side is played by the test
    ///
    /// The event loop is returned unpolled so client requests still queue.
    fn offline_connection(
        capacity: usize,
    ) -> (MqttConnection, EventLoop, mpsc::Sender<Incoming>, SubAckSender) {
        let options = MqttOptions::new("offline", "localhost", 1883);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(capacity);
        let (suback_tx, suback_rx) = mpsc::unbounded_channel();
        let conn = MqttConnection {
            client,
            incoming: incoming_rx,
            pending: VecDeque::new(),
            subacks: suback_rx,
            driver: None,
            subscribe_qos: QoS::AtMostOnce,
            publish_qos: QoS::AtMostOnce,
            ack_timeout: Duration::from_secs(1),
            closed: false,
        };
        (conn, eventloop, incoming_tx, suback_tx)
    }

    fn retained(topic: &str) -> Incoming {
        Ok(IncomingMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"1"),
            qos: 0,
            retain: true,
        })
    }

    #[tokio::test]
    async fn test_retained_burst_before_suback_is_kept_in_order() {
        // More publishes than the channel holds arrive ahead of the SUBACK
        let (mut conn, _eventloop, incoming, subacks) = offline_connection(2);
        let driver = tokio::spawn(async move {
            for i in 0..5 {
                incoming.send(retained(&format!("state/{}", i))).await.unwrap();
            }
            subacks
                .send(vec![SubscribeReasonCode::Success(QoS::AtMostOnce)])
                .unwrap();
            incoming
        });

        conn.subscribe("state/#").await.unwrap();
        let _incoming = driver.await.unwrap();

        for i in 0..5 {
            let message = conn.recv().await.unwrap().unwrap();
            assert_eq!(message.topic, format!("state/{}", i));
        }
    }

    #[tokio::test]
    async fn test_rejected_suback_fails_subscribe() {
        let (mut conn, _eventloop, _incoming, subacks) = offline_connection(2);
        subacks.send(vec![SubscribeReasonCode::Failure]).unwrap();

        let err = conn.subscribe("denied/#").await.unwrap_err();
        assert!(matches!(err, TransportError::Subscribe { .. }));
    }

    #[tokio::test]
    async fn test_close_releases_driver_blocked_on_full_channel() {
        let (mut conn, _eventloop, incoming, _subacks) = offline_connection(1);
        conn.driver = Some(tokio::spawn(async move {
            while incoming.send(retained("busy/topic")).await.is_ok() {}
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        conn.close().await.unwrap();
        assert!(started.elapsed() < CLOSE_GRACE);
        assert!(conn.recv().await.unwrap().is_none());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_u8(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_u8(3).is_err());
    }

    #[test]
    fn test_player_uses_distinct_client_id() {
        let connector = MqttConnector::new(MqttConfig::default());
        assert_eq!(connector.client_id(ConnectionRole::Recorder), "mqtt-recorder");
        assert_eq!(connector.client_id(ConnectionRole::Player), "mqtt-recorder-player");
    }

    #[test]
    fn test_tls_requires_readable_ca() {
        let tls = TlsConfig {
            enabled: true,
            ca_file: Some("/nonexistent/ca.pem".to_string()),
            cert_file: None,
            key_file: None,
        };
        let Err(err) = build_tls_transport(&tls) else {
            panic!("expected TLS transport build to fail");
        };
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn test_options_carry_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("password");
        std::fs::write(&secret, "hunter2\n").unwrap();

        let config = MqttConfig {
            username: Some("recorder".to_string()),
            password_file: Some(secret.to_string_lossy().into_owned()),
            ..MqttConfig::default()
        };
        let options = build_mqtt_options(&config, "rec-1").unwrap();
        assert_eq!(
            options.credentials(),
            Some(("recorder".to_string(), "hunter2".to_string()))
        );
        assert_eq!(options.client_id(), "rec-1");
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1, // nothing listens here
            connect_timeout_ms: 500,
            ..MqttConfig::default()
        };
        let connector = MqttConnector::new(config);
        let result = connector.connect(ConnectionRole::Recorder).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
