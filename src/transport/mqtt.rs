//! MQTT connections: one subscriber for detections, one publisher for events.
//!
//! Both use the blocking rumqttc v5 client. The event loop of each runs on
//! its own thread and keeps iterating through connection errors, which makes
//! rumqttc reconnect; subscriptions and the `online` announcement are
//! re-sent on every ConnAck.

use anyhow::{anyhow, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::tls::{MqttEndpoint, TlsMaterials};
use crate::publish::discovery::{PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use crate::publish::{DiscoveryPublisher, EventSink, InteractionEvent, OutboundMessage};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 64;

/// Everything needed to open a broker connection.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttSettings {
    fn options(&self, client_id: &str) -> Result<MqttOptions> {
        let mut options = MqttOptions::new(client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(user) = &self.username {
            options.set_credentials(user, self.password.clone().unwrap_or_default());
        }
        options.set_transport(self.tls.build_transport(&self.endpoint)?);
        Ok(options)
    }
}

/// Stops a connection loop from another thread (the ctrl-c handler).
#[derive(Clone)]
pub struct ConnectionStopper {
    client: Client,
    stopping: Arc<AtomicBool>,
}

impl ConnectionStopper {
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect request failed: {}", e);
        }
    }
}

/// Subscriber side: delivers every publish on the given topics to a callback.
pub struct MqttSubscriber {
    client: Client,
    connection: Connection,
    topics: Vec<String>,
    stopping: Arc<AtomicBool>,
}

impl MqttSubscriber {
    pub fn connect(settings: &MqttSettings, topics: Vec<String>) -> Result<Self> {
        let client_id = format!("{}-ingest", settings.client_id);
        let (client, connection) = Client::new(settings.options(&client_id)?, REQUEST_CAPACITY);
        log::info!(
            "connecting ingest client to {}:{} (TLS: {}, auth: {})",
            settings.endpoint.host,
            settings.endpoint.port,
            settings.endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            connection,
            topics,
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stopper(&self) -> ConnectionStopper {
        ConnectionStopper {
            client: self.client.clone(),
            stopping: self.stopping.clone(),
        }
    }

    /// Block until stopped, calling `on_message(topic, payload)` per publish.
    pub fn run<F>(mut self, mut on_message: F)
    where
        F: FnMut(&str, &[u8]),
    {
        for event in self.connection.iter() {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    for topic in &self.topics {
                        match self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                            Ok(()) => log::info!("subscribed to {}", topic),
                            Err(e) => log::error!("subscribe to {} failed: {}", topic, e),
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let topic = match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => topic,
                        Err(e) => {
                            log::warn!("skipping publish with invalid topic: {}", e);
                            continue;
                        }
                    };
                    on_message(topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    if self.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    log::error!(
                        "MQTT ingest connection error: {}. Reconnecting in {:?}",
                        e,
                        RECONNECT_DELAY
                    );
                    std::thread::sleep(RECONNECT_DELAY);
                }
            }
        }
        log::info!("ingest connection closed");
    }
}

/// Publisher side: a client whose event loop is drained on a background thread.
///
/// Sets an `offline` last-will on the availability topic and announces
/// `online` (retained) after each (re)connect.
pub struct MqttPublisher {
    client: Client,
    availability_topic: String,
    stopping: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    pub fn connect(settings: &MqttSettings, availability_topic: &str) -> Result<Self> {
        let client_id = format!("{}-events", settings.client_id);
        let mut options = settings.options(&client_id)?;
        options.set_last_will(LastWill::new(
            availability_topic,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = {
            let client = client.clone();
            let stopping = stopping.clone();
            let availability_topic = availability_topic.to_string();
            std::thread::Builder::new()
                .name("mqtt-publisher".to_string())
                .spawn(move || drain_connection(connection, client, availability_topic, stopping))?
        };
        log::info!(
            "connecting event client to {}:{} (TLS: {}, auth: {})",
            settings.endpoint.host,
            settings.endpoint.port,
            settings.endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            availability_topic: availability_topic.to_string(),
            stopping,
            connection_handle: Some(handle),
        })
    }

    /// Cheap handle for the event sink.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Announce `offline`, then close the connection.
    pub fn disconnect(mut self) -> Result<()> {
        if let Err(e) = publish_qos1(
            &self.client,
            &OutboundMessage {
                topic: self.availability_topic.clone(),
                payload: PAYLOAD_OFFLINE.as_bytes().to_vec(),
                retain: true,
            },
        ) {
            log::warn!("could not announce offline: {}", e);
        }
        self.stopping.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        if let Some(handle) = self.connection_handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("MQTT publisher thread panicked"))?;
        }
        Ok(())
    }
}

fn drain_connection(
    mut connection: Connection,
    client: Client,
    availability_topic: String,
    stopping: Arc<AtomicBool>,
) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                log::info!("event connection established");
                let online = OutboundMessage {
                    topic: availability_topic.clone(),
                    payload: PAYLOAD_ONLINE.as_bytes().to_vec(),
                    retain: true,
                };
                if let Err(e) = publish_qos1(&client, &online) {
                    log::warn!("could not announce online: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!(
                    "MQTT event connection error: {}. Reconnecting in {:?}",
                    e,
                    RECONNECT_DELAY
                );
                std::thread::sleep(RECONNECT_DELAY);
            }
        }
    }
}

/// Queue a QoS 1 publish without blocking; fails when the request queue is full.
pub fn publish_qos1(client: &Client, message: &OutboundMessage) -> Result<()> {
    client
        .try_publish(
            message.topic.as_str(),
            QoS::AtLeastOnce,
            message.retain,
            message.payload.clone(),
        )
        .map_err(|e| anyhow!("publish to {} failed: {}", message.topic, e))
}

/// [`EventSink`] writing interaction events (and discovery messages) to MQTT.
pub struct MqttEventSink {
    client: Client,
    prefix: String,
    events_segment: String,
    discovery: DiscoveryPublisher,
}

impl MqttEventSink {
    pub fn new(
        client: Client,
        prefix: &str,
        events_segment: &str,
        discovery: DiscoveryPublisher,
    ) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            events_segment: events_segment.to_string(),
            discovery,
        }
    }
}

impl EventSink for MqttEventSink {
    /// Fails only when the event message itself was not queued.
    ///
    /// Discovery messages are best effort: a failure is logged and the
    /// config is sent again with the next event for that entity.
    fn publish(&mut self, event: &InteractionEvent) -> Result<()> {
        publish_qos1(
            &self.client,
            &event.to_message(&self.prefix, &self.events_segment)?,
        )?;
        let client = &self.client;
        if let Err(e) = self
            .discovery
            .publish_with(event, |message| publish_qos1(client, message))
        {
            log::warn!("HA discovery for {} not published: {}", event.key(), e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::{InteractionKey, LabelPair};
    use crate::publish::discovery::DiscoverySettings;
    use crate::publish::EventState;

    fn event() -> InteractionEvent {
        let key = InteractionKey::new("yard", "pets", &LabelPair::new("cat", "dog"));
        InteractionEvent::new(&key, EventState::On, 12.0)
    }

    #[test]
    fn discovery_failure_does_not_fail_the_event() {
        // Room for exactly one request and no event loop draining it.
        let options = MqttOptions::new("sink-test", "127.0.0.1", 1883);
        let (client, _connection) = Client::new(options, 1);
        let discovery = DiscoveryPublisher::new(DiscoverySettings {
            enabled: true,
            ..DiscoverySettings::default()
        });
        let mut sink = MqttEventSink::new(client, "myhome/ObjectTrackers", "events", discovery);

        sink.publish(&event()).expect("event queued");

        // The config never left, so it is still due on the next event.
        let pending = sink.discovery.messages_for(&event()).expect("messages");
        assert_eq!(pending.len(), 2);
        assert!(pending[0].topic.ends_with("Tracker-yard-pets-cat-dog/config"));
    }
}
