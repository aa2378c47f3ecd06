//! Home Assistant MQTT discovery for interaction binary sensors.
//!
//! Each interaction key becomes one `binary_sensor` entity. Its config is
//! published (retained) the first time the key produces an event; state
//! updates follow as retained `ON`/`OFF` payloads.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;

use super::{InteractionEvent, OutboundMessage};
use crate::interaction::InteractionKey;

pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const DEFAULT_ENTITY_PREFIX: &str = "Tracker";
pub const DEFAULT_DEVICE_NAME: &str = "InteractionTracker";
pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub discovery_prefix: String,
    pub entity_prefix: String,
    pub device_name: String,
    pub availability_topic: String,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            discovery_prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
            entity_prefix: DEFAULT_ENTITY_PREFIX.to_string(),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            availability_topic: String::new(),
        }
    }
}

/// Home Assistant MQTT Discovery config for a binary sensor.
#[derive(Serialize)]
struct HaBinarySensorConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability_topic: Option<String>,
    payload_available: String,
    payload_not_available: String,
    device: HaDeviceInfo,
}

/// Home Assistant device info for entity grouping.
#[derive(Clone, Serialize)]
struct HaDeviceInfo {
    identifiers: Vec<String>,
    name: String,
    model: String,
    sw_version: String,
}

/// Turns interaction events into discovery config and state messages.
pub struct DiscoveryPublisher {
    settings: DiscoverySettings,
    configured: HashSet<String>,
}

impl DiscoveryPublisher {
    pub fn new(settings: DiscoverySettings) -> Self {
        Self {
            settings,
            configured: HashSet::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// `<entity_prefix>-<camera>-<interaction>-<label_a>-<label_b>`, with `-`,
    /// `_` and whitespace stripped from each part.
    pub fn entity_id(&self, key: &InteractionKey) -> String {
        let parts = [&key.camera, &key.interaction, &key.label_a, &key.label_b];
        let mut id = self.settings.entity_prefix.clone();
        for part in parts {
            id.push('-');
            id.extend(
                part.chars()
                    .filter(|c| *c != '-' && *c != '_' && !c.is_whitespace()),
            );
        }
        id
    }

    fn entity_topic(&self, entity_id: &str) -> String {
        format!(
            "{}/binary_sensor/{}",
            self.settings.discovery_prefix.trim_end_matches('/'),
            entity_id
        )
    }

    /// Messages to send for one event: the entity config until it has been
    /// delivered, then the retained state. Empty when discovery is disabled.
    pub fn messages_for(&self, event: &InteractionEvent) -> Result<Vec<OutboundMessage>> {
        if !self.settings.enabled {
            return Ok(Vec::new());
        }
        let key = event.key();
        let entity_id = self.entity_id(&key);
        let entity_topic = self.entity_topic(&entity_id);
        let state_topic = format!("{}/state", entity_topic);

        let mut messages = Vec::new();
        if !self.configured.contains(&entity_id) {
            let config = HaBinarySensorConfig {
                name: format!(
                    "{} - [{}|{}|{}] [{}]",
                    self.settings.entity_prefix,
                    key.interaction,
                    key.label_a,
                    key.label_b,
                    key.camera
                ),
                unique_id: entity_id.clone(),
                state_topic: state_topic.clone(),
                availability_topic: Some(self.settings.availability_topic.clone())
                    .filter(|topic| !topic.is_empty()),
                payload_available: PAYLOAD_ONLINE.to_string(),
                payload_not_available: PAYLOAD_OFFLINE.to_string(),
                device: HaDeviceInfo {
                    identifiers: vec![self.settings.device_name.clone()],
                    name: self.settings.device_name.clone(),
                    model: "interaction-tracker".to_string(),
                    sw_version: env!("CARGO_PKG_VERSION").to_string(),
                },
            };
            messages.push(OutboundMessage {
                topic: format!("{}/config", entity_topic),
                payload: serde_json::to_vec(&config)?,
                retain: true,
            });
            log::debug!("publishing HA discovery for {}", entity_id);
        }
        messages.push(OutboundMessage {
            topic: state_topic,
            payload: event.state.as_sensor_payload().as_bytes().to_vec(),
            retain: true,
        });
        Ok(messages)
    }

    /// Record that the config for `entity_id` reached the broker.
    pub fn mark_configured(&mut self, entity_id: &str) {
        self.configured.insert(entity_id.to_string());
    }

    /// Hand the discovery messages for `event` to `send`, in order.
    ///
    /// The entity only counts as configured once its config was sent, so a
    /// failed attempt resends the config next time.
    pub fn publish_with<F>(&mut self, event: &InteractionEvent, mut send: F) -> Result<()>
    where
        F: FnMut(&OutboundMessage) -> Result<()>,
    {
        let messages = self.messages_for(event)?;
        let entity_id = self.entity_id(&event.key());
        for message in &messages {
            send(message)?;
            if message.topic.ends_with("/config") {
                self.mark_configured(&entity_id);
            }
        }
        Ok(())
    }
}
