use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::detect::normalize_label;
use crate::interaction::{
    validate_label, validate_name, InteractionDefinition, DEFAULT_EXPIRE_TIME_S,
    DEFAULT_MIN_TIME_S, DEFAULT_THRESHOLD,
};
use crate::publish::discovery::{
    DEFAULT_DEVICE_NAME, DEFAULT_DISCOVERY_PREFIX, DEFAULT_ENTITY_PREFIX,
};
use crate::publish::{DiscoverySettings, PublishPolicy, DEFAULT_EVENTS_SEGMENT};
use crate::tracker::CameraSettings;
use crate::transport::{
    parse_mqtt_endpoint, validate_loopback_addr, DetectionTopics, MqttSettings, TlsMaterials,
    DEFAULT_DETECTIONS_SEGMENT, DEFAULT_FRIGATE_TOPIC,
};

pub const CONFIG_ENV: &str = "INTERACTION_CONFIG";

const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_TOPIC_PREFIX: &str = "myhome/ObjectTrackers";
const DEFAULT_CLIENT_ID: &str = "interactiond";
const AVAILABILITY_SEGMENT: &str = "status";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct InteractionConfigFile {
    labels: Option<Vec<String>>,
    accept_unknown_cameras: Option<bool>,
    mqtt: Option<MqttConfigFile>,
    home_assistant: Option<HomeAssistantConfigFile>,
    frigate: Option<FrigateConfigFile>,
    publish: Option<PublishConfigFile>,
    interactions: Option<BTreeMap<String, InteractionEntryFile>>,
    cameras: Option<BTreeMap<String, CameraEntryFile>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    prefix: Option<String>,
    events: Option<String>,
    detections: Option<String>,
    client_id: Option<String>,
    allow_remote: Option<bool>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct HomeAssistantConfigFile {
    discovery_enabled: Option<bool>,
    discovery_prefix: Option<String>,
    entity_prefix: Option<String>,
    device_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FrigateConfigFile {
    enabled: Option<bool>,
    topic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PublishConfigFile {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InteractionEntryFile {
    slots: Vec<Vec<String>>,
    threshold: Option<f32>,
    min_time: Option<f64>,
    expire_time: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraEntryFile {
    refresh: Option<f64>,
    interactions: Option<Vec<String>>,
    min_confidence: Option<f32>,
    max_no_frame_sec: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct InteractionConfig {
    /// Label vocabulary; empty accepts every label.
    pub labels: Vec<String>,
    pub accept_unknown_cameras: bool,
    pub mqtt: MqttConfig,
    pub home_assistant: HomeAssistantConfig,
    pub frigate: FrigateConfig,
    pub publish: PublishPolicy,
    /// Sorted by name.
    pub interactions: Vec<Arc<InteractionDefinition>>,
    pub cameras: Vec<CameraSettings>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_addr: String,
    pub prefix: String,
    pub events: String,
    pub detections: String,
    pub client_id: String,
    pub allow_remote: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HomeAssistantConfig {
    pub discovery_enabled: bool,
    pub discovery_prefix: String,
    pub entity_prefix: String,
    pub device_name: String,
}

#[derive(Debug, Clone)]
pub struct FrigateConfig {
    pub enabled: bool,
    pub topic: String,
}

impl InteractionConfig {
    /// Load from the file named by `INTERACTION_CONFIG`, or defaults when unset.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => InteractionConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: InteractionConfigFile) -> Result<Self> {
        let labels: Vec<String> = file
            .labels
            .unwrap_or_default()
            .iter()
            .map(|label| normalize_label(label))
            .collect();

        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttConfig {
            broker_addr: mqtt_file
                .broker_addr
                .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
            prefix: mqtt_file
                .prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            events: mqtt_file
                .events
                .unwrap_or_else(|| DEFAULT_EVENTS_SEGMENT.to_string()),
            detections: mqtt_file
                .detections
                .unwrap_or_else(|| DEFAULT_DETECTIONS_SEGMENT.to_string()),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            allow_remote: mqtt_file.allow_remote.unwrap_or(false),
            username: mqtt_file.username,
            password: mqtt_file.password,
            use_tls: mqtt_file.use_tls.unwrap_or(false),
            tls_ca_path: mqtt_file.tls_ca_path,
            tls_client_cert_path: mqtt_file.tls_client_cert_path,
            tls_client_key_path: mqtt_file.tls_client_key_path,
        };

        let ha_file = file.home_assistant.unwrap_or_default();
        let home_assistant = HomeAssistantConfig {
            discovery_enabled: ha_file.discovery_enabled.unwrap_or(false),
            discovery_prefix: ha_file
                .discovery_prefix
                .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string()),
            entity_prefix: ha_file
                .entity_prefix
                .unwrap_or_else(|| DEFAULT_ENTITY_PREFIX.to_string()),
            device_name: ha_file
                .device_name
                .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string()),
        };

        let frigate_file = file.frigate.unwrap_or_default();
        let frigate = FrigateConfig {
            enabled: frigate_file.enabled.unwrap_or(false),
            topic: frigate_file
                .topic
                .unwrap_or_else(|| DEFAULT_FRIGATE_TOPIC.to_string()),
        };

        let defaults = PublishPolicy::default();
        let publish = match file.publish {
            Some(p) => PublishPolicy {
                max_attempts: p.max_attempts.unwrap_or(defaults.max_attempts),
                initial_backoff: p
                    .initial_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.initial_backoff),
                max_backoff: p
                    .max_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_backoff),
            },
            None => defaults,
        };

        let mut interactions = Vec::new();
        for (name, entry) in file.interactions.unwrap_or_default() {
            let [slot_a, slot_b]: [Vec<String>; 2] =
                entry.slots.try_into().map_err(|slots: Vec<Vec<String>>| {
                    anyhow!(
                        "interaction '{}': expected exactly 2 slots, found {}",
                        name,
                        slots.len()
                    )
                })?;
            let definition = InteractionDefinition::new(
                &name,
                slot_a,
                slot_b,
                entry.threshold.unwrap_or(DEFAULT_THRESHOLD),
                entry.min_time.unwrap_or(DEFAULT_MIN_TIME_S),
                entry.expire_time.unwrap_or(DEFAULT_EXPIRE_TIME_S),
            )?;
            interactions.push(Arc::new(definition));
        }

        let mut cameras = Vec::new();
        for (name, entry) in file.cameras.unwrap_or_default() {
            let selected = match entry.interactions {
                Some(names) => names
                    .iter()
                    .map(|wanted| {
                        interactions
                            .iter()
                            .find(|def| &def.name == wanted)
                            .cloned()
                            .ok_or_else(|| {
                                anyhow!(
                                    "camera '{}' references unknown interaction '{}'",
                                    name,
                                    wanted
                                )
                            })
                    })
                    .collect::<Result<Vec<_>>>()?,
                None => interactions.clone(),
            };
            let mut settings = CameraSettings::new(&name, selected);
            settings.vocabulary = labels.clone();
            if let Some(refresh) = entry.refresh {
                settings.refresh = positive_duration(&name, "refresh", refresh)?;
            }
            if let Some(min_confidence) = entry.min_confidence {
                settings.min_confidence = min_confidence;
            }
            if let Some(max_no_frame) = entry.max_no_frame_sec {
                settings.max_no_frame = positive_duration(&name, "max_no_frame_sec", max_no_frame)?;
            }
            cameras.push(settings);
        }

        Ok(Self {
            labels,
            accept_unknown_cameras: file.accept_unknown_cameras.unwrap_or(true),
            mqtt,
            home_assistant,
            frigate,
            publish,
            interactions,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("MQTT_BROKER_ADDR") {
            self.mqtt.broker_addr = addr;
        }
        if let Some(prefix) = env_value("MQTT_TOPIC_PREFIX") {
            self.mqtt.prefix = prefix;
        }
        if let Some(username) = env_value("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(client_id) = env_value("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Some(prefix) = env_value("HA_DISCOVERY_PREFIX") {
            self.home_assistant.discovery_prefix = prefix;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        for label in &self.labels {
            validate_label(label)?;
        }
        if self.interactions.is_empty() {
            return Err(anyhow!("no interactions configured"));
        }
        if !self.labels.is_empty() {
            for definition in &self.interactions {
                if let Some(label) = definition
                    .labels()
                    .find(|label| !self.labels.contains(label))
                {
                    return Err(anyhow!(
                        "interaction '{}' uses label '{}' missing from labels",
                        definition.name,
                        label
                    ));
                }
            }
        }
        for camera in &self.cameras {
            validate_name("camera", &camera.name)?;
            if !(0.0..=1.0).contains(&camera.min_confidence) {
                return Err(anyhow!(
                    "camera '{}': min_confidence {} must be in [0, 1]",
                    camera.name,
                    camera.min_confidence
                ));
            }
            if camera.interactions.is_empty() {
                log::warn!("camera '{}' has no interactions", camera.name);
            }
        }

        for (what, value) in [
            ("mqtt.events", &self.mqtt.events),
            ("mqtt.detections", &self.mqtt.detections),
            ("mqtt.client_id", &self.mqtt.client_id),
        ] {
            validate_name(what, value)?;
        }
        for (what, value) in [
            ("mqtt.prefix", &self.mqtt.prefix),
            ("home_assistant.discovery_prefix", &self.home_assistant.discovery_prefix),
            ("frigate.topic", &self.frigate.topic),
        ] {
            if value.contains('+') || value.contains('#') {
                return Err(anyhow!("{} '{}' must not contain MQTT wildcards", what, value));
            }
        }
        if self.home_assistant.discovery_enabled {
            validate_name("home_assistant.entity_prefix", &self.home_assistant.entity_prefix)?;
        }

        let endpoint = parse_mqtt_endpoint(&self.mqtt.broker_addr, self.mqtt.use_tls)?;
        if !self.mqtt.allow_remote {
            validate_loopback_addr(&endpoint, &self.mqtt.broker_addr)?;
        }
        let has_materials = self.mqtt.tls_ca_path.is_some()
            || self.mqtt.tls_client_cert_path.is_some()
            || self.mqtt.tls_client_key_path.is_some();
        if has_materials && !endpoint.use_tls {
            return Err(anyhow!(
                "MQTT TLS paths configured but TLS is disabled (set mqtt.use_tls or use mqtts://)"
            ));
        }
        if self.mqtt.tls_client_cert_path.is_some() != self.mqtt.tls_client_key_path.is_some() {
            return Err(anyhow!(
                "mqtt.tls_client_cert_path and mqtt.tls_client_key_path must be set together"
            ));
        }
        if self.mqtt.tls_client_cert_path.is_some() && self.mqtt.tls_ca_path.is_none() {
            return Err(anyhow!(
                "mqtt.tls_ca_path is required when providing client certificates"
            ));
        }

        if self.publish.max_attempts == 0 {
            return Err(anyhow!("publish.max_attempts must be at least 1"));
        }
        if self.publish.max_backoff < self.publish.initial_backoff {
            return Err(anyhow!(
                "publish.max_backoff_ms must not be below publish.initial_backoff_ms"
            ));
        }
        Ok(())
    }

    /// Resolve broker endpoint, credentials and TLS files.
    pub fn mqtt_settings(&self) -> Result<MqttSettings> {
        let endpoint = parse_mqtt_endpoint(&self.mqtt.broker_addr, self.mqtt.use_tls)?;
        let tls = TlsMaterials::load(
            self.mqtt.tls_ca_path.as_deref(),
            self.mqtt.tls_client_cert_path.as_deref(),
            self.mqtt.tls_client_key_path.as_deref(),
        )?;
        Ok(MqttSettings {
            endpoint,
            tls,
            client_id: self.mqtt.client_id.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
        })
    }

    /// `<prefix>/status`
    pub fn availability_topic(&self) -> String {
        let prefix = self.mqtt.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            AVAILABILITY_SEGMENT.to_string()
        } else {
            format!("{}/{}", prefix, AVAILABILITY_SEGMENT)
        }
    }

    pub fn detection_topics(&self) -> DetectionTopics {
        DetectionTopics::new(&self.mqtt.prefix, &self.mqtt.detections)
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            enabled: self.home_assistant.discovery_enabled,
            discovery_prefix: self.home_assistant.discovery_prefix.clone(),
            entity_prefix: self.home_assistant.entity_prefix.clone(),
            device_name: self.home_assistant.device_name.clone(),
            availability_topic: self.availability_topic(),
        }
    }

    /// Template for cameras seen on the bus but absent from the file.
    pub fn fallback_camera(&self) -> Option<CameraSettings> {
        if !self.accept_unknown_cameras {
            return None;
        }
        let mut settings = CameraSettings::new("unknown", self.interactions.clone());
        settings.vocabulary = self.labels.clone();
        Some(settings)
    }
}

fn positive_duration(camera: &str, field: &str, seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(anyhow!(
            "camera '{}': {} {} must be a positive number of seconds",
            camera,
            field,
            seconds
        ));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| anyhow!("camera '{}': {} {}: {}", camera, field, seconds, e))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<InteractionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with_interaction() -> InteractionConfigFile {
        let mut interactions = BTreeMap::new();
        interactions.insert(
            "cat_on_couch".to_string(),
            InteractionEntryFile {
                slots: vec![vec!["cat".to_string()], vec!["couch".to_string()]],
                threshold: None,
                min_time: None,
                expire_time: None,
            },
        );
        InteractionConfigFile {
            interactions: Some(interactions),
            ..InteractionConfigFile::default()
        }
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let mut cfg = InteractionConfig::from_file(file_with_interaction()).expect("config");
        cfg.validate().expect("valid");
        assert_eq!(cfg.mqtt.broker_addr, "127.0.0.1:1883");
        assert_eq!(cfg.mqtt.prefix, "myhome/ObjectTrackers");
        assert_eq!(cfg.availability_topic(), "myhome/ObjectTrackers/status");
        assert!(cfg.accept_unknown_cameras);
        assert!(cfg.fallback_camera().is_some());
        let def = &cfg.interactions[0];
        assert_eq!(def.threshold, 0.5);
        assert_eq!(def.timing.min_time, 3.0);
        assert_eq!(def.timing.expire_time, 5.0);
    }

    #[test]
    fn three_slots_are_rejected() {
        let mut file = file_with_interaction();
        if let Some(entry) = file
            .interactions
            .as_mut()
            .and_then(|map| map.get_mut("cat_on_couch"))
        {
            entry.slots.push(vec!["dog".to_string()]);
        }
        let err = InteractionConfig::from_file(file).unwrap_err();
        assert!(err.to_string().contains("exactly 2 slots"));
    }

    #[test]
    fn unknown_interaction_reference_is_rejected() {
        let mut file = file_with_interaction();
        let mut cameras = BTreeMap::new();
        cameras.insert(
            "porch".to_string(),
            CameraEntryFile {
                interactions: Some(vec!["dog_on_bed".to_string()]),
                ..CameraEntryFile::default()
            },
        );
        file.cameras = Some(cameras);
        let err = InteractionConfig::from_file(file).unwrap_err();
        assert!(err.to_string().contains("unknown interaction 'dog_on_bed'"));
    }

    #[test]
    fn remote_broker_needs_opt_in() {
        let mut cfg = InteractionConfig::from_file(file_with_interaction()).expect("config");
        cfg.mqtt.broker_addr = "broker.lan:1883".to_string();
        assert!(cfg.validate().is_err());
        cfg.mqtt.allow_remote = true;
        assert!(cfg.validate().is_ok());
    }
}
