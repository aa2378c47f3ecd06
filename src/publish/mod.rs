//! Outbound interaction events.
//!
//! Camera workers enqueue events through cloned [`EventQueue`] handles. A
//! single publisher thread drains the queue and hands each event to an
//! [`EventSink`], retrying failures with backoff. Delivery is at-most-once:
//! an event that still fails after the last attempt is dropped.

pub mod discovery;

pub use discovery::{DiscoveryPublisher, DiscoverySettings};

use anyhow::{anyhow, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::interaction::{InteractionKey, KeyTransition, Transition};

pub const DEFAULT_EVENTS_SEGMENT: &str = "events";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    On,
    Off,
}

impl EventState {
    /// Binary sensor payload used by Home Assistant.
    pub fn as_sensor_payload(&self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

/// One published state change of an interaction key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub camera: String,
    pub interaction: String,
    #[serde(rename = "slot_a_label")]
    pub label_a: String,
    #[serde(rename = "slot_b_label")]
    pub label_b: String,
    pub state: EventState,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl InteractionEvent {
    /// Map a state-table transition to an event; internal transitions yield None.
    pub fn from_transition(transition: &KeyTransition) -> Option<Self> {
        let state = match transition.transition {
            Transition::Confirmed => EventState::On,
            Transition::Ended => EventState::Off,
            Transition::Started | Transition::Discarded => return None,
        };
        Some(Self::new(&transition.key, state, transition.at))
    }

    pub fn new(key: &InteractionKey, state: EventState, timestamp: f64) -> Self {
        Self {
            camera: key.camera.clone(),
            interaction: key.interaction.clone(),
            label_a: key.label_a.clone(),
            label_b: key.label_b.clone(),
            state,
            timestamp,
        }
    }

    pub fn key(&self) -> InteractionKey {
        InteractionKey {
            camera: self.camera.clone(),
            interaction: self.interaction.clone(),
            label_a: self.label_a.clone(),
            label_b: self.label_b.clone(),
        }
    }

    /// `<prefix>/<events>/<camera>/<interaction>/<label_a>/<label_b>`
    pub fn topic(&self, prefix: &str, events_segment: &str) -> String {
        let prefix = prefix.trim_end_matches('/');
        let mut topic = String::new();
        if !prefix.is_empty() {
            topic.push_str(prefix);
            topic.push('/');
        }
        topic.push_str(&format!(
            "{}/{}/{}/{}/{}",
            events_segment, self.camera, self.interaction, self.label_a, self.label_b
        ));
        topic
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow!("encode interaction event: {}", e))
    }

    /// Retained event message, so late subscribers see the current state.
    pub fn to_message(&self, prefix: &str, events_segment: &str) -> Result<OutboundMessage> {
        Ok(OutboundMessage {
            topic: self.topic(prefix, events_segment),
            payload: self.payload()?,
            retain: true,
        })
    }
}

/// A fully addressed message ready for the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Destination for published events (an MQTT client, a test recorder, ...).
pub trait EventSink: Send {
    fn publish(&mut self, event: &InteractionEvent) -> Result<()>;
}

/// Retry policy for the publisher thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl PublishPolicy {
    /// Exponential backoff before retry number `attempt` (1-based), plus up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Cloneable producer side of the outbound queue.
#[derive(Clone, Debug)]
pub struct EventQueue {
    tx: Sender<InteractionEvent>,
}

impl EventQueue {
    /// Enqueue without blocking. Fails only once the publisher has stopped.
    pub fn enqueue(&self, event: InteractionEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("event publisher is not running"))
    }
}

/// Handle to the publisher thread.
pub struct EventPublisher {
    queue: EventQueue,
    join: Option<JoinHandle<PublishStats>>,
}

/// Counters reported when the publisher stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub retried: u64,
    pub dropped: u64,
}

impl EventPublisher {
    pub fn spawn<S>(sink: S, policy: PublishPolicy) -> Result<Self>
    where
        S: EventSink + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name("event-publisher".to_string())
            .spawn(move || run_publisher(rx, sink, policy))?;
        Ok(Self {
            queue: EventQueue { tx },
            join: Some(join),
        })
    }

    pub fn queue(&self) -> EventQueue {
        self.queue.clone()
    }

    /// Wait for every queued event to be handled.
    ///
    /// The thread exits once this handle and every cloned [`EventQueue`] are dropped.
    pub fn shutdown(self) -> Result<PublishStats> {
        let Self { queue, join } = self;
        drop(queue);
        match join {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("event publisher thread panicked")),
            None => Ok(PublishStats::default()),
        }
    }
}

fn run_publisher<S: EventSink>(
    rx: Receiver<InteractionEvent>,
    mut sink: S,
    policy: PublishPolicy,
) -> PublishStats {
    let mut stats = PublishStats::default();
    for event in rx.iter() {
        let mut attempt = 1;
        loop {
            match sink.publish(&event) {
                Ok(()) => {
                    stats.published += 1;
                    log::info!(
                        "published {} {} at {:.3}",
                        event.key(),
                        event.state,
                        event.timestamp
                    );
                    break;
                }
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    log::warn!(
                        "publish of {} {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        event.key(),
                        event.state,
                        attempt,
                        policy.max_attempts,
                        e,
                        delay
                    );
                    stats.retried += 1;
                    attempt += 1;
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    stats.dropped += 1;
                    log::error!(
                        "dropping {} {} after {} attempts: {}",
                        event.key(),
                        event.state,
                        attempt,
                        e
                    );
                    break;
                }
            }
        }
    }
    log::debug!(
        "event publisher stopped (published={}, retried={}, dropped={})",
        stats.published,
        stats.retried,
        stats.dropped
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::LabelPair;

    fn event(state: EventState) -> InteractionEvent {
        let key = InteractionKey::new(
            "living_room",
            "cat_on_couch",
            &LabelPair::new("cat", "couch"),
        );
        InteractionEvent::new(&key, state, 1_700_000_006.0)
    }

    #[test]
    fn topic_has_prefix_events_camera_interaction_labels() {
        assert_eq!(
            event(EventState::On).topic("myhome/ObjectTrackers/", "events"),
            "myhome/ObjectTrackers/events/living_room/cat_on_couch/cat/couch"
        );
        assert_eq!(
            event(EventState::On).topic("", "events"),
            "events/living_room/cat_on_couch/cat/couch"
        );
    }

    #[test]
    fn payload_uses_slot_field_names() {
        let payload = event(EventState::Off).payload().expect("payload");
        let value: serde_json::Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(value["camera"], "living_room");
        assert_eq!(value["interaction"], "cat_on_couch");
        assert_eq!(value["slot_a_label"], "cat");
        assert_eq!(value["slot_b_label"], "couch");
        assert_eq!(value["state"], "off");
        assert_eq!(value["timestamp"], 1_700_000_006.0);
    }

    #[test]
    fn only_confirm_and_end_become_events() {
        let key = InteractionKey::new("yard", "pets", &LabelPair::new("cat", "dog"));
        let make = |transition| KeyTransition {
            key: key.clone(),
            transition,
            at: 1.0,
        };
        assert!(InteractionEvent::from_transition(&make(Transition::Started)).is_none());
        assert!(InteractionEvent::from_transition(&make(Transition::Discarded)).is_none());
        assert_eq!(
            InteractionEvent::from_transition(&make(Transition::Confirmed)).map(|e| e.state),
            Some(EventState::On)
        );
        assert_eq!(
            InteractionEvent::from_transition(&make(Transition::Ended)).map(|e| e.state),
            Some(EventState::Off)
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = PublishPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let second = policy.backoff(2);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(250));
        let capped = policy.backoff(10);
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(375));
    }

    #[test]
    fn sensor_payloads_are_uppercase() {
        assert_eq!(EventState::On.as_sensor_payload(), "ON");
        assert_eq!(EventState::Off.as_sensor_payload(), "OFF");
    }
}
