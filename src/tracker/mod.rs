//! Per-camera tracking shard.
//!
//! A [`CameraTracker`] owns every interaction state of one camera. It is
//! driven by two triggers that share [`CameraTracker::tick`]: detection
//! arrival and a periodic sweep with no new input. The sweep keeps
//! `expire_time` honored in wall-clock time when a feed goes quiet.

mod worker;

pub use worker::{CameraRouter, CameraWorker};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::detect::{CameraInput, Detection, DetectionFilter};
use crate::interaction::{resolve_pairs, InteractionDefinition, InteractionTable, Transition};
use crate::publish::{EventState, InteractionEvent};

pub const DEFAULT_REFRESH: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_NO_FRAME: Duration = Duration::from_secs(30);

/// Everything a camera shard needs, resolved from configuration.
#[derive(Clone, Debug)]
pub struct CameraSettings {
    pub name: String,
    /// Sweep cadence.
    pub refresh: Duration,
    pub interactions: Vec<Arc<InteractionDefinition>>,
    pub min_confidence: f32,
    /// Expiring object-map entries older than this are evicted.
    pub max_no_frame: Duration,
    /// Accepted labels; empty admits everything.
    pub vocabulary: Vec<String>,
}

impl CameraSettings {
    pub fn new(name: &str, interactions: Vec<Arc<InteractionDefinition>>) -> Self {
        Self {
            name: name.to_string(),
            refresh: DEFAULT_REFRESH,
            interactions,
            min_confidence: 0.0,
            max_no_frame: DEFAULT_MAX_NO_FRAME,
            vocabulary: Vec::new(),
        }
    }

    /// Same settings under another camera name.
    pub fn renamed(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug)]
struct TrackedObject {
    detection: Detection,
    updated_at: f64,
    expires: bool,
}

pub struct CameraTracker {
    camera: String,
    definitions: Vec<Arc<InteractionDefinition>>,
    filter: DetectionFilter,
    table: InteractionTable,
    objects: HashMap<String, TrackedObject>,
    object_ttl: f64,
    pending_batch: Option<Vec<Detection>>,
    last_batch_ts: Option<f64>,
    last_tick: Option<f64>,
    last_input: Option<f64>,
}

impl CameraTracker {
    pub fn new(settings: &CameraSettings) -> Self {
        Self {
            camera: settings.name.clone(),
            definitions: settings.interactions.clone(),
            filter: DetectionFilter::new(settings.vocabulary.clone(), settings.min_confidence),
            table: InteractionTable::new(),
            objects: HashMap::new(),
            object_ttl: settings.max_no_frame.as_secs_f64(),
            pending_batch: None,
            last_batch_ts: None,
            last_tick: None,
            last_input: None,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn table(&self) -> &InteractionTable {
        &self.table
    }

    pub fn tracked_objects(&self) -> usize {
        self.objects.len()
    }

    /// Accept input for the next tick.
    ///
    /// Returns false when the input was ignored: wrong camera, or a batch
    /// older than the newest batch already accepted.
    pub fn ingest(&mut self, input: CameraInput, now: f64) -> bool {
        if input.camera() != self.camera {
            log::warn!(
                "{}: ignoring input addressed to camera {}",
                self.camera,
                input.camera()
            );
            return false;
        }
        match input {
            CameraInput::Batch(batch) => {
                if let (Some(ts), Some(last)) = (batch.timestamp, self.last_batch_ts) {
                    if ts < last {
                        log::debug!(
                            "{}: dropping out-of-order batch ({:.3} < {:.3})",
                            self.camera,
                            ts,
                            last
                        );
                        return false;
                    }
                }
                if batch.timestamp.is_some() {
                    self.last_batch_ts = batch.timestamp;
                }
                let detections = self.filter.admit_all(&self.camera, batch.detections);
                self.pending_batch = Some(detections);
            }
            CameraInput::Object(update) => {
                let admitted = update
                    .detection
                    .map(|d| self.filter.admit(d))
                    .transpose()
                    .unwrap_or_else(|reason| {
                        log::warn!(
                            "{}: dropping object {}: {}",
                            self.camera,
                            update.object_id,
                            reason
                        );
                        None
                    });
                match admitted {
                    Some(detection) => {
                        if !self.objects.contains_key(&update.object_id) {
                            log::debug!(
                                "{}: added object {}. Tracking {} objects",
                                self.camera,
                                update.object_id,
                                self.objects.len() + 1
                            );
                        }
                        self.objects.insert(
                            update.object_id,
                            TrackedObject {
                                detection,
                                updated_at: now,
                                expires: update.expires,
                            },
                        );
                    }
                    None => {
                        if self.objects.remove(&update.object_id).is_some() {
                            log::debug!(
                                "{}: removed object {}. Tracking {} objects",
                                self.camera,
                                update.object_id,
                                self.objects.len()
                            );
                        }
                    }
                }
            }
        }
        self.last_input = Some(now);
        true
    }

    /// Ingest a batch and tick immediately.
    pub fn observe(&mut self, input: CameraInput, now: f64) -> Vec<InteractionEvent> {
        if self.ingest(input, now) {
            self.tick(now)
        } else {
            Vec::new()
        }
    }

    /// Run every interaction of this camera once at `now`.
    ///
    /// The detection set is the pending batch (consumed) plus the live object
    /// map. With neither, the tick only moves timers toward expiry.
    pub fn tick(&mut self, now: f64) -> Vec<InteractionEvent> {
        let now = match self.last_tick {
            Some(last) if now < last => {
                log::debug!(
                    "{}: clock went backwards ({:.3} < {:.3}), holding",
                    self.camera,
                    now,
                    last
                );
                last
            }
            _ => now,
        };
        self.last_tick = Some(now);
        self.evict_stale_objects(now);

        let mut detections = self.pending_batch.take().unwrap_or_default();
        detections.extend(self.objects.values().map(|o| o.detection.clone()));

        let mut events = Vec::new();
        for definition in &self.definitions {
            let overlapping = resolve_pairs(definition, &detections);
            for transition in self.table.step(&self.camera, definition, &overlapping, now) {
                match transition.transition {
                    Transition::Started => {
                        log::debug!("{}: pending", transition.key)
                    }
                    Transition::Discarded => {
                        log::debug!("{}: expired before confirming", transition.key)
                    }
                    Transition::Confirmed | Transition::Ended => {}
                }
                if let Some(event) = InteractionEvent::from_transition(&transition) {
                    events.push(event);
                }
            }
        }

        let ended = events.iter().filter(|e| e.state == EventState::Off).count();
        if ended > 0 && detections.is_empty() {
            let silent_for = self.last_input.map(|t| now - t).unwrap_or(0.0);
            log::info!(
                "{}: {} interaction(s) expired, no detections for {:.1}s",
                self.camera,
                ended,
                silent_for
            );
        }
        events
    }

    fn evict_stale_objects(&mut self, now: f64) {
        let ttl = self.object_ttl;
        let camera = &self.camera;
        self.objects.retain(|id, object| {
            let fresh = !object.expires || now - object.updated_at <= ttl;
            if !fresh {
                log::info!(
                    "{}: object {} not refreshed for {:.0}s, evicting",
                    camera,
                    id,
                    now - object.updated_at
                );
            }
            fresh
        });
    }
}
