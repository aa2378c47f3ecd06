//! Interaction Tracker
//!
//! Turns per-frame object detections into debounced "interaction" events:
//! two labeled boxes (say a cat and a couch) overlapping for long enough on
//! the same camera.
//!
//! # Pipeline
//!
//! 1. `transport` decodes detection messages from MQTT (batch, per-object or
//!    Frigate events).
//! 2. `tracker` routes them to one worker thread per camera. Each worker
//!    owns that camera's state table and ticks on input and on a sweep timer.
//! 3. `interaction` resolves overlapping label pairs and runs the
//!    Idle/Pending/Active hysteresis per key.
//! 4. `publish` queues ON/OFF events to a single publisher thread that
//!    writes them (plus optional Home Assistant discovery) back to MQTT.
//!
//! # Module Structure
//!
//! - `geometry`: boxes and the overlap ratio
//! - `detect`: detection model and admission filter
//! - `interaction`: definitions, pair resolver, state machine and table
//! - `tracker`: camera shards, workers and the router
//! - `publish`: events, outbound queue, discovery
//! - `transport`: MQTT endpoint/TLS, decoding, sinks
//! - `config`: file + environment configuration

use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod geometry;
pub mod interaction;
pub mod publish;
pub mod tracker;
pub mod transport;

pub use config::InteractionConfig;
pub use detect::{CameraInput, Detection, DetectionBatch, DetectionFilter, ObjectUpdate};
pub use geometry::{overlap_ratio, BoundingBox};
pub use interaction::{
    resolve_pairs, InteractionDefinition, InteractionKey, InteractionState, InteractionTable,
    LabelPair, Phase, Timing, Transition,
};
pub use publish::{
    EventPublisher, EventQueue, EventSink, EventState, InteractionEvent, PublishPolicy,
    PublishStats,
};
pub use tracker::{CameraRouter, CameraSettings, CameraTracker, CameraWorker};

/// Wall clock in seconds since the Unix epoch.
pub fn now_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
