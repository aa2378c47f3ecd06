//! Decoding of detection messages from the bus.
//!
//! Two layouts share one subscription:
//! - `<prefix>/<detections>/<camera>`: a whole frame as a batch.
//! - `<prefix>/<detections>/<camera>/<object_id>`: one tracked object; an
//!   empty payload means the object is gone.

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::detect::{CameraInput, Detection, DetectionBatch, ObjectUpdate};

pub const DEFAULT_DETECTIONS_SEGMENT: &str = "detections";

#[derive(Deserialize)]
struct BatchPayload {
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    detections: Vec<serde_json::Value>,
}

/// Topic layout of the detection feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectionTopics {
    base: String,
}

impl DetectionTopics {
    pub fn new(prefix: &str, detections_segment: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let base = if prefix.is_empty() {
            detections_segment.to_string()
        } else {
            format!("{}/{}", prefix, detections_segment)
        };
        Self { base }
    }

    /// Wildcard subscription covering both layouts.
    pub fn subscription(&self) -> String {
        format!("{}/#", self.base)
    }

    pub fn matches(&self, topic: &str) -> bool {
        topic
            .strip_prefix(&self.base)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }

    /// Decode one message.
    ///
    /// Individual malformed detections inside a batch are skipped with a
    /// warning; only an unusable topic or batch envelope is an error.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<CameraInput> {
        let rest = topic
            .strip_prefix(&self.base)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| anyhow!("topic {} is not under {}", topic, self.base))?;
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [camera] if !camera.is_empty() => decode_batch(camera, payload),
            [camera, object_id] if !camera.is_empty() && !object_id.is_empty() => {
                decode_object(camera, object_id, payload)
            }
            _ => Err(anyhow!("unexpected detection topic {}", topic)),
        }
    }
}

fn decode_batch(camera: &str, payload: &[u8]) -> Result<CameraInput> {
    let raw: BatchPayload = serde_json::from_slice(payload)
        .map_err(|e| anyhow!("{}: invalid detection batch: {}", camera, e))?;
    let mut detections = Vec::with_capacity(raw.detections.len());
    for value in raw.detections {
        match serde_json::from_value::<Detection>(value) {
            Ok(detection) => detections.push(detection),
            Err(e) => log::warn!("{}: skipping unparseable detection: {}", camera, e),
        }
    }
    Ok(CameraInput::Batch(DetectionBatch {
        camera: camera.to_string(),
        timestamp: raw.timestamp.filter(|ts| ts.is_finite()),
        detections,
    }))
}

fn decode_object(camera: &str, object_id: &str, payload: &[u8]) -> Result<CameraInput> {
    let detection = if payload.iter().all(|b| b.is_ascii_whitespace()) {
        None
    } else {
        Some(
            serde_json::from_slice::<Detection>(payload)
                .map_err(|e| anyhow!("{}: invalid object {}: {}", camera, object_id, e))?,
        )
    };
    Ok(CameraInput::Object(ObjectUpdate {
        camera: camera.to_string(),
        object_id: object_id.to_string(),
        detection,
        expires: true,
    }))
}
