//! Frigate NVR event adapter.
//!
//! Frigate publishes `{ "before": {...}, "after": {...}, "type": "new"|"update"|"end" }`
//! on its events topic. Each tracked object maps to one entry of the camera's
//! object map: new/update upsert it, end (or a false positive) removes it.

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::detect::{CameraInput, Detection, ObjectUpdate};
use crate::geometry::BoundingBox;

pub const DEFAULT_FRIGATE_TOPIC: &str = "frigate/events";

#[derive(Debug, Deserialize)]
pub struct FrigateEventWrapper {
    /// Current state of the tracked object.
    pub after: Option<FrigateEventData>,

    /// "new", "update" or "end"
    #[serde(rename = "type")]
    pub event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FrigateEventData {
    /// Tracked object id, stable for the object's lifetime.
    pub id: String,
    pub camera: String,
    pub label: String,
    #[serde(default)]
    pub score: f64,
    /// Top score seen for this object (preferred when present).
    pub top_score: Option<f64>,
    /// `[x1, y1, x2, y2]` in pixels.
    #[serde(rename = "box")]
    pub bbox: Option<[f32; 4]>,
    #[serde(default)]
    pub false_positive: bool,
}

/// Convert one Frigate event payload into an object update.
pub fn parse_frigate_event(payload: &[u8]) -> Result<CameraInput> {
    let wrapper: FrigateEventWrapper =
        serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;
    let event = wrapper
        .after
        .ok_or_else(|| anyhow!("missing 'after' section in event"))?;

    let ended = match wrapper.event_type.as_deref() {
        Some("new") | Some("update") | None => false,
        Some("end") => true,
        Some(other) => return Err(anyhow!("unknown Frigate event type '{}'", other)),
    };

    let detection = if ended || event.false_positive {
        None
    } else {
        let [x1, y1, x2, y2] = event
            .bbox
            .ok_or_else(|| anyhow!("Frigate event {} has no box", event.id))?;
        let confidence = event.top_score.unwrap_or(event.score) as f32;
        Some(
            Detection::new(event.label, BoundingBox::from_corners(x1, y1, x2, y2))
                .with_confidence(confidence),
        )
    };

    Ok(CameraInput::Object(ObjectUpdate {
        camera: event.camera,
        object_id: event.id,
        detection,
        expires: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_upserts_object() {
        let payload = br#"{
            "type": "new",
            "after": {"id": "1700000000.1-abc", "camera": "porch", "label": "cat",
                      "score": 0.7, "top_score": 0.82, "box": [10, 20, 110, 70],
                      "false_positive": false}
        }"#;
        let CameraInput::Object(update) = parse_frigate_event(payload).expect("parse") else {
            panic!("expected object update");
        };
        assert_eq!(update.camera, "porch");
        assert_eq!(update.object_id, "1700000000.1-abc");
        let detection = update.detection.expect("detection");
        assert_eq!(detection.bbox, BoundingBox::new(10.0, 20.0, 100.0, 50.0));
        assert!((detection.confidence.unwrap_or(0.0) - 0.82).abs() < 1e-6);
    }

    #[test]
    fn end_and_false_positive_remove_object() {
        let end = br#"{"type": "end", "after": {"id": "a", "camera": "porch", "label": "cat",
                       "box": [0, 0, 1, 1]}}"#;
        let fp = br#"{"type": "update", "after": {"id": "b", "camera": "porch", "label": "cat",
                      "box": [0, 0, 1, 1], "false_positive": true}}"#;
        for payload in [&end[..], &fp[..]] {
            match parse_frigate_event(payload).expect("parse") {
                CameraInput::Object(update) => assert!(update.detection.is_none()),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn rejects_incomplete_events() {
        assert!(parse_frigate_event(b"not json").is_err());
        assert!(parse_frigate_event(br#"{"type": "new"}"#).is_err());
        let no_box = br#"{"type": "new", "after": {"id": "c", "camera": "porch", "label": "cat"}}"#;
        assert!(parse_frigate_event(no_box).is_err());
    }
}
