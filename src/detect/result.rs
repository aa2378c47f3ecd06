use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;

/// One labeled box observed in one frame.
///
/// Detections carry no identity across frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Object label from the detector vocabulary (lowercase after ingest).
    pub label: String,
    /// Box in the camera's coordinate space.
    #[serde(rename = "box", alias = "bbox")]
    pub bbox: BoundingBox,
    /// Detector confidence (0.0-1.0), when the producer reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            bbox,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// All detections for one camera from one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionBatch {
    pub camera: String,
    /// Producer timestamp (seconds since the Unix epoch). Used for ordering only.
    pub timestamp: Option<f64>,
    pub detections: Vec<Detection>,
}

/// Per-object update for feeds that publish one message per tracked object.
///
/// `detection: None` means the producer stopped tracking the object.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectUpdate {
    pub camera: String,
    pub object_id: String,
    pub detection: Option<Detection>,
    /// The producer re-sends the object while it stays visible, so silence
    /// means it is gone. False for feeds that only report changes (Frigate),
    /// whose objects live until an explicit removal.
    pub expires: bool,
}

/// Anything a camera worker can receive from the ingest side.
#[derive(Clone, Debug, PartialEq)]
pub enum CameraInput {
    Batch(DetectionBatch),
    Object(ObjectUpdate),
}

impl CameraInput {
    pub fn camera(&self) -> &str {
        match self {
            Self::Batch(batch) => &batch.camera,
            Self::Object(update) => &update.camera,
        }
    }
}
