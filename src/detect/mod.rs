//! Detection input model and ingest-side filtering.

mod result;

pub use result::{CameraInput, Detection, DetectionBatch, ObjectUpdate};

use std::collections::BTreeSet;

/// Normalise a label for matching: trimmed and lowercase.
pub fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Why a single detection was dropped.
#[derive(Clone, Debug, PartialEq)]
pub enum Rejection {
    EmptyLabel,
    UnknownLabel(String),
    InvalidBox,
    InvalidConfidence(f32),
    LowConfidence(f32),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyLabel => write!(f, "empty label"),
            Self::UnknownLabel(label) => write!(f, "unknown label '{}'", label),
            Self::InvalidBox => write!(f, "invalid bounding box"),
            Self::InvalidConfidence(c) => write!(f, "confidence {} outside 0..1", c),
            Self::LowConfidence(c) => write!(f, "confidence {} below camera minimum", c),
        }
    }
}

/// Per-camera admission rules for detections.
///
/// An empty vocabulary admits every label.
#[derive(Clone, Debug, Default)]
pub struct DetectionFilter {
    vocabulary: BTreeSet<String>,
    min_confidence: f32,
}

impl DetectionFilter {
    pub fn new(vocabulary: impl IntoIterator<Item = String>, min_confidence: f32) -> Self {
        Self {
            vocabulary: vocabulary
                .into_iter()
                .map(|label| normalize_label(&label))
                .collect(),
            min_confidence,
        }
    }

    /// Validate one detection, normalising its label in place.
    pub fn admit(&self, mut detection: Detection) -> Result<Detection, Rejection> {
        detection.label = normalize_label(&detection.label);
        if detection.label.is_empty() {
            return Err(Rejection::EmptyLabel);
        }
        if !self.vocabulary.is_empty() && !self.vocabulary.contains(&detection.label) {
            return Err(Rejection::UnknownLabel(detection.label));
        }
        if !detection.bbox.is_valid() {
            return Err(Rejection::InvalidBox);
        }
        if let Some(conf) = detection.confidence {
            if !(0.0..=1.0).contains(&conf) {
                return Err(Rejection::InvalidConfidence(conf));
            }
            if conf < self.min_confidence {
                return Err(Rejection::LowConfidence(conf));
            }
        }
        Ok(detection)
    }

    /// Keep admissible detections, logging the rest.
    ///
    /// Rejections only remove the offending instance; the batch survives.
    pub fn admit_all(&self, camera: &str, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter_map(|detection| match self.admit(detection) {
                Ok(d) => Some(d),
                Err(Rejection::LowConfidence(c)) => {
                    log::debug!("{}: skipping low confidence detection ({:.2})", camera, c);
                    None
                }
                Err(reason) => {
                    log::warn!("{}: dropping detection: {}", camera, reason);
                    None
                }
            })
            .collect()
    }
}
