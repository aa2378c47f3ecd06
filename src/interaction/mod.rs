//! Interaction definitions, pair resolution and the hysteresis state table.

pub mod resolver;
pub mod state;
pub mod table;

pub use resolver::resolve_pairs;
pub use state::{InteractionState, Phase, Timing, Transition};
pub use table::{InteractionTable, KeyTransition};

use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::detect::normalize_label;

pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MIN_TIME_S: f64 = 3.0;
pub const DEFAULT_EXPIRE_TIME_S: f64 = 5.0;

/// Names end up as MQTT topic segments and Home Assistant ids.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").unwrap());
    if !re.is_match(name) {
        return Err(anyhow!(
            "{} name '{}' must match ^[A-Za-z0-9_.-]{{1,64}}$",
            kind,
            name
        ));
    }
    Ok(())
}

/// Labels may contain spaces ("cell phone") but never MQTT topic operators.
pub fn validate_label(label: &str) -> Result<()> {
    static LABEL_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = LABEL_RE.get_or_init(|| regex::Regex::new(r"^[^/#+]{1,64}$").unwrap());
    if label.trim().is_empty() || !re.is_match(label) {
        return Err(anyhow!(
            "label '{}' must be 1-64 characters without '/', '+' or '#'",
            label
        ));
    }
    Ok(())
}

/// Named rule pairing two label slots with overlap and timing parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct InteractionDefinition {
    pub name: String,
    pub slot_a: BTreeSet<String>,
    pub slot_b: BTreeSet<String>,
    /// Minimum overlap ratio, in (0, 1].
    pub threshold: f32,
    pub timing: Timing,
}

impl InteractionDefinition {
    /// Build and validate a definition. Labels are normalised to lowercase.
    pub fn new<A, B>(
        name: &str,
        slot_a: A,
        slot_b: B,
        threshold: f32,
        min_time: f64,
        expire_time: f64,
    ) -> Result<Self>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
    {
        validate_name("interaction", name)?;
        let slot_a = build_slot(name, "A", slot_a)?;
        let slot_b = build_slot(name, "B", slot_b)?;
        if !threshold.is_finite() || threshold <= 0.0 || threshold > 1.0 {
            return Err(anyhow!(
                "interaction '{}': threshold {} must be in (0, 1]",
                name,
                threshold
            ));
        }
        let timing = Timing::new(min_time, expire_time)
            .map_err(|e| anyhow!("interaction '{}': {}", name, e))?;
        Ok(Self {
            name: name.to_string(),
            slot_a,
            slot_b,
            threshold,
            timing,
        })
    }

    /// Every label mentioned by either slot.
    pub fn labels(&self) -> impl Iterator<Item = &String> {
        self.slot_a.iter().chain(self.slot_b.iter())
    }
}

fn build_slot<I>(name: &str, which: &str, labels: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut slot = BTreeSet::new();
    for label in labels {
        let label = normalize_label(label.as_ref());
        validate_label(&label).map_err(|e| anyhow!("interaction '{}': {}", name, e))?;
        slot.insert(label);
    }
    if slot.is_empty() {
        return Err(anyhow!("interaction '{}': slot {} is empty", name, which));
    }
    Ok(slot)
}

/// Ordered pair of detected labels: first from slot A, second from slot B.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelPair {
    pub label_a: String,
    pub label_b: String,
}

impl LabelPair {
    pub fn new(label_a: impl Into<String>, label_b: impl Into<String>) -> Self {
        Self {
            label_a: label_a.into(),
            label_b: label_b.into(),
        }
    }
}

/// Identity of one hysteresis state machine.
///
/// Without tracking ids, simultaneous instances of the same label pair share a key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InteractionKey {
    pub camera: String,
    pub interaction: String,
    pub label_a: String,
    pub label_b: String,
}

impl InteractionKey {
    pub fn new(camera: &str, interaction: &str, pair: &LabelPair) -> Self {
        Self {
            camera: camera.to_string(),
            interaction: interaction.to_string(),
            label_a: pair.label_a.clone(),
            label_b: pair.label_b.clone(),
        }
    }

    pub fn pair(&self) -> LabelPair {
        LabelPair::new(self.label_a.clone(), self.label_b.clone())
    }
}

impl std::fmt::Display for InteractionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.camera, self.interaction, self.label_a, self.label_b
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_normalizes_labels() {
        let def = InteractionDefinition::new("pets", ["Cat", "dog "], ["Couch"], 0.3, 6.0, 4.0)
            .expect("definition");
        assert!(def.slot_a.contains("cat"));
        assert!(def.slot_a.contains("dog"));
        assert!(def.slot_b.contains("couch"));
    }

    #[test]
    fn definition_rejects_empty_slot() {
        let empty: [&str; 0] = [];
        let err = InteractionDefinition::new("pets", empty, ["couch"], 0.3, 6.0, 4.0).unwrap_err();
        assert!(err.to_string().contains("slot A is empty"));
    }

    #[test]
    fn definition_rejects_threshold_out_of_range() {
        assert!(InteractionDefinition::new("pets", ["cat"], ["couch"], 0.0, 1.0, 1.0).is_err());
        assert!(InteractionDefinition::new("pets", ["cat"], ["couch"], 1.5, 1.0, 1.0).is_err());
        assert!(InteractionDefinition::new("pets", ["cat"], ["couch"], 1.0, 1.0, 1.0).is_ok());
    }

    #[test]
    fn definition_rejects_negative_timing() {
        assert!(InteractionDefinition::new("pets", ["cat"], ["couch"], 0.5, -1.0, 1.0).is_err());
        assert!(InteractionDefinition::new("pets", ["cat"], ["couch"], 0.5, 1.0, f64::NAN).is_err());
    }

    #[test]
    fn names_and_labels_reject_topic_operators() {
        assert!(validate_name("camera", "front_door").is_ok());
        assert!(validate_name("camera", "front/door").is_err());
        assert!(validate_name("camera", "").is_err());
        assert!(validate_label("cell phone").is_ok());
        assert!(validate_label("cat/dog").is_err());
        assert!(validate_label("cat#").is_err());
        assert!(validate_label("+").is_err());
    }

    #[test]
    fn key_display_is_topic_shaped() {
        let key = InteractionKey::new("yard", "pets", &LabelPair::new("cat", "dog"));
        assert_eq!(key.to_string(), "yard/pets/cat/dog");
    }
}
