use std::collections::{BTreeSet, HashMap};

use super::{InteractionDefinition, InteractionKey, InteractionState, LabelPair, Phase, Transition};

/// A transition produced by [`InteractionTable::step`].
#[derive(Clone, Debug, PartialEq)]
pub struct KeyTransition {
    pub key: InteractionKey,
    pub transition: Transition,
    pub at: f64,
}

/// State machines of one camera shard.
///
/// Only Pending and Active keys are stored; a missing key is Idle.
#[derive(Debug, Default)]
pub struct InteractionTable {
    states: HashMap<InteractionKey, InteractionState>,
}

impl InteractionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one tick of one definition on one camera.
    ///
    /// Every key in `overlapping` plus every stored key of this
    /// camera/definition is advanced exactly once. Transitions come back in
    /// key order.
    pub fn step(
        &mut self,
        camera: &str,
        definition: &InteractionDefinition,
        overlapping: &BTreeSet<LabelPair>,
        now: f64,
    ) -> Vec<KeyTransition> {
        let mut keys: BTreeSet<InteractionKey> = overlapping
            .iter()
            .map(|pair| InteractionKey::new(camera, &definition.name, pair))
            .collect();
        keys.extend(
            self.states
                .keys()
                .filter(|key| key.camera == camera && key.interaction == definition.name)
                .cloned(),
        );

        let mut transitions = Vec::new();
        for key in keys {
            let observed = overlapping.contains(&key.pair());
            let state = self.states.entry(key.clone()).or_default();
            let transition = state.advance(observed, now, &definition.timing);
            if state.is_idle() {
                self.states.remove(&key);
            }
            if let Some(transition) = transition {
                transitions.push(KeyTransition {
                    key,
                    transition,
                    at: now,
                });
            }
        }
        transitions
    }

    pub fn get(&self, key: &InteractionKey) -> Option<&InteractionState> {
        self.states.get(key)
    }

    /// Phase of a key; absent keys are Idle.
    pub fn phase(&self, key: &InteractionKey) -> Phase {
        self.states.get(key).map(|s| s.phase).unwrap_or_default()
    }

    pub fn active_keys(&self) -> impl Iterator<Item = &InteractionKey> {
        self.states
            .iter()
            .filter(|(_, state)| state.phase == Phase::Active)
            .map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
