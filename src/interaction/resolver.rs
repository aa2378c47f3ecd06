use std::collections::BTreeSet;

use crate::detect::Detection;
use crate::geometry::overlap_ratio;

use super::{InteractionDefinition, LabelPair};

/// Label pairs overlapping at or above the definition's threshold in one frame.
///
/// Every detection whose label is in slot A is tried against every detection
/// whose label is in slot B; a detection can fill both slots but is never
/// paired with itself. A pair is reported when any instance combination with
/// those labels qualifies.
pub fn resolve_pairs(
    definition: &InteractionDefinition,
    detections: &[Detection],
) -> BTreeSet<LabelPair> {
    let mut overlapping = BTreeSet::new();

    let slot_a = detections
        .iter()
        .enumerate()
        .filter(|(_, d)| definition.slot_a.contains(&d.label));

    for (i, a) in slot_a {
        let slot_b = detections
            .iter()
            .enumerate()
            .filter(|(j, d)| *j != i && definition.slot_b.contains(&d.label));
        for (_, b) in slot_b {
            if overlapping
                .iter()
                .any(|p: &LabelPair| p.label_a == a.label && p.label_b == b.label)
            {
                continue;
            }
            if overlap_ratio(&a.bbox, &b.bbox) >= definition.threshold {
                overlapping.insert(LabelPair::new(a.label.clone(), b.label.clone()));
            }
        }
    }

    overlapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;

    fn det(label: &str, x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection::new(label, BoundingBox::new(x, y, w, h))
    }

    fn pets_on_furniture() -> InteractionDefinition {
        InteractionDefinition::new("pets", ["cat", "dog"], ["couch", "bed"], 0.3, 6.0, 4.0)
            .expect("definition")
    }

    #[test]
    fn reports_overlapping_pair() {
        let pairs = resolve_pairs(
            &pets_on_furniture(),
            &[det("cat", 10.0, 10.0, 10.0, 10.0), det("couch", 0.0, 0.0, 50.0, 30.0)],
        );
        assert_eq!(pairs.len(), 1);
        assert!(pairs.contains(&LabelPair::new("cat", "couch")));
    }

    #[test]
    fn threshold_is_inclusive() {
        // Exactly 30% of the cat overlaps the couch.
        let pairs = resolve_pairs(
            &pets_on_furniture(),
            &[det("cat", 0.0, 0.0, 10.0, 10.0), det("couch", 7.0, 0.0, 20.0, 10.0)],
        );
        assert!(pairs.contains(&LabelPair::new("cat", "couch")));
    }

    #[test]
    fn below_threshold_is_not_reported() {
        let pairs = resolve_pairs(
            &pets_on_furniture(),
            &[det("cat", 0.0, 0.0, 10.0, 10.0), det("couch", 8.0, 0.0, 20.0, 10.0)],
        );
        assert!(pairs.is_empty());
    }

    #[test]
    fn any_instance_combination_counts() {
        // First cat is far away, second cat sits on the couch.
        let pairs = resolve_pairs(
            &pets_on_furniture(),
            &[
                det("cat", 500.0, 500.0, 10.0, 10.0),
                det("cat", 5.0, 5.0, 10.0, 10.0),
                det("couch", 0.0, 0.0, 50.0, 30.0),
            ],
        );
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn distinct_label_pairs_are_reported_separately() {
        let pairs = resolve_pairs(
            &pets_on_furniture(),
            &[
                det("cat", 5.0, 5.0, 10.0, 10.0),
                det("couch", 0.0, 0.0, 50.0, 30.0),
                det("dog", 105.0, 5.0, 10.0, 10.0),
                det("bed", 100.0, 0.0, 50.0, 30.0),
            ],
        );
        assert_eq!(
            pairs.into_iter().collect::<Vec<_>>(),
            vec![LabelPair::new("cat", "couch"), LabelPair::new("dog", "bed")]
        );
    }

    #[test]
    fn labels_outside_slots_are_ignored() {
        let pairs = resolve_pairs(
            &pets_on_furniture(),
            &[det("person", 0.0, 0.0, 50.0, 30.0), det("cat", 5.0, 5.0, 10.0, 10.0)],
        );
        assert!(pairs.is_empty());
    }

    #[test]
    fn self_pair_needs_two_instances() {
        let def = InteractionDefinition::new("cat_fight", ["cat"], ["cat"], 0.3, 1.0, 1.0)
            .expect("definition");

        let lone = resolve_pairs(&def, &[det("cat", 0.0, 0.0, 10.0, 10.0)]);
        assert!(lone.is_empty());

        let two = resolve_pairs(
            &def,
            &[det("cat", 0.0, 0.0, 10.0, 10.0), det("cat", 2.0, 2.0, 10.0, 10.0)],
        );
        assert!(two.contains(&LabelPair::new("cat", "cat")));
    }

    #[test]
    fn overlapping_slots_consider_both_assignments() {
        let def = InteractionDefinition::new("pets", ["cat", "dog"], ["cat", "dog"], 0.3, 1.0, 1.0)
            .expect("definition");
        let pairs = resolve_pairs(
            &def,
            &[det("cat", 0.0, 0.0, 10.0, 10.0), det("dog", 2.0, 2.0, 10.0, 10.0)],
        );
        assert_eq!(
            pairs.into_iter().collect::<Vec<_>>(),
            vec![LabelPair::new("cat", "dog"), LabelPair::new("dog", "cat")]
        );
    }
}
