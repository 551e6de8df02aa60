//! Reference index: label and ownership lookups
//!
//! Two derived indexes kept consistent by the reconcile loop: `(k, v)` label
//! pairs to want IDs, and owner ID to child IDs. Selector resolution is the
//! subset-match defined for `using`: a want matches iff every entry of the
//! selector appears in its labels. The index is loop-owned; everything
//! exposed outside the loop is a copy.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::want::{UsingSelector, Want, WantId};

/// Label and ownership indexes over the want graph
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    /// (key, value) label pair to carriers
    labels: HashMap<(String, String), BTreeSet<WantId>>,
    /// Owner ID to children holding any owner reference to it
    owners: HashMap<WantId, BTreeSet<WantId>>,
}

impl ReferenceIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a want's labels and owner references on admission
    pub fn insert(&mut self, id: WantId, want: &Want) {
        for (k, v) in &want.metadata.labels {
            self.labels
                .entry((k.clone(), v.clone()))
                .or_default()
                .insert(id);
        }
        for owner_ref in &want.metadata.owner_references {
            self.owners.entry(owner_ref.id).or_default().insert(id);
        }
    }

    /// Drop every entry for a deleted want
    pub fn remove(&mut self, id: WantId, want: &Want) {
        for (k, v) in &want.metadata.labels {
            if let Some(set) = self.labels.get_mut(&(k.clone(), v.clone())) {
                set.remove(&id);
                if set.is_empty() {
                    self.labels.remove(&(k.clone(), v.clone()));
                }
            }
        }
        for owner_ref in &want.metadata.owner_references {
            if let Some(set) = self.owners.get_mut(&owner_ref.id) {
                set.remove(&id);
                if set.is_empty() {
                    self.owners.remove(&owner_ref.id);
                }
            }
        }
    }

    /// Patch the index after a label change on `id`
    pub fn relabel(
        &mut self,
        id: WantId,
        old_labels: &BTreeMap<String, String>,
        new_labels: &BTreeMap<String, String>,
    ) {
        for (k, v) in old_labels {
            if new_labels.get(k) == Some(v) {
                continue;
            }
            if let Some(set) = self.labels.get_mut(&(k.clone(), v.clone())) {
                set.remove(&id);
                if set.is_empty() {
                    self.labels.remove(&(k.clone(), v.clone()));
                }
            }
        }
        for (k, v) in new_labels {
            if old_labels.get(k) == Some(v) {
                continue;
            }
            self.labels
                .entry((k.clone(), v.clone()))
                .or_default()
                .insert(id);
        }
    }

    /// Wants whose labels contain every entry of `selector`
    ///
    /// An empty selector matches nothing, never the whole graph.
    pub fn resolve_using(&self, selector: &UsingSelector) -> BTreeSet<WantId> {
        let mut entries = selector.iter();
        let Some((k, v)) = entries.next() else {
            return BTreeSet::new();
        };
        let mut matched = match self.labels.get(&(k.clone(), v.clone())) {
            Some(set) => set.clone(),
            None => return BTreeSet::new(),
        };
        for (k, v) in entries {
            match self.labels.get(&(k.clone(), v.clone())) {
                Some(set) => matched.retain(|id| set.contains(id)),
                None => return BTreeSet::new(),
            }
            if matched.is_empty() {
                break;
            }
        }
        matched
    }

    /// Carriers of one exact label pair
    pub fn by_label(&self, key: &str, value: &str) -> BTreeSet<WantId> {
        self.labels
            .get(&(key.to_string(), value.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Children holding any owner reference to `owner`
    pub fn children_of(&self, owner: WantId) -> BTreeSet<WantId> {
        self.owners.get(&owner).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::want::{OwnerReference, WantMetadata, WantSpec};
    use std::collections::BTreeMap;

    fn labeled_want(name: &str, labels: &[(&str, &str)]) -> (WantId, Want) {
        let id = WantId::new();
        let want = Want::new(
            WantMetadata {
                id: Some(id),
                name: name.to_string(),
                want_type: "test".to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            },
            WantSpec::default(),
        );
        (id, want)
    }

    fn selector(entries: &[(&str, &str)]) -> UsingSelector {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn subset_matching_resolves_selectors() {
        let mut index = ReferenceIndex::new();
        let (gen_id, gen) = labeled_want("gen", &[("role", "source"), ("tier", "fast")]);
        let (sink_id, sink) = labeled_want("sink", &[("role", "sink")]);
        index.insert(gen_id, &gen);
        index.insert(sink_id, &sink);

        assert_eq!(
            index.resolve_using(&selector(&[("role", "source")])),
            BTreeSet::from([gen_id])
        );
        assert_eq!(
            index.resolve_using(&selector(&[("role", "source"), ("tier", "fast")])),
            BTreeSet::from([gen_id])
        );
        assert!(index
            .resolve_using(&selector(&[("role", "source"), ("tier", "slow")]))
            .is_empty());
    }

    #[test]
    fn empty_selector_matches_nothing() {
        let mut index = ReferenceIndex::new();
        let (id, want) = labeled_want("gen", &[("role", "source")]);
        index.insert(id, &want);
        assert!(index.resolve_using(&UsingSelector::new()).is_empty());
    }

    #[test]
    fn labels_are_case_sensitive() {
        let mut index = ReferenceIndex::new();
        let (id, want) = labeled_want("gen", &[("Role", "Source")]);
        index.insert(id, &want);
        assert!(index.resolve_using(&selector(&[("role", "source")])).is_empty());
        assert_eq!(index.by_label("Role", "Source"), BTreeSet::from([id]));
    }

    #[test]
    fn remove_patches_both_indexes() {
        let mut index = ReferenceIndex::new();
        let (parent_id, parent) = labeled_want("parent", &[]);
        let (child_id, mut child) = labeled_want("child", &[("role", "leaf")]);
        child.metadata.owner_references.push(OwnerReference {
            kind: "Want".into(),
            name: "parent".into(),
            id: parent_id,
            controller: true,
        });
        index.insert(parent_id, &parent);
        index.insert(child_id, &child);
        assert_eq!(index.children_of(parent_id), BTreeSet::from([child_id]));

        index.remove(child_id, &child);
        assert!(index.children_of(parent_id).is_empty());
        assert!(index.by_label("role", "leaf").is_empty());
    }

    #[test]
    fn relabel_is_incremental() {
        let mut index = ReferenceIndex::new();
        let (id, want) = labeled_want("gen", &[("role", "source"), ("tier", "fast")]);
        index.insert(id, &want);

        let old = want.metadata.labels.clone();
        let new: BTreeMap<String, String> = [
            ("role".to_string(), "sink".to_string()),
            ("tier".to_string(), "fast".to_string()),
        ]
        .into();
        index.relabel(id, &old, &new);

        assert!(index.by_label("role", "source").is_empty());
        assert_eq!(index.by_label("role", "sink"), BTreeSet::from([id]));
        assert_eq!(index.by_label("tier", "fast"), BTreeSet::from([id]));
    }
}
