//! Mapping between user labels and section indexes.

use foldhash::{HashMap, HashMapExt};

use crate::SectionIndex;

/// Label of the root section. Not reachable through label lookups.
pub(crate) const ROOT_LABEL: &str = "Root";

/// Assigns stable, sequential section indexes to labels.
///
/// Index 0 belongs to the root section and is never handed out for a user label, even one
/// that happens to be spelled like the root label. Indexes are assigned in first-use order
/// and iteration follows that order.
#[derive(Debug)]
pub(crate) struct LabelRegistry {
    // Position is the section index; position 0 is the root.
    labels: Vec<String>,
    indexes: HashMap<String, SectionIndex>,
}

impl LabelRegistry {
    pub(crate) fn new() -> Self {
        Self {
            labels: vec![ROOT_LABEL.to_string()],
            indexes: HashMap::new(),
        }
    }

    /// Returns the index of the label, registering it first if unseen.
    ///
    /// The flag is `true` if the label was registered by this call.
    pub(crate) fn resolve(&mut self, label: &str) -> (SectionIndex, bool) {
        if let Some(index) = self.indexes.get(label) {
            return (*index, false);
        }

        let index = SectionIndex::new(self.labels.len());
        self.labels.push(label.to_string());
        self.indexes.insert(label.to_string(), index);

        (index, true)
    }

    pub(crate) fn lookup(&self, label: &str) -> Option<SectionIndex> {
        self.indexes.get(label).copied()
    }

    pub(crate) fn reverse_lookup(&self, index: SectionIndex) -> Option<&str> {
        self.labels.get(index.get()).map(String::as_str)
    }

    /// Number of registered sections, including the root.
    pub(crate) fn len(&self) -> usize {
        self.labels.len()
    }

    /// User labels in registration order.
    pub(crate) fn user_labels(&self) -> impl Iterator<Item = (SectionIndex, &str)> {
        self.labels
            .iter()
            .enumerate()
            .skip(1)
            .map(|(index, label)| (SectionIndex::new(index), label.as_str()))
    }

    /// Forgets all user labels. The root stays.
    pub(crate) fn clear(&mut self) {
        self.labels.truncate(1);
        self.indexes.clear();
    }
}
