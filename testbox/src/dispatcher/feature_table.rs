//! Maps feature indices to the features a device reported for them.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;

/// A feature known to live at some index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct FeatureEntry {
    /// The protocol ID of the feature.
    pub feature_id: u16,

    /// The version of the feature implemented by the device.
    pub version: u8,
}

/// The feature table of one channel and protocol.
///
/// Index 0 always holds the root feature (`0x0000`). No `(feature_id,
/// version)` pair is stored under two indices at once.
#[derive(Debug)]
pub struct FeatureTable {
    entries: Mutex<BTreeMap<u8, FeatureEntry>>,
}

impl FeatureTable {
    /// Creates a table holding only the root feature.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Self::seed()),
        }
    }

    fn seed() -> BTreeMap<u8, FeatureEntry> {
        BTreeMap::from([(0, FeatureEntry {
            feature_id: 0x0000,
            version: 0,
        })])
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u8, FeatureEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a feature under `index`, replacing whatever was stored there
    /// and removing the feature from any other index.
    pub fn insert(&self, index: u8, feature_id: u16, version: u8) {
        let entry = FeatureEntry {
            feature_id,
            version,
        };

        let mut entries = self.lock();
        entries.retain(|&other_index, other| other_index == index || *other != entry);
        entries.insert(index, entry);
    }

    /// The feature stored under `index`.
    pub fn get(&self, index: u8) -> Option<FeatureEntry> {
        self.lock().get(&index).copied()
    }

    /// The lowest index a feature is stored under, along with its version.
    pub fn index_of(&self, feature_id: u16) -> Option<(u8, u8)> {
        self.lock()
            .iter()
            .find(|(_, entry)| entry.feature_id == feature_id)
            .map(|(&index, entry)| (index, entry.version))
    }

    /// Removes the feature stored under `index`.
    pub fn remove(&self, index: u8) -> Option<FeatureEntry> {
        self.lock().remove(&index)
    }

    /// Forgets every feature except the root feature.
    pub fn clear(&self) {
        *self.lock() = Self::seed();
    }

    /// All stored features, ordered by index.
    pub fn entries(&self) -> Vec<(u8, FeatureEntry)> {
        self.lock()
            .iter()
            .map(|(&index, &entry)| (index, entry))
            .collect()
    }

    /// The number of stored features, including the root feature.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the table is empty. Only true after the root feature was
    /// removed explicitly.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for FeatureTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_root() {
        let table = FeatureTable::new();
        assert_eq!(table.index_of(0x0000), Some((0, 0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn moving_a_feature_drops_its_old_index() {
        let table = FeatureTable::new();
        table.insert(4, 0x0007, 0);
        table.insert(5, 0x0007, 0);

        assert_eq!(table.get(4), None);
        assert_eq!(table.index_of(0x0007), Some((5, 0)));

        table.insert(5, 0x0001, 2);
        assert_eq!(table.index_of(0x0007), None);
        assert_eq!(
            table.get(5),
            Some(FeatureEntry {
                feature_id: 0x0001,
                version: 2
            })
        );
    }

    #[test]
    fn clear_keeps_root() {
        let table = FeatureTable::new();
        table.insert(1, 0x0001, 0);
        table.clear();
        assert_eq!(table.entries().len(), 1);
        assert_eq!(table.index_of(0x0001), None);
    }
}
