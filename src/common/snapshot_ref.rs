use std::{collections::HashMap, sync::Mutex};

use crate::data_model::SnapshotId;

/// Counts how many clones are currently reading each snapshot. A snapshot
/// with a non-zero count must not be deleted.
#[derive(Default)]
pub struct SnapshotRefCounter {
    counts: Mutex<HashMap<SnapshotId, u32>>,
}

impl SnapshotRefCounter {
    pub fn incr(&self, uuid: &SnapshotId) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(uuid.clone()).or_insert(0) += 1;
    }

    pub fn decr(&self, uuid: &SnapshotId) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(uuid) {
            *count -= 1;
            if *count == 0 {
                counts.remove(uuid);
            }
        }
    }

    pub fn get(&self, uuid: &SnapshotId) -> u32 {
        self.counts.lock().unwrap().get(uuid).copied().unwrap_or(0)
    }
}
