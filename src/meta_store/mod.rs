//! Persistent record of all snapshots. The engine consumes the [`MetaStore`]
//! trait; every operation is atomic with respect to the others.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::data_model::{SnapshotId, SnapshotInfo};

#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Inserts a new snapshot record. The uuid must be unused.
    async fn add_snapshot(&self, info: &SnapshotInfo) -> Result<()>;

    /// Replaces the record of an existing snapshot.
    async fn update_snapshot(&self, info: &SnapshotInfo) -> Result<()>;

    async fn get_snapshot_info(&self, uuid: &SnapshotId) -> Result<Option<SnapshotInfo>>;

    /// Snapshots of one volume, oldest first.
    async fn get_snapshot_list(&self, file: &str) -> Result<Vec<SnapshotInfo>>;

    /// Every snapshot of every volume.
    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>>;

    /// Removes a snapshot record. Deleting a missing uuid is success.
    async fn delete_snapshot(&self, uuid: &SnapshotId) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryMetaStore {
    snapshots: RwLock<HashMap<SnapshotId, SnapshotInfo>>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn add_snapshot(&self, info: &SnapshotInfo) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.contains_key(&info.uuid) {
            return Err(anyhow!("snapshot {} already exists", info.uuid));
        }
        snapshots.insert(info.uuid.clone(), info.clone());
        Ok(())
    }

    async fn update_snapshot(&self, info: &SnapshotInfo) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get_mut(&info.uuid) {
            Some(existing) => {
                *existing = info.clone();
                Ok(())
            }
            None => Err(anyhow!("snapshot {} does not exist", info.uuid)),
        }
    }

    async fn get_snapshot_info(&self, uuid: &SnapshotId) -> Result<Option<SnapshotInfo>> {
        Ok(self.snapshots.read().await.get(uuid).cloned())
    }

    async fn get_snapshot_list(&self, file: &str) -> Result<Vec<SnapshotInfo>> {
        let snapshots = self.snapshots.read().await;
        let mut list: Vec<SnapshotInfo> = snapshots
            .values()
            .filter(|info| info.file_name == file)
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.uuid.cmp(&b.uuid))
        });
        Ok(list)
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let snapshots = self.snapshots.read().await;
        let mut list: Vec<SnapshotInfo> = snapshots.values().cloned().collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.uuid.cmp(&b.uuid))
        });
        Ok(list)
    }

    async fn delete_snapshot(&self, uuid: &SnapshotId) -> Result<()> {
        self.snapshots.write().await.remove(uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{SnapshotInfoBuilder, SnapshotStatus};

    fn snapshot(file: &str, name: &str) -> SnapshotInfo {
        SnapshotInfoBuilder::default()
            .user("user1".to_string())
            .file_name(file.to_string())
            .snapshot_name(name.to_string())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_get_update_delete() {
        let store = InMemoryMetaStore::new();
        let mut info = snapshot("/vol", "snap1");
        store.add_snapshot(&info).await.unwrap();
        assert!(store.add_snapshot(&info).await.is_err());

        info.status = SnapshotStatus::Done;
        store.update_snapshot(&info).await.unwrap();
        let read = store.get_snapshot_info(&info.uuid).await.unwrap().unwrap();
        assert!(matches!(read.status, SnapshotStatus::Done));

        store.delete_snapshot(&info.uuid).await.unwrap();
        assert!(store
            .get_snapshot_info(&info.uuid)
            .await
            .unwrap()
            .is_none());
        // delete of a missing uuid is success
        store.delete_snapshot(&info.uuid).await.unwrap();
        assert!(store.update_snapshot(&info).await.is_err());
    }

    #[tokio::test]
    async fn test_get_snapshot_list_filters_by_file() {
        let store = InMemoryMetaStore::new();
        store.add_snapshot(&snapshot("/a", "s1")).await.unwrap();
        store.add_snapshot(&snapshot("/a", "s2")).await.unwrap();
        store.add_snapshot(&snapshot("/b", "s3")).await.unwrap();

        assert_eq!(store.get_snapshot_list("/a").await.unwrap().len(), 2);
        assert_eq!(store.get_snapshot_list("/b").await.unwrap().len(), 1);
        assert_eq!(store.list_snapshots().await.unwrap().len(), 3);
    }
}
