//! Orchestration of the create and delete snapshot pipelines.
//!
//! Precondition checks run synchronously under the per-volume or per-snapshot
//! name lock and commit a status transition before the async pipeline is
//! enqueued. The pipelines themselves never return errors: a failed stage
//! persists `SnapshotStatus::Error` and signals the task, leaving cleanup to a
//! later delete. Cancellation unwinds completed stages in reverse order.

use std::{sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::{
    common::{name_lock::NameLockRegistry, snapshot_ref::SnapshotRefCounter},
    config::SnapshotConfig,
    data_model::{
        ChunkIndexData, ChunkIndexDataName, FileSnapMap, SnapshotId, SnapshotInfo,
        SnapshotInfoBuilder, SnapshotStatus, VolumeFileStatus, UNINITIALIZED_SEQ,
    },
    data_store::SnapshotDataStore,
    error::{Result, SnapshotError},
    meta_store::MetaStore,
    metrics::SnapshotMetrics,
    snapshot::task::SnapshotTaskInfo,
    task::WorkerPool,
    volume_client::{SnapshotStatusCheck, VolumeClient, VolumeClientError},
};

// Create pipeline progress:
//
// | create upstream snapshot | build chunk index | build snapshot map | transfer | update metadata |
// | 5%                       | 6%                | 10%                | 10%~99%  | 100%            |
pub(crate) const PROGRESS_CREATE_VOLUME_SNAPSHOT_DONE: u32 = 5;
pub(crate) const PROGRESS_BUILD_CHUNK_INDEX_DONE: u32 = 6;
pub(crate) const PROGRESS_BUILD_SNAPSHOT_MAP_DONE: u32 = 10;
pub(crate) const PROGRESS_TRANSFER_START: u32 = PROGRESS_BUILD_SNAPSHOT_MAP_DONE;
pub(crate) const PROGRESS_TRANSFER_DONE: u32 = 99;
pub(crate) const PROGRESS_COMPLETE: u32 = 100;

// Delete pipeline progress:
//
// | build snapshot map | delete chunk data | delete chunk index | delete metadata |
// | 10%                | 10%~80%           | 90%                | 100%            |
const DEL_PROGRESS_BUILD_SNAPSHOT_MAP_DONE: u32 = 10;
const DEL_PROGRESS_DELETE_CHUNK_DATA_START: u32 = DEL_PROGRESS_BUILD_SNAPSHOT_MAP_DONE;
const DEL_PROGRESS_DELETE_CHUNK_DATA_DONE: u32 = 80;
const DEL_PROGRESS_DELETE_CHUNK_INDEX_DONE: u32 = 90;

pub struct SnapshotCore {
    pub(crate) client: Arc<dyn VolumeClient>,
    pub(crate) meta_store: Arc<dyn MetaStore>,
    pub(crate) data_store: SnapshotDataStore,
    pub(crate) snapshot_ref: Arc<SnapshotRefCounter>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) config: SnapshotConfig,
    pub(crate) metrics: SnapshotMetrics,
    file_lock: Arc<NameLockRegistry>,
    snapshot_lock: Arc<NameLockRegistry>,
}

impl SnapshotCore {
    pub fn new(
        client: Arc<dyn VolumeClient>,
        meta_store: Arc<dyn MetaStore>,
        data_store: SnapshotDataStore,
        snapshot_ref: Arc<SnapshotRefCounter>,
        pool: Arc<WorkerPool>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            client,
            meta_store,
            data_store,
            snapshot_ref,
            pool,
            config,
            metrics: SnapshotMetrics::new(),
            file_lock: NameLockRegistry::new(),
            snapshot_lock: NameLockRegistry::new(),
        }
    }

    /// Validates that a snapshot of `file` may be taken and commits the
    /// pending record. Serialized per volume by the file name lock.
    pub async fn create_snapshot_pre(
        &self,
        file: &str,
        user: &str,
        snapshot_name: &str,
    ) -> Result<SnapshotInfo> {
        let _guard = self.file_lock.lock(file).await;

        let snapshots = self
            .meta_store
            .get_snapshot_list(file)
            .await
            .map_err(SnapshotError::from)?;
        for snap in &snapshots {
            if matches!(snap.status, SnapshotStatus::Error) {
                info!(
                    file,
                    uuid = %snap.uuid,
                    "cannot create snapshot while a snapshot of the volume is in error"
                );
                return Err(SnapshotError::SnapshotCannotCreateWhenError);
            }
        }
        if snapshots.len() >= self.config.max_snapshot_limit {
            error!(file, "snapshot count reached the limit");
            return Err(SnapshotError::SnapshotCountReachLimit);
        }

        let volume = match self.client.get_file_info(file, user).await {
            Ok(volume) => volume,
            Err(VolumeClientError::NotExist) => {
                error!(file, user, snapshot_name, "create snapshot: file not exist");
                return Err(SnapshotError::FileNotExist);
            }
            Err(VolumeClientError::AuthFail) => {
                error!(file, user, snapshot_name, "create snapshot: invalid user");
                return Err(SnapshotError::InvalidUser);
            }
            Err(err) => {
                error!(file, user, "get_file_info error: {err}");
                return Err(SnapshotError::internal(err.to_string()));
            }
        };
        if !matches!(
            volume.file_status,
            VolumeFileStatus::Created | VolumeFileStatus::Cloned
        ) {
            error!(
                file,
                status = %volume.file_status,
                "cannot create snapshot in this volume status"
            );
            return Err(SnapshotError::FileStatusInvalid);
        }

        let info = SnapshotInfoBuilder::default()
            .user(user.to_string())
            .file_name(file.to_string())
            .snapshot_name(snapshot_name.to_string())
            .build()
            .map_err(|err| SnapshotError::internal(err.to_string()))?;
        self.meta_store.add_snapshot(&info).await.map_err(|err| {
            error!(uuid = %info.uuid, file, "add_snapshot error: {err:#}");
            SnapshotError::from(err)
        })?;
        Ok(info)
    }

    /// Validates deletion of a snapshot and commits the `deleting` /
    /// `errorDeleting` transition. Serialized per snapshot by the uuid lock.
    /// Returns `None` when the snapshot does not exist: deletion is
    /// idempotent and there is nothing to enqueue.
    pub async fn delete_snapshot_pre(
        &self,
        uuid: &SnapshotId,
        user: &str,
        file: &str,
    ) -> Result<Option<SnapshotInfo>> {
        let _guard = self.snapshot_lock.lock(uuid).await;

        let Some(mut info) = self
            .meta_store
            .get_snapshot_info(uuid)
            .await
            .map_err(SnapshotError::from)?
        else {
            return Ok(None);
        };
        if info.user != user {
            error!(%uuid, user, "cannot delete snapshot of a different user");
            return Err(SnapshotError::InvalidUser);
        }
        if info.file_name != file {
            error!(%uuid, file, "cannot delete snapshot, file name does not match");
            return Err(SnapshotError::FileNameNotMatch);
        }

        match info.status {
            SnapshotStatus::Done => info.status = SnapshotStatus::Deleting,
            SnapshotStatus::Error => info.status = SnapshotStatus::ErrorDeleting,
            SnapshotStatus::Canceling
            | SnapshotStatus::Deleting
            | SnapshotStatus::ErrorDeleting => return Err(SnapshotError::TaskExist),
            SnapshotStatus::Pending => {
                return Err(SnapshotError::SnapshotCannotDeleteUnfinished)
            }
        }

        if self.snapshot_ref.get(uuid) > 0 {
            return Err(SnapshotError::SnapshotCannotDeleteCloning);
        }

        self.meta_store.update_snapshot(&info).await.map_err(|err| {
            error!(%uuid, "update_snapshot error: {err:#}");
            SnapshotError::from(err)
        })?;
        Ok(Some(info))
    }

    /// Runs the create pipeline to completion. Any stage failure persists
    /// `error` without cleanup; cancellation unwinds the completed stages in
    /// reverse order.
    pub async fn handle_create_snapshot_task(&self, task: Arc<SnapshotTaskInfo>) {
        let mut info = task.snapshot();
        let file_name = info.file_name.clone();

        let exist_index_data;
        if info.seq_num == UNINITIALIZED_SEQ {
            if let Err(err) = self.create_snapshot_on_volume(&mut info, &task).await {
                error!(%file_name, "create_snapshot_on_volume error: {err}");
                self.handle_create_snapshot_error(&task).await;
                return;
            }
            exist_index_data = false;
        } else {
            // recovery path: the index data may already be persisted
            let name = ChunkIndexDataName::new(&file_name, info.seq_num);
            exist_index_data = match self.data_store.chunk_index_data_exist(&name).await {
                Ok(exists) => exists,
                Err(err) => {
                    error!(%file_name, "chunk_index_data_exist error: {err:#}");
                    self.handle_create_snapshot_error(&task).await;
                    return;
                }
            };
        }
        let seq_num = info.seq_num;

        task.set_progress(PROGRESS_CREATE_VOLUME_SNAPSHOT_DONE);
        if task.is_canceled() {
            self.cancel_after_create_snapshot_on_volume(&task).await;
            return;
        }

        let name = ChunkIndexDataName::new(&file_name, seq_num);
        let (index_data, seg_infos) = if exist_index_data {
            let index_data = match self.data_store.get_chunk_index_data(&name).await {
                Ok(data) => data,
                Err(err) => {
                    error!(%file_name, seq_num, "get_chunk_index_data error: {err:#}");
                    self.handle_create_snapshot_error(&task).await;
                    return;
                }
            };
            task.set_progress(PROGRESS_BUILD_CHUNK_INDEX_DONE);
            let seg_infos = match self.build_segment_info(&info).await {
                Ok(segs) => segs,
                Err(err) => {
                    error!(%file_name, "build_segment_info error: {err}");
                    self.handle_create_snapshot_error(&task).await;
                    return;
                }
            };
            (index_data, seg_infos)
        } else {
            let (index_data, seg_infos) = match self.build_chunk_index_data(&info, &task).await {
                Ok(built) => built,
                Err(err) => {
                    error!(%file_name, "build_chunk_index_data error: {err}");
                    self.handle_create_snapshot_error(&task).await;
                    return;
                }
            };
            if let Err(err) = self.data_store.put_chunk_index_data(&name, &index_data).await {
                error!(%file_name, "put_chunk_index_data error: {err:#}");
                self.handle_create_snapshot_error(&task).await;
                return;
            }
            task.set_progress(PROGRESS_BUILD_CHUNK_INDEX_DONE);
            (index_data, seg_infos)
        };

        if task.is_canceled() {
            self.cancel_after_create_chunk_index_data(&task).await;
            return;
        }

        let snap_map = match self.build_snapshot_map(&file_name, seq_num).await {
            Ok(map) => map,
            Err(err) => {
                error!(%file_name, seq_num, "build_snapshot_map error: {err}");
                self.handle_create_snapshot_error(&task).await;
                return;
            }
        };
        task.set_progress(PROGRESS_BUILD_SNAPSHOT_MAP_DONE);

        if let Err(err) = self
            .transfer_snapshot_data(
                &index_data,
                &info,
                &seg_infos,
                |chunk| snap_map.contains_chunk(chunk),
                &task,
            )
            .await
        {
            error!(%file_name, "transfer_snapshot_data error: {err}");
            self.handle_create_snapshot_error(&task).await;
            return;
        }
        task.set_progress(PROGRESS_TRANSFER_DONE);

        // The lock is held until `done` is persisted so that a concurrent
        // cancel cannot race with completion.
        let _guard = task.lock().await;
        if task.is_canceled() {
            self.cancel_after_transfer_snapshot_data(&task, &index_data, &snap_map)
                .await;
            return;
        }

        info.status = SnapshotStatus::Done;
        task.set_snapshot(info.clone());
        if let Err(err) = self.meta_store.update_snapshot(&info).await {
            error!(uuid = %task.uuid(), "update_snapshot error: {err:#}");
            self.handle_create_snapshot_error(&task).await;
            return;
        }
        task.set_progress(PROGRESS_COMPLETE);
        self.metrics.snapshots_created.add(1, &[]);
        task.finish();
        info!(uuid = %task.uuid(), %file_name, "create snapshot success");
    }

    async fn cancel_after_transfer_snapshot_data(
        &self,
        task: &SnapshotTaskInfo,
        index_data: &ChunkIndexData,
        snap_map: &FileSnapMap,
    ) {
        info!(uuid = %task.uuid(), "cancel after transfer snapshot data");
        for chunk_index in index_data.all_chunk_indexes() {
            let Some(chunk) = index_data.chunk_data_name(chunk_index) else {
                continue;
            };
            if snap_map.contains_chunk(&chunk) {
                continue;
            }
            let delete = match self.data_store.chunk_data_exist(&chunk).await {
                Ok(exists) => exists,
                Err(err) => {
                    error!(%chunk, "chunk_data_exist error while canceling: {err:#}");
                    self.handle_create_snapshot_error(task).await;
                    return;
                }
            };
            if delete {
                if let Err(err) = self.data_store.delete_chunk_data(&chunk).await {
                    error!(%chunk, "delete_chunk_data error while canceling: {err:#}");
                    self.handle_create_snapshot_error(task).await;
                    return;
                }
            }
        }
        self.cancel_after_create_chunk_index_data(task).await;
    }

    async fn cancel_after_create_chunk_index_data(&self, task: &SnapshotTaskInfo) {
        info!(uuid = %task.uuid(), "cancel after create chunk index data");
        let info = task.snapshot();
        let name = ChunkIndexDataName::new(task.file_name(), info.seq_num);
        if let Err(err) = self.data_store.delete_chunk_index_data(&name).await {
            error!(
                file_name = task.file_name(),
                seq_num = info.seq_num,
                "delete_chunk_index_data error while canceling: {err:#}"
            );
            self.handle_create_snapshot_error(task).await;
            return;
        }
        self.cancel_after_create_snapshot_on_volume(task).await;
    }

    async fn cancel_after_create_snapshot_on_volume(&self, task: &SnapshotTaskInfo) {
        info!(uuid = %task.uuid(), "cancel after create snapshot on volume service");
        let info = task.snapshot();
        if let Err(err) = self.delete_snapshot_on_volume(&info).await {
            error!(uuid = %task.uuid(), "delete_snapshot_on_volume error while canceling: {err}");
            self.handle_create_snapshot_error(task).await;
            return;
        }
        self.clear_snapshot_meta(task).await;
    }

    async fn clear_snapshot_meta(&self, task: &SnapshotTaskInfo) {
        if let Err(err) = self.meta_store.delete_snapshot(task.uuid()).await {
            error!(uuid = %task.uuid(), "delete_snapshot error while canceling: {err:#}");
            self.handle_create_snapshot_error(task).await;
            return;
        }
        self.metrics.snapshots_canceled.add(1, &[]);
        info!(uuid = %task.uuid(), "create snapshot canceled");
        task.finish();
    }

    async fn handle_create_snapshot_error(&self, task: &SnapshotTaskInfo) {
        let mut info = task.snapshot();
        info.status = SnapshotStatus::Error;
        task.set_snapshot(info.clone());
        if let Err(err) = self.meta_store.update_snapshot(&info).await {
            error!(uuid = %task.uuid(), "update_snapshot error while failing task: {err:#}");
        }
        self.metrics.snapshot_failures.add(1, &[]);
        task.finish();
        error!(uuid = %task.uuid(), "create snapshot failed");
    }

    /// Registers the snapshot upstream, populates the volume attributes and
    /// persists them. Waits two session periods afterwards so that every
    /// volume client observes the new sequence.
    async fn create_snapshot_on_volume(
        &self,
        info: &mut SnapshotInfo,
        task: &SnapshotTaskInfo,
    ) -> Result<()> {
        let ack = self
            .client
            .create_snapshot(&info.file_name, &info.user)
            .await
            .map_err(|err| {
                SnapshotError::internal(format!("create snapshot upstream failed: {err}"))
            })?;
        let seq_num = ack.seq();
        info!(file_name = %info.file_name, seq_num, "created snapshot on volume service");

        let volume = self
            .client
            .get_snapshot(&info.file_name, &info.user, seq_num)
            .await
            .map_err(|err| {
                SnapshotError::internal(format!("get snapshot upstream failed: {err}"))
            })?;
        info.seq_num = seq_num;
        info.chunk_size = volume.chunk_size;
        info.segment_size = volume.segment_size;
        info.file_length = volume.file_length;
        info.created_at = volume.ctime;
        task.set_snapshot(info.clone());
        self.meta_store
            .update_snapshot(info)
            .await
            .map_err(SnapshotError::from)?;

        tokio::time::sleep(Duration::from_micros(self.config.mds_session_time_us * 2)).await;
        Ok(())
    }

    /// Releases the upstream snapshot handle and waits until the upstream has
    /// actually dropped it.
    pub(crate) async fn delete_snapshot_on_volume(&self, info: &SnapshotInfo) -> Result<()> {
        self.client
            .delete_snapshot(&info.file_name, &info.user, info.seq_num)
            .await
            .map_err(|err| {
                error!(
                    file_name = %info.file_name,
                    seq_num = info.seq_num,
                    "delete snapshot upstream failed: {err}"
                );
                SnapshotError::internal(err.to_string())
            })?;
        loop {
            match self
                .client
                .check_snapshot_status(&info.file_name, &info.user, info.seq_num)
                .await
            {
                Ok(SnapshotStatusCheck::NotFound) => break,
                Ok(SnapshotStatusCheck::Status(status)) => {
                    if status != VolumeFileStatus::Deleting {
                        break;
                    }
                }
                Err(err) => {
                    error!(file_name = %info.file_name, "check_snapshot_status failed: {err}");
                    return Err(SnapshotError::internal(err.to_string()));
                }
            }
            tokio::time::sleep(Duration::from_millis(
                self.config.check_snapshot_status_interval_ms,
            ))
            .await;
        }
        Ok(())
    }

    /// Union of the chunk index data of every peer snapshot (any sequence
    /// other than `seq_num`) of the volume.
    pub(crate) async fn build_snapshot_map(
        &self,
        file_name: &str,
        seq_num: u64,
    ) -> Result<FileSnapMap> {
        let snapshots = self
            .meta_store
            .get_snapshot_list(file_name)
            .await
            .map_err(SnapshotError::from)?;
        let mut map = FileSnapMap::default();
        for snap in snapshots {
            if snap.seq_num == seq_num {
                continue;
            }
            let name = ChunkIndexDataName::new(&snap.file_name, snap.seq_num);
            match self.data_store.get_chunk_index_data(&name).await {
                Ok(index) => map.maps.push(index),
                Err(err) => {
                    // A peer without index data (for example a snapshot that
                    // failed before writing it) must not block this task, so
                    // the peer is skipped. The resulting map is a lower bound
                    // on the live references.
                    warn!(
                        file_name = %snap.file_name,
                        seq_num = snap.seq_num,
                        "get_chunk_index_data failed for peer snapshot, skipping: {err:#}"
                    );
                }
            }
        }
        Ok(map)
    }

    /// Runs the delete pipeline to completion. Reentrant: every removal
    /// tolerates already-missing state.
    pub async fn handle_delete_snapshot_task(&self, task: Arc<SnapshotTaskInfo>) {
        let info = task.snapshot();
        let seq_num = info.seq_num;
        let file_name = task.file_name().to_string();

        let snap_map = match self.build_snapshot_map(&file_name, seq_num).await {
            Ok(map) => map,
            Err(err) => {
                error!(%file_name, seq_num, "build_snapshot_map error: {err}");
                self.handle_delete_snapshot_error(&task).await;
                return;
            }
        };
        task.set_progress(DEL_PROGRESS_BUILD_SNAPSHOT_MAP_DONE);

        let name = ChunkIndexDataName::new(&file_name, seq_num);
        let index_exists = match self.data_store.chunk_index_data_exist(&name).await {
            Ok(exists) => exists,
            Err(err) => {
                error!(%file_name, seq_num, "chunk_index_data_exist error: {err:#}");
                self.handle_delete_snapshot_error(&task).await;
                return;
            }
        };
        if index_exists {
            let index_data = match self.data_store.get_chunk_index_data(&name).await {
                Ok(data) => data,
                Err(err) => {
                    error!(%file_name, seq_num, "get_chunk_index_data error: {err:#}");
                    self.handle_delete_snapshot_error(&task).await;
                    return;
                }
            };
            let indexes = index_data.all_chunk_indexes();
            let total_progress =
                DEL_PROGRESS_DELETE_CHUNK_DATA_DONE - DEL_PROGRESS_DELETE_CHUNK_DATA_START;
            let progress_per_chunk = total_progress as f64 / indexes.len().max(1) as f64;
            for (index, chunk_index) in indexes.iter().enumerate() {
                let Some(chunk) = index_data.chunk_data_name(*chunk_index) else {
                    continue;
                };
                if !snap_map.contains_chunk(&chunk) {
                    let exists = match self.data_store.chunk_data_exist(&chunk).await {
                        Ok(exists) => exists,
                        Err(err) => {
                            error!(%chunk, "chunk_data_exist error: {err:#}");
                            self.handle_delete_snapshot_error(&task).await;
                            return;
                        }
                    };
                    if exists {
                        if let Err(err) = self.data_store.delete_chunk_data(&chunk).await {
                            error!(%chunk, "delete_chunk_data error: {err:#}");
                            self.handle_delete_snapshot_error(&task).await;
                            return;
                        }
                    }
                }
                task.set_progress(
                    DEL_PROGRESS_DELETE_CHUNK_DATA_START
                        + (index as f64 * progress_per_chunk) as u32,
                );
            }
            task.set_progress(DEL_PROGRESS_DELETE_CHUNK_DATA_DONE);
            if let Err(err) = self.data_store.delete_chunk_index_data(&name).await {
                error!(%file_name, seq_num, "delete_chunk_index_data error: {err:#}");
                self.handle_delete_snapshot_error(&task).await;
                return;
            }
        }

        // an interrupted creation may still hold the upstream handle
        if matches!(
            info.status,
            SnapshotStatus::ErrorDeleting | SnapshotStatus::Canceling
        ) {
            if let Err(err) = self.delete_snapshot_on_volume(&info).await {
                error!(%file_name, "delete_snapshot_on_volume error: {err}");
                self.handle_delete_snapshot_error(&task).await;
                return;
            }
        }

        task.set_progress(DEL_PROGRESS_DELETE_CHUNK_INDEX_DONE);
        if let Err(err) = self.meta_store.delete_snapshot(task.uuid()).await {
            error!(uuid = %task.uuid(), "delete_snapshot error: {err:#}");
            self.handle_delete_snapshot_error(&task).await;
            return;
        }
        task.set_progress(PROGRESS_COMPLETE);
        self.metrics.snapshots_deleted.add(1, &[]);
        task.finish();
        info!(uuid = %task.uuid(), %file_name, "delete snapshot success");
    }

    async fn handle_delete_snapshot_error(&self, task: &SnapshotTaskInfo) {
        let mut info = task.snapshot();
        info.status = SnapshotStatus::Error;
        task.set_snapshot(info.clone());
        if let Err(err) = self.meta_store.update_snapshot(&info).await {
            error!(uuid = %task.uuid(), "update_snapshot error while failing task: {err:#}");
        }
        self.metrics.snapshot_failures.add(1, &[]);
        task.finish();
        error!(uuid = %task.uuid(), "delete snapshot failed");
    }

    pub async fn get_file_snapshot_info(&self, file: &str) -> Result<Vec<SnapshotInfo>> {
        self.meta_store
            .get_snapshot_list(file)
            .await
            .map_err(SnapshotError::from)
    }

    pub async fn get_snapshot_info(&self, uuid: &SnapshotId) -> Result<Option<SnapshotInfo>> {
        self.meta_store
            .get_snapshot_info(uuid)
            .await
            .map_err(SnapshotError::from)
    }

    pub async fn get_snapshot_list(&self) -> Result<Vec<SnapshotInfo>> {
        self.meta_store
            .list_snapshots()
            .await
            .map_err(SnapshotError::from)
    }
}
