use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    common::snapshot_ref::SnapshotRefCounter,
    config::SnapshotServerConfig,
    data_model::{SnapshotId, SnapshotInfo, SnapshotStatus},
    data_store::SnapshotDataStore,
    error::{Result, SnapshotError},
    meta_store::{InMemoryMetaStore, MetaStore},
    snapshot::{SnapshotCore, SnapshotTaskInfo},
    task::WorkerPool,
    volume_client::VolumeClient,
};

type TaskRegistry = Arc<Mutex<HashMap<SnapshotId, Arc<SnapshotTaskInfo>>>>;

/// Entry point of the snapshot engine. Owns the collaborators, runs the
/// precondition checks, enqueues the pipelines onto the worker pool and keeps
/// the registry of running and recently finished tasks.
pub struct Service {
    pub config: SnapshotServerConfig,
    pub core: Arc<SnapshotCore>,
    pub meta_store: Arc<dyn MetaStore>,
    pub data_store: SnapshotDataStore,
    pub snapshot_ref: Arc<SnapshotRefCounter>,
    pool: Arc<WorkerPool>,
    tasks: TaskRegistry,
    shutdown_tx: watch::Sender<()>,
    shutdown_rx: watch::Receiver<()>,
}

impl Service {
    pub fn new(
        config: SnapshotServerConfig,
        volume_client: Arc<dyn VolumeClient>,
    ) -> anyhow::Result<Self> {
        let meta_store: Arc<dyn MetaStore> = Arc::new(InMemoryMetaStore::new());
        Self::with_meta_store(config, volume_client, meta_store)
    }

    /// Builds the service around an externally provided metadata store.
    pub fn with_meta_store(
        config: SnapshotServerConfig,
        volume_client: Arc<dyn VolumeClient>,
        meta_store: Arc<dyn MetaStore>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let data_store = SnapshotDataStore::new(config.data_store.clone())
            .context("error initializing SnapshotDataStore")?;
        // Pipelines and chunk-transfer subtasks run on separate pools: a
        // pipeline blocks in `wait_some` while its uploads drain, so sharing
        // one pool could leave no worker for the uploads it waits on.
        let pool = WorkerPool::new(config.snapshot.core_pool_size);
        let transfer_pool = WorkerPool::new(config.snapshot.core_pool_size);
        let snapshot_ref = Arc::new(SnapshotRefCounter::default());
        let core = Arc::new(SnapshotCore::new(
            volume_client,
            meta_store.clone(),
            data_store.clone(),
            snapshot_ref.clone(),
            transfer_pool,
            config.snapshot.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        Ok(Self {
            config,
            core,
            meta_store,
            data_store,
            snapshot_ref,
            pool,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Re-enqueues interrupted tasks from the metadata store and starts the
    /// background retirement loop.
    pub async fn start(&self) -> Result<()> {
        self.recover_tasks().await?;

        let tasks = self.tasks.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let retire_interval = Duration::from_millis(self.config.snapshot.task_retire_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(retire_interval) => {
                        let retired = {
                            let mut tasks = tasks.lock().unwrap();
                            let before = tasks.len();
                            tasks.retain(|_, task| !task.is_finished());
                            before - tasks.len()
                        };
                        if retired > 0 {
                            debug!(retired, "retired finished snapshot tasks");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("task retirement loop shutting down");
                        break;
                    }
                }
            }
        });
        info!("snapshot service started");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.pool.shutdown();
        self.core.pool.shutdown();
    }

    /// Validates and enqueues a snapshot creation. Returns the uuid of the
    /// new snapshot; completion is observed through the task record.
    pub async fn create_snapshot(
        &self,
        file: &str,
        user: &str,
        snapshot_name: &str,
    ) -> Result<SnapshotId> {
        let info = self.core.create_snapshot_pre(file, user, snapshot_name).await?;
        let uuid = info.uuid.clone();
        let task = self.register_task(info)?;
        let core = self.core.clone();
        let pipeline_task = task.clone();
        self.pool
            .submit(async move { core.handle_create_snapshot_task(pipeline_task).await })
            .map_err(SnapshotError::from)?;
        info!(uuid = %uuid, file, snapshot_name, "snapshot creation enqueued");
        Ok(uuid)
    }

    /// Validates and enqueues a snapshot deletion. Deleting a snapshot that
    /// does not exist is success.
    pub async fn delete_snapshot(
        &self,
        uuid: &SnapshotId,
        user: &str,
        file: &str,
    ) -> Result<()> {
        let Some(info) = self.core.delete_snapshot_pre(uuid, user, file).await? else {
            return Ok(());
        };
        let task = self.register_task(info)?;
        let core = self.core.clone();
        let pipeline_task = task.clone();
        self.pool
            .submit(async move { core.handle_delete_snapshot_task(pipeline_task).await })
            .map_err(SnapshotError::from)?;
        info!(uuid = %uuid, file, "snapshot deletion enqueued");
        Ok(())
    }

    /// Requests cooperative cancellation of a running creation. The pipeline
    /// observes the flag at its next cancellation point and unwinds.
    pub async fn cancel_snapshot(&self, uuid: &SnapshotId, user: &str, file: &str) -> Result<()> {
        let Some(task) = self.get_task(uuid) else {
            return Err(SnapshotError::CannotCancelFinished);
        };
        let info = task.snapshot();
        if info.user != user {
            return Err(SnapshotError::InvalidUser);
        }
        if info.file_name != file {
            return Err(SnapshotError::FileNameNotMatch);
        }
        // taken under the task lock so that a task in its final transition
        // cannot be canceled after `done` was persisted
        let _guard = task.lock().await;
        if task.is_finished() {
            return Err(SnapshotError::CannotCancelFinished);
        }
        task.cancel();
        // persist `canceling` so a crash before the rollback finishes is
        // recovered through the delete pipeline
        let mut info = task.snapshot();
        if matches!(info.status, SnapshotStatus::Pending) {
            info.status = SnapshotStatus::Canceling;
            task.set_snapshot(info.clone());
            if let Err(err) = self.meta_store.update_snapshot(&info).await {
                warn!(uuid = %uuid, "failed to persist canceling status: {err:#}");
            }
        }
        info!(uuid = %uuid, "snapshot cancel requested");
        Ok(())
    }

    pub fn get_task(&self, uuid: &SnapshotId) -> Option<Arc<SnapshotTaskInfo>> {
        self.tasks.lock().unwrap().get(uuid).cloned()
    }

    pub fn get_snapshot_progress(&self, uuid: &SnapshotId) -> Option<u32> {
        self.get_task(uuid).map(|task| task.progress())
    }

    pub async fn get_file_snapshot_info(&self, file: &str) -> Result<Vec<SnapshotInfo>> {
        self.core.get_file_snapshot_info(file).await
    }

    pub async fn get_snapshot_info(&self, uuid: &SnapshotId) -> Result<Option<SnapshotInfo>> {
        self.core.get_snapshot_info(uuid).await
    }

    pub async fn get_snapshot_list(&self) -> Result<Vec<SnapshotInfo>> {
        self.core.get_snapshot_list().await
    }

    /// Scans the metadata store for tasks interrupted by a restart and
    /// re-enqueues them: pending creations resume from the chunk index
    /// checkpoint, deletions restart from scratch.
    pub async fn recover_tasks(&self) -> Result<()> {
        let snapshots = self.core.get_snapshot_list().await?;
        for info in snapshots {
            match info.status {
                SnapshotStatus::Pending => {
                    let uuid = info.uuid.clone();
                    let task = self.register_task(info)?;
                    let core = self.core.clone();
                    let pipeline_task = task.clone();
                    self.pool
                        .submit(async move { core.handle_create_snapshot_task(pipeline_task).await })
                        .map_err(SnapshotError::from)?;
                    info!(uuid = %uuid, "recovered pending snapshot creation");
                }
                SnapshotStatus::Deleting
                | SnapshotStatus::ErrorDeleting
                | SnapshotStatus::Canceling => {
                    let uuid = info.uuid.clone();
                    let task = self.register_task(info)?;
                    let core = self.core.clone();
                    let pipeline_task = task.clone();
                    self.pool
                        .submit(async move { core.handle_delete_snapshot_task(pipeline_task).await })
                        .map_err(SnapshotError::from)?;
                    info!(uuid = %uuid, "recovered interrupted snapshot deletion");
                }
                SnapshotStatus::Done | SnapshotStatus::Error => {}
            }
        }
        Ok(())
    }

    /// Drops finished task records. Running tasks stay.
    pub fn retire_finished_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap();
        let before = tasks.len();
        tasks.retain(|_, task| !task.is_finished());
        before - tasks.len()
    }

    // At most one active task may reference a snapshot; a second registration
    // for the same uuid is rejected until the first finishes.
    fn register_task(&self, info: SnapshotInfo) -> Result<Arc<SnapshotTaskInfo>> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(existing) = tasks.get(&info.uuid) {
            if !existing.is_finished() {
                error!(uuid = %info.uuid, "a task for this snapshot is already running");
                return Err(SnapshotError::TaskExist);
            }
        }
        let task = SnapshotTaskInfo::new(info);
        tasks.insert(task.uuid().clone(), task.clone());
        Ok(task)
    }
}
