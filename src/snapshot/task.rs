use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};

use tokio::sync::watch;

use crate::data_model::{SnapshotId, SnapshotInfo};

/// Shared record of one running snapshot task. The pipeline mutates it; the
/// outer layer polls progress, requests cancellation and waits for the
/// completion signal.
pub struct SnapshotTaskInfo {
    uuid: SnapshotId,
    file_name: String,
    snapshot: Mutex<SnapshotInfo>,
    progress: AtomicU32,
    canceled: AtomicBool,
    finished: watch::Sender<bool>,
    // serializes cancellation against the final status transition
    lock: tokio::sync::Mutex<()>,
}

impl SnapshotTaskInfo {
    pub fn new(info: SnapshotInfo) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            uuid: info.uuid.clone(),
            file_name: info.file_name.clone(),
            snapshot: Mutex::new(info),
            progress: AtomicU32::new(0),
            canceled: AtomicBool::new(false),
            finished,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn uuid(&self) -> &SnapshotId {
        &self.uuid
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn snapshot(&self) -> SnapshotInfo {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn set_snapshot(&self, info: SnapshotInfo) {
        *self.snapshot.lock().unwrap() = info;
    }

    pub fn progress(&self) -> u32 {
        self.progress.load(Ordering::Acquire)
    }

    /// Progress never regresses; a stage re-entered after a crash reports the
    /// maximum value seen so far.
    pub fn set_progress(&self, progress: u32) {
        self.progress.fetch_max(progress.min(100), Ordering::AcqRel);
    }

    /// Once set, the flag stays set.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Signals completion. Only the first call transitions the signal.
    pub fn finish(&self) {
        self.finished.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Lock held across cancellation-sensitive critical sections.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::SnapshotInfoBuilder;

    fn task() -> Arc<SnapshotTaskInfo> {
        SnapshotTaskInfo::new(
            SnapshotInfoBuilder::default()
                .user("user1".to_string())
                .file_name("/vol".to_string())
                .snapshot_name("snap1".to_string())
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_progress_is_monotone() {
        let task = task();
        task.set_progress(40);
        task.set_progress(10);
        assert_eq!(task.progress(), 40);
        task.set_progress(250);
        assert_eq!(task.progress(), 100);
    }

    #[test]
    fn test_cancel_is_sticky() {
        let task = task();
        assert!(!task.is_canceled());
        task.cancel();
        task.cancel();
        assert!(task.is_canceled());
    }

    #[tokio::test]
    async fn test_finish_signals_waiters_once() {
        let task = task();
        let waiter = {
            let task = task.clone();
            tokio::spawn(async move { task.wait_finished().await })
        };
        task.finish();
        task.finish();
        waiter.await.unwrap();
        assert!(task.is_finished());
        // waiting after completion returns immediately
        task.wait_finished().await;
    }
}
