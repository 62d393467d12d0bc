#[cfg(test)]
pub mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::{
        data_model::{
            ChunkIdInfo, ChunkInfoDetail, SegmentInfo, SnapshotInfo, SnapshotInfoBuilder,
            SnapshotStatus, VolumeFileStatus, VolumeInfo,
        },
        snapshot::SnapshotTaskInfo,
        volume_client::{
            CreateSnapshotAck, DeleteSnapshotAck, SnapshotStatusCheck, VolumeClient,
            VolumeClientError,
        },
    };

    pub const TEST_FILE: &str = "/vol-a";
    pub const TEST_USER: &str = "user1";
    pub const TEST_CHUNK_SIZE: u64 = 64;
    pub const TEST_SEGMENT_SIZE: u64 = 128;
    pub const TEST_FILE_LENGTH: u64 = 512;
    pub const TEST_SPLIT_SIZE: u64 = 16;

    pub fn test_snapshot_info(file: &str, snapshot_name: &str) -> SnapshotInfo {
        SnapshotInfoBuilder::default()
            .user(TEST_USER.to_string())
            .file_name(file.to_string())
            .snapshot_name(snapshot_name.to_string())
            .chunk_size(TEST_CHUNK_SIZE)
            .segment_size(TEST_SEGMENT_SIZE)
            .file_length(TEST_FILE_LENGTH)
            .build()
            .unwrap()
    }

    pub fn test_snapshot_info_with(
        file: &str,
        snapshot_name: &str,
        seq_num: u64,
        status: SnapshotStatus,
    ) -> SnapshotInfo {
        let mut info = test_snapshot_info(file, snapshot_name);
        info.seq_num = seq_num;
        info.status = status;
        info
    }

    /// Every segment allocated, two chunks per segment, chunk ids
    /// `segment * 100 + slot`.
    pub fn default_segments() -> HashMap<u64, SegmentInfo> {
        (0..TEST_FILE_LENGTH / TEST_SEGMENT_SIZE)
            .map(|seg| {
                let chunk_vec = (0..TEST_SEGMENT_SIZE / TEST_CHUNK_SIZE)
                    .map(|slot| ChunkIdInfo {
                        logical_pool_id: 1,
                        copyset_id: seg as u32,
                        chunk_id: seg * 100 + slot,
                    })
                    .collect();
                (seg, SegmentInfo { chunk_vec })
            })
            .collect()
    }

    pub struct MockVolumeState {
        pub file_name: String,
        pub user: String,
        pub file_status: VolumeFileStatus,
        pub segments: HashMap<u64, SegmentInfo>,
        /// chunk id -> write-sequence history returned by `get_chunk_info`
        pub chunk_versions: HashMap<u64, Vec<u64>>,
        /// sequence handed out by the next `create_snapshot`
        pub next_seq: u64,
        /// upstream snapshot handles not yet released
        pub active_snapshots: HashSet<u64>,
    }

    pub struct MockVolumeClient {
        pub state: Mutex<MockVolumeState>,
        pub create_calls: AtomicUsize,
        pub fail_chunk_reads: AtomicBool,
        /// cancels the task the first time `get_chunk_info` runs
        pub cancel_on_chunk_info: Mutex<Option<Arc<SnapshotTaskInfo>>>,
        /// cancels the task the first time `delete_snapshot` runs, i.e. while
        /// the transfer stage releases the upstream handle
        pub cancel_on_delete_snapshot: Mutex<Option<Arc<SnapshotTaskInfo>>>,
    }

    impl MockVolumeClient {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(MockVolumeState {
                    file_name: TEST_FILE.to_string(),
                    user: TEST_USER.to_string(),
                    file_status: VolumeFileStatus::Created,
                    segments: default_segments(),
                    chunk_versions: HashMap::new(),
                    next_seq: 1,
                    active_snapshots: HashSet::new(),
                }),
                create_calls: AtomicUsize::new(0),
                fail_chunk_reads: AtomicBool::new(false),
                cancel_on_chunk_info: Mutex::new(None),
                cancel_on_delete_snapshot: Mutex::new(None),
            })
        }

        pub fn write_chunk(&self, chunk_id: u64, versions: Vec<u64>) {
            self.state
                .lock()
                .unwrap()
                .chunk_versions
                .insert(chunk_id, versions);
        }

        pub fn set_next_seq(&self, seq: u64) {
            self.state.lock().unwrap().next_seq = seq;
        }

        pub fn active_snapshots(&self) -> HashSet<u64> {
            self.state.lock().unwrap().active_snapshots.clone()
        }

        fn volume_info(&self, seq_num: u64) -> VolumeInfo {
            let state = self.state.lock().unwrap();
            VolumeInfo {
                file_name: state.file_name.clone(),
                seq_num,
                chunk_size: TEST_CHUNK_SIZE,
                segment_size: TEST_SEGMENT_SIZE,
                file_length: TEST_FILE_LENGTH,
                ctime: 1_700_000_000_000,
                file_status: state.file_status,
            }
        }
    }

    #[async_trait]
    impl VolumeClient for MockVolumeClient {
        async fn get_file_info(
            &self,
            file: &str,
            user: &str,
        ) -> Result<VolumeInfo, VolumeClientError> {
            {
                let state = self.state.lock().unwrap();
                if file != state.file_name {
                    return Err(VolumeClientError::NotExist);
                }
                if user != state.user {
                    return Err(VolumeClientError::AuthFail);
                }
            }
            Ok(self.volume_info(0))
        }

        async fn create_snapshot(
            &self,
            _file: &str,
            _user: &str,
        ) -> Result<CreateSnapshotAck, VolumeClientError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.active_snapshots.insert(seq);
            Ok(CreateSnapshotAck::Created { seq })
        }

        async fn get_snapshot(
            &self,
            _file: &str,
            _user: &str,
            seq: u64,
        ) -> Result<VolumeInfo, VolumeClientError> {
            Ok(self.volume_info(seq))
        }

        async fn get_snapshot_segment_info(
            &self,
            _file: &str,
            _user: &str,
            _seq: u64,
            offset: u64,
        ) -> Result<Option<SegmentInfo>, VolumeClientError> {
            let state = self.state.lock().unwrap();
            Ok(state.segments.get(&(offset / TEST_SEGMENT_SIZE)).cloned())
        }

        async fn get_chunk_info(
            &self,
            chunk: &ChunkIdInfo,
        ) -> Result<ChunkInfoDetail, VolumeClientError> {
            if let Some(task) = self.cancel_on_chunk_info.lock().unwrap().take() {
                task.cancel();
            }
            let state = self.state.lock().unwrap();
            Ok(ChunkInfoDetail {
                chunk_sn: state
                    .chunk_versions
                    .get(&chunk.chunk_id)
                    .cloned()
                    .unwrap_or_default(),
            })
        }

        async fn read_chunk_snapshot(
            &self,
            _chunk: &ChunkIdInfo,
            _seq: u64,
            _offset: u64,
            len: u64,
        ) -> Result<Bytes, VolumeClientError> {
            if self.fail_chunk_reads.load(Ordering::SeqCst) {
                return Err(VolumeClientError::Other("injected read failure".to_string()));
            }
            Ok(Bytes::from(vec![0xAB; len as usize]))
        }

        async fn delete_snapshot(
            &self,
            _file: &str,
            _user: &str,
            seq: u64,
        ) -> Result<DeleteSnapshotAck, VolumeClientError> {
            if let Some(task) = self.cancel_on_delete_snapshot.lock().unwrap().take() {
                task.cancel();
            }
            let mut state = self.state.lock().unwrap();
            if state.active_snapshots.remove(&seq) {
                Ok(DeleteSnapshotAck::Deleted)
            } else {
                Ok(DeleteSnapshotAck::NotFound)
            }
        }

        async fn check_snapshot_status(
            &self,
            _file: &str,
            _user: &str,
            seq: u64,
        ) -> Result<SnapshotStatusCheck, VolumeClientError> {
            let state = self.state.lock().unwrap();
            if state.active_snapshots.contains(&seq) {
                Ok(SnapshotStatusCheck::Status(VolumeFileStatus::Created))
            } else {
                Ok(SnapshotStatusCheck::NotFound)
            }
        }
    }
}
