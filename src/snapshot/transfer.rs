//! Chunk index construction and parallel chunk upload for the create
//! pipeline.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use tracing::{error, info};

use crate::{
    data_model::{ChunkDataName, ChunkIdInfo, ChunkIndexData, SegmentInfo, SnapshotInfo},
    data_store::SnapshotDataStore,
    error::{Result, SnapshotError},
    snapshot::{
        core::{PROGRESS_TRANSFER_DONE, PROGRESS_TRANSFER_START},
        task::SnapshotTaskInfo,
        SnapshotCore,
    },
    task::TaskTracker,
    volume_client::VolumeClient,
};

impl SnapshotCore {
    /// Walks every allocated segment of the snapshot and resolves each chunk
    /// to the sequence at which it was last written before the snapshot.
    /// Chunks first written after the snapshot, and chunks never written, are
    /// left out of the index.
    pub(crate) async fn build_chunk_index_data(
        &self,
        info: &SnapshotInfo,
        task: &SnapshotTaskInfo,
    ) -> Result<(ChunkIndexData, HashMap<u64, SegmentInfo>)> {
        let seq_num = info.seq_num;
        let chunk_per_segment = info.segment_size / info.chunk_size;

        let mut index_data = ChunkIndexData::new(&info.file_name);
        let mut seg_infos = HashMap::new();
        for seg in 0..info.file_length / info.segment_size {
            let offset = seg * info.segment_size;
            let segment = self
                .client
                .get_snapshot_segment_info(&info.file_name, &info.user, seq_num, offset)
                .await
                .map_err(|err| {
                    error!(
                        file_name = %info.file_name,
                        seq_num,
                        offset,
                        "get_snapshot_segment_info error: {err}"
                    );
                    SnapshotError::internal(err.to_string())
                })?;
            let Some(segment) = segment else {
                // never allocated
                continue;
            };
            for (slot, chunk_id) in segment.chunk_vec.iter().enumerate() {
                let chunk_info = self.client.get_chunk_info(chunk_id).await.map_err(|err| {
                    error!(
                        chunk_id = chunk_id.chunk_id,
                        "get_chunk_info error: {err}"
                    );
                    SnapshotError::internal(err.to_string())
                })?;
                let chunk_index = seg * chunk_per_segment + slot as u64;
                // Two sequences: the smaller one is the snapshot version, the
                // larger a write made after the snapshot. One sequence at most
                // `seq_num`: the snapshot version, unwritten since. One
                // sequence above `seq_num`: first written after the snapshot.
                // No sequence: never written.
                match chunk_info.chunk_sn.len() {
                    2 => {
                        let seq = chunk_info.chunk_sn[0].min(chunk_info.chunk_sn[1]);
                        index_data.put_chunk_data_name(ChunkDataName::new(
                            &info.file_name,
                            seq,
                            chunk_index,
                        ));
                    }
                    1 => {
                        let seq = chunk_info.chunk_sn[0];
                        if seq <= seq_num {
                            index_data.put_chunk_data_name(ChunkDataName::new(
                                &info.file_name,
                                seq,
                                chunk_index,
                            ));
                        }
                    }
                    0 => {}
                    invalid => {
                        error!(
                            chunk_id = chunk_id.chunk_id,
                            count = invalid,
                            "get_chunk_info returned an invalid sequence count"
                        );
                        return Err(SnapshotError::internal(
                            "invalid chunk sequence count".to_string(),
                        ));
                    }
                }
                if task.is_canceled() {
                    return Ok((index_data, seg_infos));
                }
            }
            seg_infos.insert(seg, segment);
        }
        Ok((index_data, seg_infos))
    }

    /// Re-reads the segment layout of an existing snapshot (recovery path,
    /// where the chunk index data is already persisted).
    pub(crate) async fn build_segment_info(
        &self,
        info: &SnapshotInfo,
    ) -> Result<HashMap<u64, SegmentInfo>> {
        let mut seg_infos = HashMap::new();
        for seg in 0..info.file_length / info.segment_size {
            let offset = seg * info.segment_size;
            let segment = self
                .client
                .get_snapshot_segment_info(&info.file_name, &info.user, info.seq_num, offset)
                .await
                .map_err(|err| {
                    error!(
                        file_name = %info.file_name,
                        seq_num = info.seq_num,
                        offset,
                        "get_snapshot_segment_info error: {err}"
                    );
                    SnapshotError::internal(err.to_string())
                })?;
            if let Some(segment) = segment {
                seg_infos.insert(seg, segment);
            }
        }
        Ok(seg_infos)
    }

    /// Uploads every chunk of the index that is not already referenced by a
    /// peer snapshot, with at most `core_pool_size` uploads in flight, then
    /// releases the upstream snapshot handle.
    pub(crate) async fn transfer_snapshot_data(
        &self,
        index_data: &ChunkIndexData,
        info: &SnapshotInfo,
        seg_infos: &HashMap<u64, SegmentInfo>,
        filter: impl Fn(&ChunkDataName) -> bool,
        task: &SnapshotTaskInfo,
    ) -> Result<()> {
        let chunk_split_size = self.config.chunk_split_size;
        if chunk_split_size == 0 || info.chunk_size % chunk_split_size != 0 {
            error!(
                chunk_size = info.chunk_size,
                chunk_split_size, "chunk size is not aligned to the split size"
            );
            return Err(SnapshotError::ChunkSizeNotAligned);
        }
        let chunk_per_segment = info.segment_size / info.chunk_size;

        let indexes = index_data.all_chunk_indexes();
        // the whole index must be consistent with the segment layout before
        // any upload starts
        for chunk_index in &indexes {
            let seg = chunk_index / chunk_per_segment;
            let slot = (chunk_index % chunk_per_segment) as usize;
            let Some(segment) = seg_infos.get(&seg) else {
                error!(
                    chunk_index,
                    seg, "chunk index data does not match the segment layout"
                );
                return Err(SnapshotError::internal(
                    "chunk index data does not match segment info".to_string(),
                ));
            };
            if slot >= segment.chunk_vec.len() {
                error!(
                    chunk_index,
                    slot,
                    chunks = segment.chunk_vec.len(),
                    "chunk slot is out of range for its segment"
                );
                return Err(SnapshotError::internal(
                    "chunk slot out of segment range".to_string(),
                ));
            }
        }

        let total_progress = PROGRESS_TRANSFER_DONE - PROGRESS_TRANSFER_START;
        let progress_per_chunk = total_progress as f64 / indexes.len().max(1) as f64;

        let tracker = TaskTracker::new();
        for (index, chunk_index) in indexes.iter().enumerate() {
            let Some(chunk) = index_data.chunk_data_name(*chunk_index) else {
                continue;
            };
            let seg = chunk_index / chunk_per_segment;
            let slot = (chunk_index % chunk_per_segment) as usize;
            if let Some(segment) = seg_infos.get(&seg) {
                if !filter(&chunk) {
                    let transfer = TransferChunkTask {
                        chunk,
                        chunk_id: segment.chunk_vec[slot],
                        chunk_size: info.chunk_size,
                        split_size: chunk_split_size,
                        client: self.client.clone(),
                        data_store: self.data_store.clone(),
                    };
                    tracker
                        .spawn(&self.pool, transfer.run())
                        .map_err(SnapshotError::from)?;
                }
            }
            if tracker.outstanding() >= self.config.core_pool_size {
                tracker.wait_some(1).await;
            }
            if let Some(err) = tracker.result() {
                error!("chunk transfer subtask failed: {err}");
                return Err(err);
            }
            task.set_progress(
                PROGRESS_TRANSFER_START + (index as f64 * progress_per_chunk) as u32,
            );
            if task.is_canceled() {
                return Ok(());
            }
        }
        tracker.wait().await;
        if let Some(err) = tracker.result() {
            error!("chunk transfer subtask failed: {err}");
            return Err(err);
        }

        // every chunk is safe in the object store, release the upstream handle
        self.delete_snapshot_on_volume(info).await?;
        info!(
            file_name = %info.file_name,
            seq_num = info.seq_num,
            chunks = indexes.len(),
            "snapshot data transfer complete"
        );
        Ok(())
    }
}

/// Uploads one chunk by reading it from the upstream in `split_size` pieces
/// and streaming them into the object store. Either the whole chunk lands in
/// the store or a non-success result is returned; the key is deterministic,
/// so a repeated upload overwrites whatever a failed one left behind.
struct TransferChunkTask {
    chunk: ChunkDataName,
    chunk_id: ChunkIdInfo,
    chunk_size: u64,
    split_size: u64,
    client: Arc<dyn VolumeClient>,
    data_store: SnapshotDataStore,
}

impl TransferChunkTask {
    async fn run(self) -> Result<(), SnapshotError> {
        let pieces = self.chunk_size / self.split_size;
        let client = self.client.clone();
        let chunk_id = self.chunk_id;
        let seq = self.chunk.chunk_seq;
        let split_size = self.split_size;
        let stream = futures::stream::try_unfold(0u64, move |piece| {
            let client = client.clone();
            async move {
                if piece >= pieces {
                    return Ok(None);
                }
                let data: Bytes = client
                    .read_chunk_snapshot(&chunk_id, seq, piece * split_size, split_size)
                    .await
                    .map_err(|err| anyhow::anyhow!("read chunk piece failed: {err}"))?;
                Ok(Some((data, piece + 1)))
            }
        });
        self.data_store
            .put_chunk_data(&self.chunk, Box::pin(stream))
            .await
            .map_err(|err| {
                error!(chunk = %self.chunk, "chunk upload failed: {err:#}");
                SnapshotError::internal(format!("chunk upload failed: {err:#}"))
            })?;
        Ok(())
    }
}
