//! Client interface to the upstream volume metadata service. The engine only
//! consumes this trait; the concrete transport lives outside the crate.

use async_trait::async_trait;
use bytes::Bytes;

use crate::data_model::{ChunkIdInfo, ChunkInfoDetail, SegmentInfo, VolumeFileStatus, VolumeInfo};

#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum VolumeClientError {
    #[error("file not found")]
    NotExist,

    #[error("authentication failed")]
    AuthFail,

    #[error("volume client error: {0}")]
    Other(String),
}

/// Outcome of an upstream snapshot creation. `AlreadyInFlight` means a
/// snapshot of the volume already exists upstream (re-entry after a crash)
/// and carries its sequence; both outcomes are success for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateSnapshotAck {
    Created { seq: u64 },
    AlreadyInFlight { seq: u64 },
}

impl CreateSnapshotAck {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Created { seq } | Self::AlreadyInFlight { seq } => *seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteSnapshotAck {
    Deleted,
    NotFound,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatusCheck {
    NotFound,
    Status(VolumeFileStatus),
}

#[async_trait]
pub trait VolumeClient: Send + Sync {
    async fn get_file_info(&self, file: &str, user: &str)
        -> Result<VolumeInfo, VolumeClientError>;

    async fn create_snapshot(
        &self,
        file: &str,
        user: &str,
    ) -> Result<CreateSnapshotAck, VolumeClientError>;

    /// Attributes of the snapshot at `seq`, including chunk size, segment
    /// size, file length and creation time.
    async fn get_snapshot(
        &self,
        file: &str,
        user: &str,
        seq: u64,
    ) -> Result<VolumeInfo, VolumeClientError>;

    /// Returns `None` when the segment at `offset` was never allocated.
    async fn get_snapshot_segment_info(
        &self,
        file: &str,
        user: &str,
        seq: u64,
        offset: u64,
    ) -> Result<Option<SegmentInfo>, VolumeClientError>;

    async fn get_chunk_info(
        &self,
        chunk: &ChunkIdInfo,
    ) -> Result<ChunkInfoDetail, VolumeClientError>;

    /// Reads `len` bytes at `offset` from the snapshot version `seq` of a
    /// chunk.
    async fn read_chunk_snapshot(
        &self,
        chunk: &ChunkIdInfo,
        seq: u64,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, VolumeClientError>;

    async fn delete_snapshot(
        &self,
        file: &str,
        user: &str,
        seq: u64,
    ) -> Result<DeleteSnapshotAck, VolumeClientError>;

    async fn check_snapshot_status(
        &self,
        file: &str,
        user: &str,
        seq: u64,
    ) -> Result<SnapshotStatusCheck, VolumeClientError>;
}
