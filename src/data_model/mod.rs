pub mod test_objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    ops::Deref,
    time::{SystemTime, UNIX_EPOCH},
};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Sequence value of a snapshot whose upstream snapshot has not been created
/// yet. The upstream metadata service assigns sequences starting at 1.
pub const UNINITIALIZED_SEQ: u64 = 0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl Default for SnapshotId {
    fn default() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for SnapshotId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for SnapshotId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SnapshotStatus {
    Pending,
    Done,
    Error,
    Canceling,
    Deleting,
    ErrorDeleting,
}

/// Persistent record of one snapshot of one volume.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct SnapshotInfo {
    #[builder(default)]
    pub uuid: SnapshotId,
    pub user: String,
    pub file_name: String,
    pub snapshot_name: String,
    #[builder(default = "UNINITIALIZED_SEQ")]
    pub seq_num: u64,
    #[builder(default)]
    pub chunk_size: u64,
    #[builder(default)]
    pub segment_size: u64,
    #[builder(default)]
    pub file_length: u64,
    #[builder(default = "self.default_created_at()")]
    pub created_at: u64,
    #[builder(default = "SnapshotStatus::Pending")]
    pub status: SnapshotStatus,
}

impl SnapshotInfoBuilder {
    fn default_created_at(&self) -> u64 {
        epoch_time_ms()
    }
}

pub fn epoch_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_millis() as u64
}

/// Identity of one chunk blob in the object store. The sequence is the one at
/// which the chunk was last written, so unchanged chunks shared by several
/// snapshots of a volume resolve to the same key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkDataName {
    pub file_name: String,
    pub chunk_seq: u64,
    pub chunk_index: u64,
}

impl ChunkDataName {
    pub fn new(file_name: &str, chunk_seq: u64, chunk_index: u64) -> Self {
        Self {
            file_name: file_name.to_string(),
            chunk_seq,
            chunk_index,
        }
    }

    pub fn object_key(&self) -> String {
        format!("{}-{}-{}", self.file_name, self.chunk_index, self.chunk_seq)
    }
}

impl Display for ChunkDataName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.object_key())
    }
}

/// Identity of the chunk index blob of one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkIndexDataName {
    pub file_name: String,
    pub file_seq: u64,
}

impl ChunkIndexDataName {
    pub fn new(file_name: &str, file_seq: u64) -> Self {
        Self {
            file_name: file_name.to_string(),
            file_seq,
        }
    }

    pub fn object_key(&self) -> String {
        format!("{}-{}", self.file_name, self.file_seq)
    }
}

/// Mapping from chunk index to the sequence at which that chunk was last
/// written. Together with the owning file name this resolves every chunk of a
/// snapshot to its [`ChunkDataName`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkIndexData {
    pub file_name: String,
    chunk_map: BTreeMap<u64, u64>,
}

impl ChunkIndexData {
    pub fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            chunk_map: BTreeMap::new(),
        }
    }

    pub fn put_chunk_data_name(&mut self, name: ChunkDataName) {
        self.chunk_map.insert(name.chunk_index, name.chunk_seq);
    }

    pub fn chunk_data_name(&self, chunk_index: u64) -> Option<ChunkDataName> {
        self.chunk_map
            .get(&chunk_index)
            .map(|seq| ChunkDataName::new(&self.file_name, *seq, chunk_index))
    }

    /// Chunk indexes in ascending order.
    pub fn all_chunk_indexes(&self) -> Vec<u64> {
        self.chunk_map.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.chunk_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_map.is_empty()
    }
}

/// Union of the chunk index data of the peer snapshots of a volume. A chunk
/// referenced here is still live and must not be deleted.
#[derive(Debug, Default)]
pub struct FileSnapMap {
    pub maps: Vec<ChunkIndexData>,
}

impl FileSnapMap {
    pub fn contains_chunk(&self, name: &ChunkDataName) -> bool {
        self.maps.iter().any(|index| {
            index
                .chunk_data_name(name.chunk_index)
                .is_some_and(|candidate| candidate == *name)
        })
    }
}

/// Upstream address of one chunk replica group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct ChunkIdInfo {
    pub logical_pool_id: u32,
    pub copyset_id: u32,
    pub chunk_id: u64,
}

/// One allocated segment of a volume, as reported by the upstream metadata
/// service.
#[derive(Debug, Clone, Default)]
pub struct SegmentInfo {
    pub chunk_vec: Vec<ChunkIdInfo>,
}

/// Sequence history of one chunk relative to a snapshot sequence.
#[derive(Debug, Clone, Default)]
pub struct ChunkInfoDetail {
    pub chunk_sn: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum VolumeFileStatus {
    Created,
    Deleting,
    Cloning,
    CloneMetaInstalled,
    Cloned,
    BeingCloned,
}

/// Volume attributes returned by the upstream metadata service, for either a
/// live volume or one of its snapshots.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub file_name: String,
    pub seq_num: u64,
    pub chunk_size: u64,
    pub segment_size: u64,
    pub file_length: u64,
    pub ctime: u64,
    pub file_status: VolumeFileStatus,
}
