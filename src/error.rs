//! Error codes surfaced by the snapshot engine.
//!
//! Precondition checks return these synchronously. Pipeline stages never
//! return them to callers; a failed pipeline persists `SnapshotStatus::Error`
//! and signals the task instead.

pub type Result<T, E = SnapshotError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SnapshotError {
    #[error("volume does not exist")]
    FileNotExist,

    #[error("user does not own the volume or snapshot")]
    InvalidUser,

    #[error("snapshot does not belong to the given volume")]
    FileNameNotMatch,

    #[error("volume status does not allow taking a snapshot")]
    FileStatusInvalid,

    #[error("snapshot count reached the configured limit")]
    SnapshotCountReachLimit,

    #[error("cannot create a snapshot while another snapshot of the volume is in error")]
    SnapshotCannotCreateWhenError,

    #[error("cannot delete a snapshot that is still being created")]
    SnapshotCannotDeleteUnfinished,

    #[error("cannot delete a snapshot that is being read by a clone")]
    SnapshotCannotDeleteCloning,

    #[error("a task for this snapshot already exists")]
    TaskExist,

    #[error("cannot cancel a finished snapshot task")]
    CannotCancelFinished,

    #[error("chunk size is not aligned to the configured split size")]
    ChunkSizeNotAligned,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SnapshotError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<anyhow::Error> for SnapshotError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}
