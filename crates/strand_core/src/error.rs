//! The control-plane error taxonomy.
//!
//! Roles match on these variants to decide between a clean restart of their
//! supervision loop and a fatal re-recruit, so the set is closed and every
//! variant has a stable meaning.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("worker removed")]
    WorkerRemoved,
    #[error("broken promise")]
    BrokenPromise,
    #[error("actor cancelled")]
    ActorCancelled,
    #[error("please reboot")]
    PleaseReboot,
    #[error("move keys lock conflict")]
    MoveKeysConflict,
    #[error("data move cancelled")]
    DataMoveCancelled,
    #[error("data move destination team not found")]
    DataMoveDestTeamNotFound,
    #[error("storage snapshot failed")]
    SnapStorageFailed,
    #[error("transaction log snapshot failed")]
    SnapTlogFailed,
    #[error("coordinator snapshot failed")]
    SnapCoordFailed,
    #[error("disabling transaction log popping failed")]
    SnapDisableTlogPopFailed,
    #[error("re-enabling transaction log popping failed")]
    SnapEnableTlogPopFailed,
    #[error("snapshot during recovery is unsupported")]
    SnapWithRecoveryUnsupported,
    #[error("operation failed")]
    OperationFailed,
    #[error("timed out")]
    TimedOut,
    #[error("operation cancelled")]
    OperationCancelled,

    /// The transaction read version is no longer valid; retryable.
    #[error("transaction too old")]
    TransactionTooOld,
    /// The commit raced another writer; retryable.
    #[error("not committed")]
    NotCommitted,
    /// A range read reported truncation where the caller required the whole
    /// table.
    #[error("range result truncated")]
    RangeTruncated,

    #[error("codec error: {0}")]
    Codec(String),
    #[error("storage error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors the transaction retry loop absorbs with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransactionTooOld | Error::NotCommitted)
    }

    /// The error set the shard-moving pipeline is expected to die with
    /// during an ordinary reconfiguration. These tear the pipeline down and
    /// send the supervisor back to lock acquisition.
    pub fn is_normal_queue_error(&self) -> bool {
        matches!(
            self,
            Error::MoveKeysConflict
                | Error::BrokenPromise
                | Error::DataMoveCancelled
                | Error::DataMoveDestTeamNotFound
        )
    }

    /// The error set the distributor role exits cleanly with. Anything
    /// outside this set propagates and causes the process role to
    /// re-recruit.
    pub fn is_normal_distributor_error(&self) -> bool {
        self.is_normal_queue_error()
            || matches!(
                self,
                Error::WorkerRemoved | Error::ActorCancelled | Error::PleaseReboot
            )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<fjall::Error> for Error {
    fn from(err: fjall::Error) -> Self {
        Error::Io(err.to_string())
    }
}
