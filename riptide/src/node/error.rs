use riptide_lib::core::store::StoreError;
use thiserror::Error;

/// Protocol-level error codes surfaced at the endpoint API boundary.
///
/// Outcomes that are not failures (a written event, a pause, a rollback
/// verdict) live in return types instead.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DcpError {
    #[error("Connection is being torn down")]
    Disconnect,
    #[error("Vbucket is not hosted here")]
    NotMyVbucket,
    #[error("A stream already exists for this vbucket")]
    KeyExists,
    #[error("No stream exists for this vbucket")]
    KeyEnoent,
    #[error("Invalid message")]
    Invalid,
    #[error("Temporary failure, retry later")]
    TmpFail,
    #[error("Allocation failed")]
    OutOfMemory,
    #[error("Operation is not supported")]
    NotSupported,
}

pub type DcpResult<T> = Result<T, DcpError>;

impl From<StoreError> for DcpError {
    fn from(error: StoreError) -> DcpError {
        match error {
            StoreError::NotMyVbucket => DcpError::NotMyVbucket,
            StoreError::TmpFail => DcpError::TmpFail,
            StoreError::OutOfMemory => DcpError::OutOfMemory,
        }
    }
}
