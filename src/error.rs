use {thiserror::Error, tokio::task::JoinError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    AlreadyExists,
    #[error("key was modified since the expected version")]
    VersionConflict,
    #[error("lock operation aborted")]
    AcquisitionAborted,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("watch history no longer covers the requested version, store is at least at {0}")]
    ResyncRequired(u64),
    #[error("watch stream ended")]
    WatchEnded,
    #[error("unexpected response from the store: {0}")]
    UnexpectedResponse(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("renewal task failed: {0}")]
    RenewalTask(#[from] JoinError),
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
}

impl Error {
    ///
    /// Returns true if the error is one of the three precondition outcomes a conditional
    /// operation can produce, as opposed to a transport or usage error.
    ///
    pub fn is_precondition_failure(&self) -> bool {
        matches!(
            self,
            Error::NotFound | Error::AlreadyExists | Error::VersionConflict
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
