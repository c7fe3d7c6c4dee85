use thiserror::Error;

/// Refusals reported to the caller of a daemon operation. Decoding and other internal failures
///  use `anyhow` and never reach the caller.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DtpcError {
    #[error("topic {0} is not defined and on-the-fly topics are disabled")]
    UnknownTopic(u32),

    #[error("transmission profile {0} is not defined")]
    UnknownProfile(u32),

    #[error("topic {0} already has an active registration")]
    TopicBusy(u32),

    #[error("only a registered client may send data items for topic {0}")]
    NotRegistered(u32),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid transmission profile: {0}")]
    InvalidProfile(String),

    #[error("DTPC daemon request queue is full")]
    QueueFull,

    #[error("DTPC daemon is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DtpcError {
    /// Numeric result code as reported through the application interface
    pub fn code(&self) -> i32 {
        match self {
            DtpcError::UnknownTopic(_) => -1,
            DtpcError::UnknownProfile(_) => -1,
            DtpcError::NotRegistered(_) => -1,
            DtpcError::NotFound(_) => -1,
            DtpcError::AlreadyExists(_) => -1,
            DtpcError::InvalidProfile(_) => -1,
            DtpcError::Internal(_) => -2,
            DtpcError::QueueFull => -2,
            DtpcError::ShuttingDown => -2,
            DtpcError::TopicBusy(_) => -3,
        }
    }
}

impl From<anyhow::Error> for DtpcError {
    fn from(value: anyhow::Error) -> Self {
        DtpcError::Internal(value.to_string())
    }
}

pub type DtpcResult<T> = Result<T, DtpcError>;
