use crate::address::{Address, RecordKind};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("{kind} already exists at {address}")]
    AlreadyExists { kind: RecordKind, address: Address },
    #[error("{kind} not found at {address}")]
    NotFound { kind: RecordKind, address: Address },
    #[error("caller {caller} is not the owner of {address}")]
    Unauthorized { address: Address, caller: String },
    #[error("invalid time window: start {start_time} MUST be before end {end_time}")]
    InvalidTimeWindow { start_time: i64, end_time: i64 },
    #[error("poll {poll_id} already has its {candidate_count} candidates registered")]
    CandidateLimitExceeded { poll_id: u64, candidate_count: u64 },
    #[error("poll {poll_id} is closed at {now}; voting window is [{start_time}, {end_time})")]
    PollClosed { poll_id: u64, now: i64, start_time: i64, end_time: i64 },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("substrate error: {0}")]
    Substrate(String),
}

impl LedgerError {
    /// Stable machine-readable code for transports and logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists { .. } => "already_exists",
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::InvalidTimeWindow { .. } => "invalid_time_window",
            Self::CandidateLimitExceeded { .. } => "candidate_limit_exceeded",
            Self::PollClosed { .. } => "poll_closed",
            Self::InvalidKey(_) => "invalid_key",
            Self::Validation(_) => "validation",
            Self::Substrate(_) => "substrate",
        }
    }

    pub(crate) fn substrate(message: impl Into<String>) -> Self {
        Self::Substrate(message.into())
    }
}
