use serde::{Deserialize, Serialize};

use crate::address::{Address, RecordKind};
use crate::auth::Principal;
use crate::error::LedgerError;

pub const MAX_TASK_DESCRIPTION_LEN: usize = 256;
pub const MAX_POLL_DESCRIPTION_LEN: usize = 280;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskRecord {
    pub owner: Principal,
    pub title: String,
    pub description: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Poll {
    pub poll_id: u64,
    pub description: String,
    /// Unix milliseconds, inclusive.
    pub start_time: i64,
    /// Unix milliseconds, exclusive.
    pub end_time: i64,
    pub candidate_count: u64,
    #[serde(default)]
    pub registered_candidates: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Pending,
    Open,
    Closed,
}

impl Poll {
    #[must_use]
    pub fn status_at(&self, now: i64) -> PollStatus {
        if now < self.start_time {
            PollStatus::Pending
        } else if now < self.end_time {
            PollStatus::Open
        } else {
            PollStatus::Closed
        }
    }

    #[must_use]
    pub fn accepts_votes_at(&self, now: i64) -> bool {
        self.status_at(now) == PollStatus::Open
    }

    #[must_use]
    pub fn has_candidate_capacity(&self) -> bool {
        self.registered_candidates < self.candidate_count
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub poll_id: u64,
    pub vote_count: u64,
}

/// Everything the substrate stores, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum LedgerRecord {
    Task(TaskRecord),
    Poll(Poll),
    Candidate(Candidate),
}

impl LedgerRecord {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Task(_) => RecordKind::Task,
            Self::Poll(_) => RecordKind::Poll,
            Self::Candidate(_) => RecordKind::Candidate,
        }
    }

    /// # Errors
    /// Returns [`LedgerError::Substrate`] when a different kind is stored at `address`.
    pub fn into_task(self, address: &Address) -> Result<TaskRecord, LedgerError> {
        match self {
            Self::Task(task) => Ok(task),
            other => Err(kind_mismatch(address, RecordKind::Task, other.kind())),
        }
    }

    /// # Errors
    /// Returns [`LedgerError::Substrate`] when a different kind is stored at `address`.
    pub fn into_poll(self, address: &Address) -> Result<Poll, LedgerError> {
        match self {
            Self::Poll(poll) => Ok(poll),
            other => Err(kind_mismatch(address, RecordKind::Poll, other.kind())),
        }
    }

    /// # Errors
    /// Returns [`LedgerError::Substrate`] when a different kind is stored at `address`.
    pub fn into_candidate(self, address: &Address) -> Result<Candidate, LedgerError> {
        match self {
            Self::Candidate(candidate) => Ok(candidate),
            other => Err(kind_mismatch(address, RecordKind::Candidate, other.kind())),
        }
    }
}

fn kind_mismatch(address: &Address, expected: RecordKind, found: RecordKind) -> LedgerError {
    LedgerError::substrate(format!("expected {expected} at {address}, found {found}"))
}

/// A record together with the address it is stored under.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Addressed<T> {
    pub address: Address,
    #[serde(flatten)]
    pub record: T,
}

impl<T> Addressed<T> {
    #[must_use]
    pub fn new(address: Address, record: T) -> Self {
        Self { address, record }
    }
}

/// Arguments for creating a poll.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewPoll {
    pub poll_id: u64,
    pub description: String,
    pub start_time: i64,
    pub end_time: i64,
    pub candidate_count: u64,
}

impl NewPoll {
    /// # Errors
    /// Returns [`LedgerError::InvalidTimeWindow`] when `start_time >= end_time`, or
    /// [`LedgerError::Validation`] for an over-long description.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.start_time >= self.end_time {
            return Err(LedgerError::InvalidTimeWindow {
                start_time: self.start_time,
                end_time: self.end_time,
            });
        }
        check_max_len("poll description", &self.description, MAX_POLL_DESCRIPTION_LEN)
    }

    #[must_use]
    pub fn into_poll(self) -> Poll {
        Poll {
            poll_id: self.poll_id,
            description: self.description,
            start_time: self.start_time,
            end_time: self.end_time,
            candidate_count: self.candidate_count,
            registered_candidates: 0,
        }
    }
}

pub(crate) fn check_max_len(field: &str, value: &str, max: usize) -> Result<(), LedgerError> {
    if value.len() > max {
        return Err(LedgerError::Validation(format!(
            "{field} MUST be at most {max} bytes, got {}",
            value.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::poll_address;

    fn fixture_poll() -> Poll {
        NewPoll {
            poll_id: 1,
            description: "Test Poll".to_string(),
            start_time: 1_000,
            end_time: 2_000,
            candidate_count: 2,
        }
        .into_poll()
    }

    #[test]
    fn poll_status_follows_half_open_window() {
        let poll = fixture_poll();
        assert_eq!(poll.status_at(999), PollStatus::Pending);
        assert_eq!(poll.status_at(1_000), PollStatus::Open);
        assert_eq!(poll.status_at(1_999), PollStatus::Open);
        assert_eq!(poll.status_at(2_000), PollStatus::Closed);
        assert!(!poll.accepts_votes_at(2_000));
    }

    #[test]
    fn new_poll_rejects_inverted_or_empty_window() {
        let mut request = NewPoll {
            poll_id: 1,
            description: "Test Poll".to_string(),
            start_time: 5,
            end_time: 5,
            candidate_count: 2,
        };
        assert_eq!(
            request.validate(),
            Err(LedgerError::InvalidTimeWindow { start_time: 5, end_time: 5 })
        );
        request.end_time = 4;
        assert!(matches!(request.validate(), Err(LedgerError::InvalidTimeWindow { .. })));
        request.end_time = 6;
        assert_eq!(request.validate(), Ok(()));
    }

    #[test]
    fn record_kind_mismatch_is_reported() {
        let address = poll_address(1);
        let record = LedgerRecord::Poll(fixture_poll());
        assert!(matches!(record.clone().into_task(&address), Err(LedgerError::Substrate(_))));
        assert_eq!(record.into_poll(&address), Ok(fixture_poll()));
    }

    #[test]
    fn ledger_record_serializes_with_kind_tag() {
        let value = match serde_json::to_value(LedgerRecord::Poll(fixture_poll())) {
            Ok(value) => value,
            Err(err) => panic!("record should serialize: {err}"),
        };
        assert_eq!(value.get("kind").and_then(serde_json::Value::as_str), Some("poll"));
        assert_eq!(
            value
                .get("record")
                .and_then(|record| record.get("description"))
                .and_then(serde_json::Value::as_str),
            Some("Test Poll")
        );
    }

    #[test]
    fn addressed_flattens_record_fields() {
        let addressed = Addressed::new(poll_address(1), fixture_poll());
        let value = match serde_json::to_value(&addressed) {
            Ok(value) => value,
            Err(err) => panic!("addressed record should serialize: {err}"),
        };
        assert_eq!(
            value.get("address").and_then(serde_json::Value::as_str),
            Some(poll_address(1).to_hex().as_str())
        );
        assert_eq!(value.get("poll_id").and_then(serde_json::Value::as_u64), Some(1));
    }
}
