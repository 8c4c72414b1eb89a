//! Record identity, authorization and tally rules for the ledger kernel.
//!
//! The kernel does not own storage. Services run every state transition as one
//! [`Substrate::transact`] call and rely on the substrate for atomicity; see
//! [`substrate`] for the contract an adapter must honour.

pub mod address;
pub mod auth;
pub mod clock;
mod error;
pub mod model;
pub mod poll;
pub mod substrate;
pub mod todo;

pub use address::{
    candidate_address, derive, poll_address, task_address, Address, RecordKind, ADDRESS_LEN,
    MAX_KEY_PART_LEN,
};
pub use auth::{authorize, Principal};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::LedgerError;
pub use model::{
    Addressed, Candidate, LedgerRecord, NewPoll, Poll, PollStatus, TaskRecord,
    MAX_POLL_DESCRIPTION_LEN, MAX_TASK_DESCRIPTION_LEN,
};
pub use poll::PollTallyService;
pub use substrate::{MemorySubstrate, Substrate, SubstrateTxn};
pub use todo::TodoRecordService;
