//! Time-windowed polls and their vote tallies.
//!
//! Candidates may register at any time until the poll's declared capacity is
//! reached; votes are accepted only while `now` lies in `[start_time, end_time)`.
//! Each vote call adds exactly one to the candidate's tally. Voters are not
//! deduplicated.

use tracing::{debug, info, warn};

use crate::address::{candidate_address, poll_address, Address, RecordKind};
use crate::clock::{Clock, SystemClock};
use crate::error::LedgerError;
use crate::model::{Addressed, Candidate, LedgerRecord, NewPoll, Poll, PollStatus};
use crate::substrate::{Substrate, SubstrateTxn};

pub struct PollTallyService<S: Substrate, C: Clock = SystemClock> {
    substrate: S,
    clock: C,
}

impl<S: Substrate> PollTallyService<S, SystemClock> {
    pub fn new(substrate: S) -> Self {
        Self::with_clock(substrate, SystemClock)
    }
}

impl<S: Substrate, C: Clock> PollTallyService<S, C> {
    pub fn with_clock(substrate: S, clock: C) -> Self {
        Self { substrate, clock }
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    /// The id is checked before the request fields, so a taken id reports
    /// `AlreadyExists` even when the window is also invalid.
    ///
    /// # Errors
    /// Returns [`LedgerError::AlreadyExists`] when the poll id is taken,
    /// [`LedgerError::InvalidTimeWindow`] when `start_time >= end_time` and
    /// [`LedgerError::Validation`] when the description is too long.
    pub fn initialize_poll(&self, request: NewPoll) -> Result<Addressed<Poll>, LedgerError> {
        let address = poll_address(request.poll_id);
        debug!(%address, poll_id = request.poll_id, "initializing poll");

        let poll = self
            .substrate
            .transact(|txn| {
                if txn.get(&address)?.is_some() {
                    return Err(LedgerError::AlreadyExists { kind: RecordKind::Poll, address });
                }
                request.validate()?;
                let poll = request.into_poll();
                txn.insert(&address, LedgerRecord::Poll(poll.clone()))?;
                Ok(poll)
            })
            .inspect_err(|err| warn!(%address, code = err.code(), "poll initialization rejected"))?;

        info!(
            %address,
            poll_id = poll.poll_id,
            start_time = poll.start_time,
            end_time = poll.end_time,
            candidate_count = poll.candidate_count,
            "poll initialized"
        );
        Ok(Addressed::new(address, poll))
    }

    /// Register `name` in poll `poll_id` with a zero tally.
    ///
    /// The poll's registration counter is bumped in the same transaction, so the
    /// declared capacity holds under concurrent registrations.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the poll is missing,
    /// [`LedgerError::CandidateLimitExceeded`] when it is full, and
    /// [`LedgerError::AlreadyExists`] when `name` is already registered.
    pub fn initialize_candidate(
        &self,
        name: &str,
        poll_id: u64,
    ) -> Result<Addressed<Candidate>, LedgerError> {
        let poll_addr = poll_address(poll_id);
        let address = candidate_address(name, poll_id)?;
        debug!(%address, poll_id, candidate = name, "initializing candidate");

        let candidate = self
            .substrate
            .transact(|txn| {
                let mut poll = load_poll(txn, &poll_addr)?;
                if !poll.has_candidate_capacity() {
                    return Err(LedgerError::CandidateLimitExceeded {
                        poll_id,
                        candidate_count: poll.candidate_count,
                    });
                }
                if txn.get(&address)?.is_some() {
                    return Err(LedgerError::AlreadyExists { kind: RecordKind::Candidate, address });
                }

                let candidate = Candidate { name: name.to_string(), poll_id, vote_count: 0 };
                txn.insert(&address, LedgerRecord::Candidate(candidate.clone()))?;
                poll.registered_candidates += 1;
                txn.replace(&poll_addr, LedgerRecord::Poll(poll))?;
                Ok(candidate)
            })
            .inspect_err(|err| {
                warn!(%address, poll_id, code = err.code(), "candidate registration rejected");
            })?;

        info!(%address, poll_id, candidate = name, "candidate registered");
        Ok(Addressed::new(address, candidate))
    }

    /// Add one vote to `name` in poll `poll_id`.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the poll or candidate is missing and
    /// [`LedgerError::PollClosed`] when the current time is outside the window.
    pub fn vote(&self, name: &str, poll_id: u64) -> Result<Addressed<Candidate>, LedgerError> {
        let poll_addr = poll_address(poll_id);
        let address = candidate_address(name, poll_id)?;
        let now = self.clock.now_millis();
        debug!(%address, poll_id, now, "casting vote");

        let candidate = self
            .substrate
            .transact(|txn| {
                let poll = load_poll(txn, &poll_addr)?;
                let mut candidate = load_candidate(txn, &address)?;
                if !poll.accepts_votes_at(now) {
                    return Err(LedgerError::PollClosed {
                        poll_id,
                        now,
                        start_time: poll.start_time,
                        end_time: poll.end_time,
                    });
                }
                candidate.vote_count = candidate
                    .vote_count
                    .checked_add(1)
                    .ok_or_else(|| LedgerError::Validation("vote tally overflow".to_string()))?;
                txn.replace(&address, LedgerRecord::Candidate(candidate.clone()))?;
                Ok(candidate)
            })
            .inspect_err(|err| warn!(%address, poll_id, code = err.code(), "vote rejected"))?;

        info!(%address, poll_id, vote_count = candidate.vote_count, "vote tallied");
        Ok(Addressed::new(address, candidate))
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the poll does not exist.
    pub fn get_poll(&self, poll_id: u64) -> Result<Addressed<Poll>, LedgerError> {
        let address = poll_address(poll_id);
        let record = self
            .substrate
            .fetch(&address)?
            .ok_or(LedgerError::NotFound { kind: RecordKind::Poll, address })?;
        Ok(Addressed::new(address, record.into_poll(&address)?))
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the candidate does not exist.
    pub fn get_candidate(
        &self,
        name: &str,
        poll_id: u64,
    ) -> Result<Addressed<Candidate>, LedgerError> {
        let address = candidate_address(name, poll_id)?;
        let record = self
            .substrate
            .fetch(&address)?
            .ok_or(LedgerError::NotFound { kind: RecordKind::Candidate, address })?;
        Ok(Addressed::new(address, record.into_candidate(&address)?))
    }

    /// All polls ordered by id.
    ///
    /// # Errors
    /// Returns [`LedgerError::Substrate`] when the substrate cannot be read.
    pub fn list_polls(&self) -> Result<Vec<Addressed<Poll>>, LedgerError> {
        let mut polls = self
            .substrate
            .fetch_all(RecordKind::Poll)?
            .into_iter()
            .map(|(address, record)| {
                record.into_poll(&address).map(|poll| Addressed::new(address, poll))
            })
            .collect::<Result<Vec<_>, LedgerError>>()?;
        polls.sort_by_key(|poll| poll.record.poll_id);
        Ok(polls)
    }

    /// Candidates of one poll ordered by name.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the poll does not exist.
    pub fn list_candidates(&self, poll_id: u64) -> Result<Vec<Addressed<Candidate>>, LedgerError> {
        self.get_poll(poll_id)?;
        let mut candidates = Vec::new();
        for (address, record) in self.substrate.fetch_all(RecordKind::Candidate)? {
            let candidate = record.into_candidate(&address)?;
            if candidate.poll_id == poll_id {
                candidates.push(Addressed::new(address, candidate));
            }
        }
        candidates.sort_by(|left, right| left.record.name.cmp(&right.record.name));
        Ok(candidates)
    }

    /// Window state of the poll at the current clock reading.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the poll does not exist.
    pub fn poll_status(&self, poll_id: u64) -> Result<PollStatus, LedgerError> {
        let poll = self.get_poll(poll_id)?;
        Ok(poll.record.status_at(self.clock.now_millis()))
    }
}

fn load_poll(txn: &mut dyn SubstrateTxn, address: &Address) -> Result<Poll, LedgerError> {
    txn.get(address)?
        .ok_or(LedgerError::NotFound { kind: RecordKind::Poll, address: *address })?
        .into_poll(address)
}

fn load_candidate(txn: &mut dyn SubstrateTxn, address: &Address) -> Result<Candidate, LedgerError> {
    txn.get(address)?
        .ok_or(LedgerError::NotFound { kind: RecordKind::Candidate, address: *address })?
        .into_candidate(address)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;
    use crate::address::MAX_KEY_PART_LEN;
    use crate::clock::FixedClock;
    use crate::model::MAX_POLL_DESCRIPTION_LEN;
    use crate::substrate::MemorySubstrate;

    const NOW: i64 = 1_700_000_000_000;
    const ONE_DAY_MS: i64 = 1000 * 60 * 60 * 24;

    type TestService = PollTallyService<Arc<MemorySubstrate>, Arc<FixedClock>>;

    fn service() -> (TestService, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(NOW));
        let polls = PollTallyService::with_clock(Arc::new(MemorySubstrate::new()), Arc::clone(&clock));
        (polls, clock)
    }

    fn new_poll(poll_id: u64, candidate_count: u64) -> NewPoll {
        NewPoll {
            poll_id,
            description: "Test Poll".to_string(),
            start_time: NOW,
            end_time: NOW + ONE_DAY_MS,
            candidate_count,
        }
    }

    #[test]
    fn poll_candidate_vote_scenario() -> Result<(), LedgerError> {
        let (polls, _clock) = service();

        polls.initialize_poll(new_poll(1, 2))?;
        let poll = polls.get_poll(1)?;
        assert_eq!(poll.record.poll_id, 1);
        assert_eq!(poll.record.description, "Test Poll");
        assert!(poll.record.start_time < poll.record.end_time);
        assert_eq!(poll.record.candidate_count, 2);

        let first = polls.initialize_candidate("candidate1", 1)?;
        let second = polls.initialize_candidate("candidate2", 1)?;
        assert_eq!(first.record.vote_count, 0);
        assert_eq!(second.record.vote_count, 0);

        polls.vote("candidate1", 1)?;
        assert_eq!(polls.get_candidate("candidate1", 1)?.record.vote_count, 1);
        polls.vote("candidate1", 1)?;
        assert_eq!(polls.get_candidate("candidate1", 1)?.record.vote_count, 2);
        assert_eq!(polls.get_candidate("candidate2", 1)?.record.vote_count, 0);
        Ok(())
    }

    #[test]
    fn initialize_poll_rejects_duplicates_and_bad_windows() -> Result<(), LedgerError> {
        let (polls, _clock) = service();
        polls.initialize_poll(new_poll(1, 2))?;

        let mut duplicate = new_poll(1, 5);
        duplicate.description = "other".to_string();
        assert!(matches!(
            polls.initialize_poll(duplicate),
            Err(LedgerError::AlreadyExists { kind: RecordKind::Poll, .. })
        ));
        assert_eq!(polls.get_poll(1)?.record.candidate_count, 2);

        let mut inverted = new_poll(2, 2);
        inverted.end_time = inverted.start_time;
        assert!(matches!(
            polls.initialize_poll(inverted),
            Err(LedgerError::InvalidTimeWindow { .. })
        ));
        assert!(matches!(polls.get_poll(2), Err(LedgerError::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn taken_poll_id_wins_over_bad_window() -> Result<(), LedgerError> {
        let (polls, _clock) = service();
        polls.initialize_poll(new_poll(1, 2))?;

        let mut retry = new_poll(1, 2);
        retry.end_time = retry.start_time;
        assert!(matches!(
            polls.initialize_poll(retry),
            Err(LedgerError::AlreadyExists { kind: RecordKind::Poll, .. })
        ));

        let mut wordy = new_poll(1, 2);
        wordy.description = "d".repeat(MAX_POLL_DESCRIPTION_LEN + 1);
        assert!(matches!(
            polls.initialize_poll(wordy),
            Err(LedgerError::AlreadyExists { kind: RecordKind::Poll, .. })
        ));
        assert_eq!(polls.get_poll(1)?.record.description, "Test Poll");
        Ok(())
    }

    #[test]
    fn over_long_poll_description_is_rejected() -> Result<(), LedgerError> {
        let (polls, _clock) = service();
        let mut request = new_poll(1, 2);
        request.description = "d".repeat(MAX_POLL_DESCRIPTION_LEN + 1);
        assert!(matches!(polls.initialize_poll(request), Err(LedgerError::Validation(_))));
        assert!(matches!(polls.get_poll(1), Err(LedgerError::NotFound { .. })));
        assert!(polls.list_polls()?.is_empty());

        let mut request = new_poll(1, 2);
        request.description = "d".repeat(MAX_POLL_DESCRIPTION_LEN);
        polls.initialize_poll(request)?;
        Ok(())
    }

    #[test]
    fn candidate_names_must_be_valid_keys() -> Result<(), LedgerError> {
        let (polls, _clock) = service();
        polls.initialize_poll(new_poll(1, 2))?;

        let too_long = "n".repeat(MAX_KEY_PART_LEN + 1);
        assert!(matches!(polls.initialize_candidate("", 1), Err(LedgerError::InvalidKey(_))));
        assert!(matches!(
            polls.initialize_candidate(&too_long, 1),
            Err(LedgerError::InvalidKey(_))
        ));
        assert!(matches!(polls.vote("", 1), Err(LedgerError::InvalidKey(_))));
        assert!(matches!(polls.vote(&too_long, 1), Err(LedgerError::InvalidKey(_))));
        assert_eq!(polls.get_poll(1)?.record.registered_candidates, 0);

        polls.initialize_candidate(&"n".repeat(MAX_KEY_PART_LEN), 1)?;
        Ok(())
    }

    #[test]
    fn candidate_limit_is_enforced() -> Result<(), LedgerError> {
        let (polls, _clock) = service();
        polls.initialize_poll(new_poll(1, 2))?;
        polls.initialize_candidate("candidate1", 1)?;
        polls.initialize_candidate("candidate2", 1)?;

        let err = match polls.initialize_candidate("candidate3", 1) {
            Ok(_) => panic!("third candidate must exceed the limit"),
            Err(err) => err,
        };
        assert_eq!(err, LedgerError::CandidateLimitExceeded { poll_id: 1, candidate_count: 2 });
        assert!(matches!(polls.get_candidate("candidate3", 1), Err(LedgerError::NotFound { .. })));
        assert_eq!(polls.get_poll(1)?.record.registered_candidates, 2);
        Ok(())
    }

    #[test]
    fn duplicate_candidate_does_not_consume_capacity() -> Result<(), LedgerError> {
        let (polls, _clock) = service();
        polls.initialize_poll(new_poll(1, 2))?;
        polls.initialize_candidate("candidate1", 1)?;

        assert!(matches!(
            polls.initialize_candidate("candidate1", 1),
            Err(LedgerError::AlreadyExists { kind: RecordKind::Candidate, .. })
        ));
        assert_eq!(polls.get_poll(1)?.record.registered_candidates, 1);
        polls.initialize_candidate("candidate2", 1)?;
        Ok(())
    }

    #[test]
    fn candidate_registration_requires_poll() {
        let (polls, _clock) = service();
        assert!(matches!(
            polls.initialize_candidate("candidate1", 42),
            Err(LedgerError::NotFound { kind: RecordKind::Poll, .. })
        ));
    }

    #[test]
    fn zero_capacity_poll_accepts_no_candidates() -> Result<(), LedgerError> {
        let (polls, _clock) = service();
        polls.initialize_poll(new_poll(1, 0))?;
        assert!(matches!(
            polls.initialize_candidate("candidate1", 1),
            Err(LedgerError::CandidateLimitExceeded { .. })
        ));
        Ok(())
    }

    #[test]
    fn vote_requires_poll_and_candidate() -> Result<(), LedgerError> {
        let (polls, _clock) = service();
        assert!(matches!(
            polls.vote("candidate1", 1),
            Err(LedgerError::NotFound { kind: RecordKind::Poll, .. })
        ));

        polls.initialize_poll(new_poll(1, 2))?;
        assert!(matches!(
            polls.vote("candidate1", 1),
            Err(LedgerError::NotFound { kind: RecordKind::Candidate, .. })
        ));
        Ok(())
    }

    #[test]
    fn vote_outside_window_is_rejected_without_changing_tally() -> Result<(), LedgerError> {
        let (polls, clock) = service();
        polls.initialize_poll(new_poll(1, 2))?;
        polls.initialize_candidate("candidate1", 1)?;
        polls.vote("candidate1", 1)?;

        clock.set(NOW - 1);
        assert!(matches!(polls.vote("candidate1", 1), Err(LedgerError::PollClosed { .. })));
        assert_eq!(polls.poll_status(1)?, PollStatus::Pending);

        clock.set(NOW + ONE_DAY_MS);
        let err = match polls.vote("candidate1", 1) {
            Ok(_) => panic!("vote at end_time must be rejected"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "poll_closed");
        assert_eq!(polls.poll_status(1)?, PollStatus::Closed);
        assert_eq!(polls.get_candidate("candidate1", 1)?.record.vote_count, 1);
        Ok(())
    }

    #[test]
    fn candidates_can_register_after_poll_closes() -> Result<(), LedgerError> {
        let (polls, clock) = service();
        polls.initialize_poll(new_poll(1, 2))?;
        clock.advance(2 * ONE_DAY_MS);
        polls.initialize_candidate("late", 1)?;
        Ok(())
    }

    #[test]
    fn list_candidates_is_scoped_to_poll_and_sorted() -> Result<(), LedgerError> {
        let (polls, _clock) = service();
        polls.initialize_poll(new_poll(1, 3))?;
        polls.initialize_poll(new_poll(2, 3))?;
        polls.initialize_candidate("zed", 1)?;
        polls.initialize_candidate("amy", 1)?;
        polls.initialize_candidate("bob", 2)?;

        let names = polls
            .list_candidates(1)?
            .into_iter()
            .map(|candidate| candidate.record.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["amy".to_string(), "zed".to_string()]);

        let ids = polls.list_polls()?.into_iter().map(|poll| poll.record.poll_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
        assert!(matches!(polls.list_candidates(3), Err(LedgerError::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn concurrent_votes_are_not_lost() -> Result<(), LedgerError> {
        const VOTERS: usize = 8;
        const VOTES_PER_VOTER: usize = 25;

        let (polls, _clock) = service();
        polls.initialize_poll(new_poll(1, 2))?;
        polls.initialize_candidate("candidate1", 1)?;

        let polls = Arc::new(polls);
        let barrier = Arc::new(Barrier::new(VOTERS));
        let handles = (0..VOTERS)
            .map(|_| {
                let polls = Arc::clone(&polls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || -> Result<(), LedgerError> {
                    barrier.wait();
                    for _ in 0..VOTES_PER_VOTER {
                        polls.vote("candidate1", 1)?;
                    }
                    Ok(())
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => panic!("voter thread panicked"),
            }
        }

        let expected = u64::try_from(VOTERS * VOTES_PER_VOTER).unwrap_or(u64::MAX);
        assert_eq!(polls.get_candidate("candidate1", 1)?.record.vote_count, expected);
        Ok(())
    }

    #[test]
    fn concurrent_registrations_respect_capacity() -> Result<(), LedgerError> {
        const REGISTRANTS: usize = 10;

        let (polls, _clock) = service();
        polls.initialize_poll(new_poll(1, 3))?;

        let polls = Arc::new(polls);
        let barrier = Arc::new(Barrier::new(REGISTRANTS));
        let handles = (0..REGISTRANTS)
            .map(|index| {
                let polls = Arc::clone(&polls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    polls.initialize_candidate(&format!("candidate{index}"), 1)
                })
            })
            .collect::<Vec<_>>();

        let mut registered = 0;
        for handle in handles {
            match handle.join() {
                Ok(Ok(_)) => registered += 1,
                Ok(Err(LedgerError::CandidateLimitExceeded { .. })) => {}
                Ok(Err(err)) => panic!("unexpected error: {err}"),
                Err(_) => panic!("registrant thread panicked"),
            }
        }
        assert_eq!(registered, 3);
        assert_eq!(polls.list_candidates(1)?.len(), 3);
        Ok(())
    }
}
