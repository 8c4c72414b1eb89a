//! Storage seam for the kernel.
//!
//! A [`Substrate`] is an atomically mutable key-value store keyed by
//! [`Address`]. Services group every read-check-write into one
//! [`Substrate::transact`] call; the substrate must apply the staged writes
//! all-or-nothing and serialize transactions touching the same address.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::address::{Address, RecordKind};
use crate::error::LedgerError;
use crate::model::LedgerRecord;

/// Operations available inside one atomic transaction.
pub trait SubstrateTxn {
    /// # Errors
    /// Returns [`LedgerError::Substrate`] when the backing store fails.
    fn get(&mut self, address: &Address) -> Result<Option<LedgerRecord>, LedgerError>;

    /// Create-if-absent.
    ///
    /// # Errors
    /// Returns [`LedgerError::AlreadyExists`] when `address` is occupied.
    fn insert(&mut self, address: &Address, record: LedgerRecord) -> Result<(), LedgerError>;

    /// Overwrite an existing record.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when `address` is empty.
    fn replace(&mut self, address: &Address, record: LedgerRecord) -> Result<(), LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when `address` is empty.
    fn remove(&mut self, kind: RecordKind, address: &Address) -> Result<LedgerRecord, LedgerError>;
}

pub trait Substrate {
    /// Run `op` as one serialized transaction. Writes become visible only when
    /// `op` returns `Ok`; an `Err` discards them.
    ///
    /// # Errors
    /// Returns the error produced by `op`, or [`LedgerError::Substrate`] when the
    /// transaction cannot be started or committed.
    fn transact<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn SubstrateTxn) -> Result<T, LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::Substrate`] when the backing store fails.
    fn fetch(&self, address: &Address) -> Result<Option<LedgerRecord>, LedgerError>;

    /// All records of one kind, ordered by address.
    ///
    /// # Errors
    /// Returns [`LedgerError::Substrate`] when the backing store fails.
    fn fetch_all(&self, kind: RecordKind) -> Result<Vec<(Address, LedgerRecord)>, LedgerError>;
}

impl<S: Substrate> Substrate for Arc<S> {
    fn transact<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn SubstrateTxn) -> Result<T, LedgerError>,
    {
        self.as_ref().transact(op)
    }

    fn fetch(&self, address: &Address) -> Result<Option<LedgerRecord>, LedgerError> {
        self.as_ref().fetch(address)
    }

    fn fetch_all(&self, kind: RecordKind) -> Result<Vec<(Address, LedgerRecord)>, LedgerError> {
        self.as_ref().fetch_all(kind)
    }
}

/// In-process substrate. One mutex serializes every transaction.
#[derive(Debug, Default)]
pub struct MemorySubstrate {
    records: Mutex<BTreeMap<Address, LedgerRecord>>,
}

impl MemorySubstrate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Address, LedgerRecord>>, LedgerError> {
        self.records.lock().map_err(|_| LedgerError::substrate("memory substrate lock poisoned"))
    }
}

struct StagedTxn<'a> {
    committed: &'a BTreeMap<Address, LedgerRecord>,
    // `None` marks a staged removal.
    staged: BTreeMap<Address, Option<LedgerRecord>>,
}

impl SubstrateTxn for StagedTxn<'_> {
    fn get(&mut self, address: &Address) -> Result<Option<LedgerRecord>, LedgerError> {
        match self.staged.get(address) {
            Some(entry) => Ok(entry.clone()),
            None => Ok(self.committed.get(address).cloned()),
        }
    }

    fn insert(&mut self, address: &Address, record: LedgerRecord) -> Result<(), LedgerError> {
        if self.get(address)?.is_some() {
            return Err(LedgerError::AlreadyExists { kind: record.kind(), address: *address });
        }
        self.staged.insert(*address, Some(record));
        Ok(())
    }

    fn replace(&mut self, address: &Address, record: LedgerRecord) -> Result<(), LedgerError> {
        if self.get(address)?.is_none() {
            return Err(LedgerError::NotFound { kind: record.kind(), address: *address });
        }
        self.staged.insert(*address, Some(record));
        Ok(())
    }

    fn remove(&mut self, kind: RecordKind, address: &Address) -> Result<LedgerRecord, LedgerError> {
        let current =
            self.get(address)?.ok_or(LedgerError::NotFound { kind, address: *address })?;
        self.staged.insert(*address, None);
        Ok(current)
    }
}

impl Substrate for MemorySubstrate {
    fn transact<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn SubstrateTxn) -> Result<T, LedgerError>,
    {
        let mut records = self.lock()?;
        let (result, staged) = {
            let mut txn = StagedTxn { committed: &*records, staged: BTreeMap::new() };
            let result = op(&mut txn);
            (result, txn.staged)
        };
        let value = result?;

        for (address, entry) in staged {
            match entry {
                Some(record) => {
                    records.insert(address, record);
                }
                None => {
                    records.remove(&address);
                }
            }
        }
        Ok(value)
    }

    fn fetch(&self, address: &Address) -> Result<Option<LedgerRecord>, LedgerError> {
        Ok(self.lock()?.get(address).cloned())
    }

    fn fetch_all(&self, kind: RecordKind) -> Result<Vec<(Address, LedgerRecord)>, LedgerError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|(_, record)| record.kind() == kind)
            .map(|(address, record)| (*address, record.clone()))
            .collect())
    }
}
