//! Per-owner task records.
//!
//! A task lives at `task_address(title, owner)`. The title is part of the key,
//! so it never changes; renaming is delete + create. Mutations are allowed only
//! for the stored owner.

use tracing::{debug, info, warn};

use crate::address::{task_address, Address, RecordKind};
use crate::auth::{authorize, Principal};
use crate::error::LedgerError;
use crate::model::{check_max_len, Addressed, LedgerRecord, TaskRecord, MAX_TASK_DESCRIPTION_LEN};
use crate::substrate::{Substrate, SubstrateTxn};

pub struct TodoRecordService<S: Substrate> {
    substrate: S,
}

impl<S: Substrate> TodoRecordService<S> {
    pub fn new(substrate: S) -> Self {
        Self { substrate }
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    /// Create a task owned by `caller` with `completed = false`.
    ///
    /// # Errors
    /// Returns [`LedgerError::AlreadyExists`] when `caller` already has a task with
    /// this title, [`LedgerError::InvalidKey`] for a bad title, or
    /// [`LedgerError::Validation`] for an over-long description.
    pub fn create(
        &self,
        title: &str,
        description: &str,
        caller: &Principal,
    ) -> Result<Addressed<TaskRecord>, LedgerError> {
        let address = task_address(title, caller)?;
        check_max_len("description", description, MAX_TASK_DESCRIPTION_LEN)?;
        debug!(%address, owner = %caller, "creating todo item");

        let record = TaskRecord {
            owner: caller.clone(),
            title: title.to_string(),
            description: description.to_string(),
            completed: false,
        };
        self.substrate.transact(|txn| {
            if txn.get(&address)?.is_some() {
                return Err(LedgerError::AlreadyExists { kind: RecordKind::Task, address });
            }
            txn.insert(&address, LedgerRecord::Task(record.clone()))
        })?;

        info!(%address, owner = %caller, "todo item created");
        Ok(Addressed::new(address, record))
    }

    /// Overwrite `description` and `completed` on `owner`'s task.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no such task exists and
    /// [`LedgerError::Unauthorized`] when `caller` is not the stored owner.
    pub fn update(
        &self,
        title: &str,
        owner: &Principal,
        description: &str,
        completed: bool,
        caller: &Principal,
    ) -> Result<Addressed<TaskRecord>, LedgerError> {
        let address = task_address(title, owner)?;
        check_max_len("description", description, MAX_TASK_DESCRIPTION_LEN)?;
        debug!(%address, %caller, "updating todo item");

        let updated = self
            .substrate
            .transact(|txn| {
                let mut task = load_task(txn, &address)?;
                authorize(&address, &task.owner, caller)?;
                task.description = description.to_string();
                task.completed = completed;
                txn.replace(&address, LedgerRecord::Task(task.clone()))?;
                Ok(task)
            })
            .inspect_err(|err| warn!(%address, %caller, code = err.code(), "todo update rejected"))?;

        info!(%address, completed, "todo item updated");
        Ok(Addressed::new(address, updated))
    }

    /// Remove `owner`'s task and return its last state.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no such task exists and
    /// [`LedgerError::Unauthorized`] when `caller` is not the stored owner.
    pub fn delete(
        &self,
        title: &str,
        owner: &Principal,
        caller: &Principal,
    ) -> Result<Addressed<TaskRecord>, LedgerError> {
        let address = task_address(title, owner)?;
        debug!(%address, %caller, "deleting todo item");

        let removed = self
            .substrate
            .transact(|txn| {
                let task = load_task(txn, &address)?;
                authorize(&address, &task.owner, caller)?;
                txn.remove(RecordKind::Task, &address)?;
                Ok(task)
            })
            .inspect_err(|err| warn!(%address, %caller, code = err.code(), "todo delete rejected"))?;

        info!(%address, "todo item deleted");
        Ok(Addressed::new(address, removed))
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when `owner` has no task with this title.
    pub fn get(&self, title: &str, owner: &Principal) -> Result<Addressed<TaskRecord>, LedgerError> {
        let address = task_address(title, owner)?;
        self.get_by_address(&address)
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when nothing is stored at `address`, or
    /// [`LedgerError::Substrate`] when a non-task record lives there.
    pub fn get_by_address(&self, address: &Address) -> Result<Addressed<TaskRecord>, LedgerError> {
        let record = self
            .substrate
            .fetch(address)?
            .ok_or(LedgerError::NotFound { kind: RecordKind::Task, address: *address })?;
        Ok(Addressed::new(*address, record.into_task(address)?))
    }

    /// All tasks, optionally for one owner, ordered by owner then title.
    ///
    /// # Errors
    /// Returns [`LedgerError::Substrate`] when the substrate cannot be read.
    pub fn list(
        &self,
        owner: Option<&Principal>,
    ) -> Result<Vec<Addressed<TaskRecord>>, LedgerError> {
        let mut tasks = Vec::new();
        for (address, record) in self.substrate.fetch_all(RecordKind::Task)? {
            let task = record.into_task(&address)?;
            if owner.is_some_and(|owner| owner != &task.owner) {
                continue;
            }
            tasks.push(Addressed::new(address, task));
        }
        tasks.sort_by(|left, right| {
            (&left.record.owner, &left.record.title).cmp(&(&right.record.owner, &right.record.title))
        });
        Ok(tasks)
    }
}

fn load_task(txn: &mut dyn SubstrateTxn, address: &Address) -> Result<TaskRecord, LedgerError> {
    txn.get(address)?
        .ok_or(LedgerError::NotFound { kind: RecordKind::Task, address: *address })?
        .into_task(address)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;
    use crate::substrate::MemorySubstrate;

    fn principal(raw: &str) -> Principal {
        match Principal::new(raw) {
            Ok(principal) => principal,
            Err(err) => panic!("invalid fixture principal {raw}: {err}"),
        }
    }

    fn service() -> TodoRecordService<MemorySubstrate> {
        TodoRecordService::new(MemorySubstrate::new())
    }

    #[test]
    fn create_then_fetch_starts_incomplete() -> Result<(), LedgerError> {
        let todos = service();
        let alice = principal("alice");

        let created = todos.create("groceries", "milk and eggs", &alice)?;
        let fetched = todos.get("groceries", &alice)?;

        assert_eq!(created, fetched);
        assert_eq!(fetched.record.owner, alice);
        assert_eq!(fetched.record.title, "groceries");
        assert_eq!(fetched.record.description, "milk and eggs");
        assert!(!fetched.record.completed);
        Ok(())
    }

    #[test]
    fn duplicate_create_fails_and_keeps_first_record() -> Result<(), LedgerError> {
        let todos = service();
        let alice = principal("alice");
        todos.create("groceries", "first", &alice)?;

        let err = match todos.create("groceries", "second", &alice) {
            Ok(_) => panic!("duplicate create must fail"),
            Err(err) => err,
        };
        assert!(matches!(err, LedgerError::AlreadyExists { kind: RecordKind::Task, .. }));
        assert_eq!(todos.get("groceries", &alice)?.record.description, "first");
        Ok(())
    }

    #[test]
    fn same_title_for_different_owners_is_independent() -> Result<(), LedgerError> {
        let todos = service();
        let alice_task = todos.create("groceries", "alice's", &principal("alice"))?;
        let bob_task = todos.create("groceries", "bob's", &principal("bob"))?;
        assert_ne!(alice_task.address, bob_task.address);
        Ok(())
    }

    #[test]
    fn owner_can_update_description_and_completion() -> Result<(), LedgerError> {
        let todos = service();
        let alice = principal("alice");
        todos.create("groceries", "milk", &alice)?;

        let updated = todos.update("groceries", &alice, "milk and bread", true, &alice)?;
        assert_eq!(updated.record.description, "milk and bread");
        assert!(updated.record.completed);
        assert_eq!(todos.get("groceries", &alice)?, updated);
        Ok(())
    }

    #[test]
    fn non_owner_update_and_delete_are_unauthorized() -> Result<(), LedgerError> {
        let todos = service();
        let alice = principal("alice");
        let mallory = principal("mallory");
        let original = todos.create("groceries", "milk", &alice)?;

        let update = todos.update("groceries", &alice, "hijacked", true, &mallory);
        assert!(matches!(update, Err(LedgerError::Unauthorized { .. })));
        let delete = todos.delete("groceries", &alice, &mallory);
        assert!(matches!(delete, Err(LedgerError::Unauthorized { .. })));

        assert_eq!(todos.get("groceries", &alice)?, original);
        Ok(())
    }

    #[test]
    fn update_and_delete_of_missing_task_are_not_found() {
        let todos = service();
        let alice = principal("alice");

        assert!(matches!(
            todos.update("missing", &alice, "x", false, &alice),
            Err(LedgerError::NotFound { kind: RecordKind::Task, .. })
        ));
        assert!(matches!(
            todos.delete("missing", &alice, &alice),
            Err(LedgerError::NotFound { kind: RecordKind::Task, .. })
        ));
    }

    #[test]
    fn delete_then_fetch_is_not_found() -> Result<(), LedgerError> {
        let todos = service();
        let alice = principal("alice");
        todos.create("groceries", "milk", &alice)?;

        let removed = todos.delete("groceries", &alice, &alice)?;
        assert_eq!(removed.record.title, "groceries");
        assert!(matches!(todos.get("groceries", &alice), Err(LedgerError::NotFound { .. })));

        // The title is free again once deleted.
        todos.create("groceries", "again", &alice)?;
        Ok(())
    }

    #[test]
    fn create_rejects_bad_keys_and_long_descriptions() {
        let todos = service();
        let alice = principal("alice");

        assert!(matches!(todos.create("", "x", &alice), Err(LedgerError::InvalidKey(_))));
        let long_description = "d".repeat(MAX_TASK_DESCRIPTION_LEN + 1);
        assert!(matches!(
            todos.create("groceries", &long_description, &alice),
            Err(LedgerError::Validation(_))
        ));
        assert!(todos.list(None).map(|tasks| tasks.is_empty()).unwrap_or(false));
    }

    #[test]
    fn list_filters_by_owner_and_orders_by_title() -> Result<(), LedgerError> {
        let todos = service();
        let alice = principal("alice");
        let bob = principal("bob");
        todos.create("zebra", "", &alice)?;
        todos.create("apple", "", &alice)?;
        todos.create("mango", "", &bob)?;

        let all = todos.list(None)?;
        assert_eq!(all.len(), 3);

        let titles = todos
            .list(Some(&alice))?
            .into_iter()
            .map(|task| task.record.title)
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["apple".to_string(), "zebra".to_string()]);
        Ok(())
    }

    #[test]
    fn concurrent_creates_for_same_key_yield_exactly_one_success() {
        const WRITERS: usize = 8;
        let todos = Arc::new(TodoRecordService::new(MemorySubstrate::new()));
        let barrier = Arc::new(Barrier::new(WRITERS));

        let handles = (0..WRITERS)
            .map(|index| {
                let todos = Arc::clone(&todos);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let alice = principal("alice");
                    barrier.wait();
                    todos.create("groceries", &format!("writer {index}"), &alice)
                })
            })
            .collect::<Vec<_>>();

        let mut successes = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.join() {
                Ok(Ok(_)) => successes += 1,
                Ok(Err(LedgerError::AlreadyExists { .. })) => conflicts += 1,
                Ok(Err(err)) => panic!("unexpected error: {err}"),
                Err(_) => panic!("writer thread panicked"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(conflicts, WRITERS - 1);
    }
}
