use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use ledger_kernel_core::{
    Address, Addressed, Candidate, Clock, NewPoll, Poll, PollStatus, PollTallyService, Principal,
    SystemClock, TaskRecord, TodoRecordService,
};
use ledger_kernel_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const API_CONTRACT_VERSION: &str = "api.v1";

type SharedClock = Arc<dyn Clock + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateTodoRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// `owner` selects whose task is addressed; it defaults to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateTodoRequest {
    pub title: String,
    #[serde(default)]
    pub owner: Option<Principal>,
    pub description: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteTodoRequest {
    pub title: String,
    #[serde(default)]
    pub owner: Option<Principal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateRequest {
    pub name: String,
    pub poll_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteRequest {
    pub name: String,
    pub poll_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollStatusResult {
    pub poll_id: u64,
    pub status: PollStatus,
    pub now: i64,
}

/// Per-call facade over a `SQLite` ledger file. Every operation opens the
/// store, applies pending migrations, and runs one core service call.
///
/// Domain failures surface as [`ledger_kernel_core::LedgerError`] inside the
/// returned `anyhow::Error`, so transports can downcast to pick a status.
#[derive(Clone)]
pub struct LedgerKernelApi {
    db_path: PathBuf,
    clock: SharedClock,
}

impl fmt::Debug for LedgerKernelApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerKernelApi").field("db_path", &self.db_path).finish_non_exhaustive()
    }
}

impl LedgerKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_clock(db_path, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(db_path: PathBuf, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self { db_path, clock }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn todos(&self) -> Result<TodoRecordService<SqliteStore>> {
        Ok(TodoRecordService::new(self.open_migrated_store()?))
    }

    fn polls(&self) -> Result<PollTallyService<SqliteStore, SharedClock>> {
        Ok(PollTallyService::with_clock(self.open_migrated_store()?, Arc::clone(&self.clock)))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        debug!(after_version = after.current_version, "ledger schema migrated");
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the integrity checks cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the task already exists, its fields are invalid,
    /// or persistence fails.
    pub fn todo_create(
        &self,
        input: CreateTodoRequest,
        caller: &Principal,
    ) -> Result<Addressed<TaskRecord>> {
        Ok(self.todos()?.create(&input.title, &input.description, caller)?)
    }

    /// # Errors
    /// Returns an error when the task is missing, `caller` is not its owner,
    /// or persistence fails.
    pub fn todo_update(
        &self,
        input: UpdateTodoRequest,
        caller: &Principal,
    ) -> Result<Addressed<TaskRecord>> {
        let owner = input.owner.as_ref().unwrap_or(caller);
        Ok(self.todos()?.update(&input.title, owner, &input.description, input.completed, caller)?)
    }

    /// # Errors
    /// Returns an error when the task is missing, `caller` is not its owner,
    /// or persistence fails.
    pub fn todo_delete(
        &self,
        input: DeleteTodoRequest,
        caller: &Principal,
    ) -> Result<Addressed<TaskRecord>> {
        let owner = input.owner.as_ref().unwrap_or(caller);
        Ok(self.todos()?.delete(&input.title, owner, caller)?)
    }

    /// # Errors
    /// Returns an error when the task does not exist.
    pub fn todo_show(&self, title: &str, owner: &Principal) -> Result<Addressed<TaskRecord>> {
        Ok(self.todos()?.get(title, owner)?)
    }

    /// # Errors
    /// Returns an error when no task is stored at `address`.
    pub fn todo_show_by_address(&self, address: &Address) -> Result<Addressed<TaskRecord>> {
        Ok(self.todos()?.get_by_address(address)?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn todo_list(&self, owner: Option<&Principal>) -> Result<Vec<Addressed<TaskRecord>>> {
        Ok(self.todos()?.list(owner)?)
    }

    /// # Errors
    /// Returns an error when the poll exists already, its window is invalid,
    /// or persistence fails.
    pub fn poll_initialize(&self, input: NewPoll) -> Result<Addressed<Poll>> {
        Ok(self.polls()?.initialize_poll(input)?)
    }

    /// # Errors
    /// Returns an error when the poll is missing or full, or the candidate is
    /// already registered.
    pub fn candidate_initialize(&self, input: CandidateRequest) -> Result<Addressed<Candidate>> {
        Ok(self.polls()?.initialize_candidate(&input.name, input.poll_id)?)
    }

    /// # Errors
    /// Returns an error when the poll or candidate is missing, or the poll is
    /// outside its voting window.
    pub fn vote(&self, input: VoteRequest) -> Result<Addressed<Candidate>> {
        Ok(self.polls()?.vote(&input.name, input.poll_id)?)
    }

    /// # Errors
    /// Returns an error when the poll does not exist.
    pub fn poll_show(&self, poll_id: u64) -> Result<Addressed<Poll>> {
        Ok(self.polls()?.get_poll(poll_id)?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn poll_list(&self) -> Result<Vec<Addressed<Poll>>> {
        Ok(self.polls()?.list_polls()?)
    }

    /// # Errors
    /// Returns an error when the poll does not exist.
    pub fn candidate_list(&self, poll_id: u64) -> Result<Vec<Addressed<Candidate>>> {
        Ok(self.polls()?.list_candidates(poll_id)?)
    }

    /// Window state together with the clock reading it was computed from.
    ///
    /// # Errors
    /// Returns an error when the poll does not exist.
    pub fn poll_status(&self, poll_id: u64) -> Result<PollStatusResult> {
        let poll = self.polls()?.get_poll(poll_id)?;
        let now = self.clock.now_millis();
        Ok(PollStatusResult { poll_id, status: poll.record.status_at(now), now })
    }
}
