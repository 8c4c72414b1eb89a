use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use ledger_kernel_core::{
    Address, LedgerError, LedgerRecord, RecordKind, Substrate, SubstrateTxn,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ledger_records (
  address TEXT PRIMARY KEY CHECK (length(address) = 64),
  kind TEXT NOT NULL CHECK (kind IN ('task','poll','candidate')),
  payload_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_records_kind ON ledger_records(kind);
";

/// `SQLite`-backed substrate. Every transaction runs as `BEGIN IMMEDIATE`, so
/// writers on the same database file are serialized even across processes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub record_counts: BTreeMap<String, i64>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed ledger store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Substrate("sqlite connection lock poisoned".to_string()))
    }

    fn lock_admin(&self) -> Result<MutexGuard<'_, Connection>> {
        self.lock().map_err(|err| anyhow!(err))
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.lock_admin()?;
        schema_status_on(&conn)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.lock_admin()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&conn)?;
        if version < 1 {
            let tx = conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )
            .context("failed to record migration version 1")?;
            tx.commit().context("failed to commit migration v1")?;
            debug!("applied ledger schema migration v1");
            version = current_schema_version(&conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run `PRAGMA quick_check` and summarize stored records per kind.
    ///
    /// # Errors
    /// Returns an error when integrity or schema checks cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.lock_admin()?;
        let quick_check_message = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut record_counts = BTreeMap::new();
        if table_exists(&conn, "ledger_records")? {
            let mut stmt = conn
                .prepare("SELECT kind, COUNT(*) FROM ledger_records GROUP BY kind ORDER BY kind")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                record_counts.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
            }
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            record_counts,
            schema_status: schema_status_on(&conn)?,
        })
    }
}

struct SqliteTxn<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl SubstrateTxn for SqliteTxn<'_> {
    fn get(&mut self, address: &Address) -> Result<Option<LedgerRecord>, LedgerError> {
        load_record(self.tx, address)
    }

    fn insert(&mut self, address: &Address, record: LedgerRecord) -> Result<(), LedgerError> {
        let now = timestamp()?;
        let inserted = self
            .tx
            .execute(
                "INSERT OR IGNORE INTO ledger_records(address, kind, payload_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![address.to_hex(), record.kind().as_str(), encode(&record)?, now],
            )
            .map_err(storage_error("failed to insert ledger record"))?;
        if inserted == 0 {
            return Err(LedgerError::AlreadyExists { kind: record.kind(), address: *address });
        }
        Ok(())
    }

    fn replace(&mut self, address: &Address, record: LedgerRecord) -> Result<(), LedgerError> {
        let updated = self
            .tx
            .execute(
                "UPDATE ledger_records SET payload_json = ?2, updated_at = ?3
                 WHERE address = ?1 AND kind = ?4",
                params![address.to_hex(), encode(&record)?, timestamp()?, record.kind().as_str()],
            )
            .map_err(storage_error("failed to update ledger record"))?;
        if updated == 0 {
            return Err(LedgerError::NotFound { kind: record.kind(), address: *address });
        }
        Ok(())
    }

    fn remove(&mut self, kind: RecordKind, address: &Address) -> Result<LedgerRecord, LedgerError> {
        let current =
            load_record(self.tx, address)?.ok_or(LedgerError::NotFound { kind, address: *address })?;
        self.tx
            .execute("DELETE FROM ledger_records WHERE address = ?1", params![address.to_hex()])
            .map_err(storage_error("failed to delete ledger record"))?;
        Ok(current)
    }
}

impl Substrate for SqliteStore {
    fn transact<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn SubstrateTxn) -> Result<T, LedgerError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_error("failed to start transaction"))?;

        // Dropping `tx` on the error path rolls back every staged write.
        let value = op(&mut SqliteTxn { tx: &tx })?;
        tx.commit().map_err(storage_error("failed to commit transaction"))?;
        Ok(value)
    }

    fn fetch(&self, address: &Address) -> Result<Option<LedgerRecord>, LedgerError> {
        let conn = self.lock()?;
        load_record(&conn, address)
    }

    fn fetch_all(&self, kind: RecordKind) -> Result<Vec<(Address, LedgerRecord)>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT address, payload_json FROM ledger_records
                 WHERE kind = ?1
                 ORDER BY address ASC",
            )
            .map_err(storage_error("failed to prepare ledger scan"))?;
        let mut rows =
            stmt.query(params![kind.as_str()]).map_err(storage_error("failed to scan ledger"))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(storage_error("failed to read ledger row"))? {
            let address_raw: String =
                row.get(0).map_err(storage_error("failed to read record address"))?;
            let payload_json: String =
                row.get(1).map_err(storage_error("failed to read record payload"))?;
            records.push((Address::parse_hex(&address_raw)?, decode(&payload_json)?));
        }
        Ok(records)
    }
}

fn load_record(conn: &Connection, address: &Address) -> Result<Option<LedgerRecord>, LedgerError> {
    let payload_json = conn
        .query_row(
            "SELECT payload_json FROM ledger_records WHERE address = ?1",
            params![address.to_hex()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(storage_error("failed to load ledger record"))?;
    payload_json.as_deref().map(decode).transpose()
}

fn encode(record: &LedgerRecord) -> Result<String, LedgerError> {
    serde_json::to_string(record)
        .map_err(|err| LedgerError::Substrate(format!("failed to serialize ledger record: {err}")))
}

fn decode(payload_json: &str) -> Result<LedgerRecord, LedgerError> {
    serde_json::from_str(payload_json)
        .map_err(|err| LedgerError::Substrate(format!("failed to decode stored ledger record: {err}")))
}

fn storage_error(context: &'static str) -> impl Fn(rusqlite::Error) -> LedgerError {
    move |err| LedgerError::Substrate(format!("{context}: {err}"))
}

fn timestamp() -> Result<String, LedgerError> {
    now_rfc3339().map_err(|err| LedgerError::Substrate(format!("{err:#}")))
}

fn schema_status_on(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
